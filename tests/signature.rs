//! Weak signature round trips and tamper detection

use squall::{AddFileOptions, Archive, CreateOptions, SignatureStatus};

#[test]
fn test_unsigned_archive_reports_no_signature() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.mpq");

    let mut archive = Archive::create(&path).unwrap();
    archive
        .add_file_data("payload.bin", b"some bytes", AddFileOptions::new())
        .unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(
        archive.verify_signature().unwrap(),
        SignatureStatus::NoSignature
    );
}

#[test]
fn test_weak_signature_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.mpq");

    let mut archive = CreateOptions::new().signature(true).create(&path).unwrap();
    archive
        .add_file_data(
            "payload.bin",
            &vec![0x77u8; 5000],
            AddFileOptions::new().compression(0),
        )
        .unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert!(archive.has_file("(signature)"));
    assert_eq!(archive.verify_signature().unwrap(), SignatureStatus::WeakOk);
}

#[test]
fn test_weak_signature_detects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.mpq");

    let mut archive = CreateOptions::new().signature(true).create(&path).unwrap();
    archive
        .add_file_data(
            "payload.bin",
            &vec![0x77u8; 5000],
            AddFileOptions::new().compression(0),
        )
        .unwrap();
    archive.close().unwrap();

    // Flip one stored payload byte; the file is stored raw so this is
    // outside the signature region but inside the hashed region.
    let info = Archive::open(&path).unwrap().file_info("payload.bin").unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[info.file_pos as usize + 100] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(
        archive.verify_signature().unwrap(),
        SignatureStatus::WeakError
    );
}

#[test]
fn test_verify_archive_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.mpq");

    let mut archive = CreateOptions::new().signature(true).create(&path).unwrap();
    archive
        .add_file_data("a.bin", &vec![1u8; 3000], AddFileOptions::new())
        .unwrap();
    archive
        .add_file_data("b.bin", &vec![2u8; 3000], AddFileOptions::new())
        .unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    let report = archive.verify_archive().unwrap();
    assert_eq!(report.signature, SignatureStatus::WeakOk);
    assert!(report.failed_files.is_empty(), "{:?}", report.failed_files);
}

#[test]
fn test_signing_an_existing_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.mpq");

    let mut archive = Archive::create(&path).unwrap();
    archive
        .add_file_data("payload.bin", b"unsigned at first", AddFileOptions::new())
        .unwrap();
    archive.sign_weak().unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.verify_signature().unwrap(), SignatureStatus::WeakOk);

    // The payload must still read back fine next to the signature
    assert_eq!(
        archive.read_file("payload.bin").unwrap(),
        b"unsigned at first"
    );
}
