//! Archive-level round trips: every codec, encryption, key recovery,
//! and sector checksum behavior

use pretty_assertions::assert_eq;
use squall::compression::methods;
use squall::{AddFileOptions, Archive, Error, OpenOptions};

fn compressible_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i / 64) % 251) as u8).collect()
}

fn archive_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("t.mpq")
}

fn round_trip_with(options: AddFileOptions, data: &[u8]) {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_path(&dir);

    let mut archive = Archive::create(&path).unwrap();
    archive.add_file_data("payload.bin", data, options).unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert!(archive.has_file("payload.bin"));
    let read_back = archive.read_file("payload.bin").unwrap();
    assert_eq!(read_back, data, "content mismatch after reopen");
}

#[test]
fn test_store_uncompressed() {
    round_trip_with(
        AddFileOptions::new().compression(0),
        &compressible_payload(10_000),
    );
}

#[test]
fn test_zlib() {
    round_trip_with(
        AddFileOptions::new().compression(methods::ZLIB),
        &compressible_payload(20_000),
    );
}

#[test]
fn test_bzip2() {
    round_trip_with(
        AddFileOptions::new().compression(methods::BZIP2),
        &compressible_payload(20_000),
    );
}

#[test]
fn test_sparse() {
    let mut data = vec![0u8; 20_000];
    data[5000..5100].copy_from_slice(&[0xAB; 100]);
    round_trip_with(AddFileOptions::new().compression(methods::SPARSE), &data);
}

#[test]
fn test_lzma() {
    round_trip_with(
        AddFileOptions::new().compression(methods::LZMA),
        &compressible_payload(20_000),
    );
}

#[test]
fn test_pkware() {
    // There is no imploder, so the data lands stored; the flag path
    // must still round-trip.
    round_trip_with(
        AddFileOptions::new().compression(methods::PKWARE),
        &compressible_payload(9_000),
    );
}

#[test]
fn test_sparse_zlib_chain() {
    let mut data = vec![0u8; 30_000];
    for i in (0..30_000).step_by(200) {
        data[i] = (i / 200) as u8;
    }
    round_trip_with(
        AddFileOptions::new().compression(methods::SPARSE | methods::ZLIB),
        &data,
    );
}

#[test]
fn test_incompressible_data() {
    // Pseudo-random data gets stored raw despite the compression request
    let mut state = 0xACE1u32;
    let data: Vec<u8> = (0..10_000)
        .map(|_| {
            state = state.wrapping_mul(48271) % 0x7FFFFFFF;
            (state >> 7) as u8
        })
        .collect();
    round_trip_with(AddFileOptions::new().compression(methods::ZLIB), &data);
}

#[test]
fn test_empty_file() {
    round_trip_with(AddFileOptions::new(), &[]);
}

#[test]
fn test_one_byte_file() {
    round_trip_with(AddFileOptions::new(), &[0x42]);
}

#[test]
fn test_exact_sector_multiple() {
    // 4096-byte sectors by default; exercise the exact-fit path
    round_trip_with(AddFileOptions::new(), &compressible_payload(8192));
}

#[test]
fn test_encrypted() {
    round_trip_with(
        AddFileOptions::new().compression(methods::ZLIB).encrypt(true),
        &compressible_payload(20_000),
    );
}

#[test]
fn test_encrypted_fix_key() {
    round_trip_with(
        AddFileOptions::new().compression(methods::ZLIB).fix_key(true),
        &compressible_payload(20_000),
    );
}

#[test]
fn test_encrypted_uncompressed() {
    round_trip_with(
        AddFileOptions::new().compression(0).encrypt(true),
        &compressible_payload(10_000),
    );
}

#[test]
fn test_single_unit() {
    round_trip_with(
        AddFileOptions::new().compression(methods::ZLIB).single_unit(true),
        &compressible_payload(3_000),
    );
}

#[test]
fn test_single_unit_encrypted() {
    round_trip_with(
        AddFileOptions::new()
            .compression(methods::ZLIB)
            .single_unit(true)
            .encrypt(true),
        &compressible_payload(3_000),
    );
}

#[test]
fn test_key_recovery_without_name() {
    // An encrypted multi-sector file must be readable again through the
    // 256-trial key detection when no name is available.
    let dir = tempfile::tempdir().unwrap();
    let path = archive_path(&dir);
    let data = compressible_payload(10_000);

    let mut archive = Archive::create(&path).unwrap();
    archive
        .add_file_data(
            "secret.dat",
            &data,
            AddFileOptions::new().compression(methods::ZLIB).encrypt(true),
        )
        .unwrap();
    archive.close().unwrap();

    // No listfile: the entry has no name in this session
    let mut archive = OpenOptions::new()
        .load_listfile(false)
        .load_attributes(false)
        .open(&path)
        .unwrap();

    let nameless: Vec<_> = archive
        .list()
        .into_iter()
        .filter(|info| info.name.starts_with("File"))
        .collect();
    assert_eq!(nameless.len(), 1, "expected exactly one unnamed entry");

    let mut reader = archive.open_file_by_index(nameless[0].index).unwrap();
    assert_ne!(reader.file_key(), 0);
    assert_eq!(reader.read_all().unwrap(), data);
}

#[test]
fn test_sector_crc_detects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_path(&dir);
    let data = compressible_payload(12_000);

    let mut archive = Archive::create(&path).unwrap();
    archive
        .add_file_data(
            "checked.bin",
            &data,
            AddFileOptions::new()
                .compression(methods::ZLIB)
                .sector_crc(true),
        )
        .unwrap();
    archive.close().unwrap();

    // Locate the raw sector data: the sector table for three 4 KiB
    // sectors plus the checksum entry is 20 bytes long.
    let info = Archive::open(&path).unwrap().file_info("checked.bin").unwrap();
    let sector_data_at = info.file_pos + 20;

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[sector_data_at as usize + 4] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let mut archive = Archive::open(&path).unwrap();
    match archive.read_file("checked.bin") {
        Err(Error::ChecksumError(_)) => {}
        other => panic!("expected ChecksumError, got {:?}", other.map(|v| v.len())),
    }
}

#[test]
fn test_sector_crc_ok_when_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_path(&dir);
    let data = compressible_payload(12_000);

    let mut archive = Archive::create(&path).unwrap();
    archive
        .add_file_data(
            "checked.bin",
            &data,
            AddFileOptions::new()
                .compression(methods::ZLIB)
                .sector_crc(true),
        )
        .unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.read_file("checked.bin").unwrap(), data);

    let verdict = archive.verify_file("checked.bin").unwrap();
    assert_eq!(verdict.sector_crc_ok, Some(true));
    assert_eq!(verdict.crc32_ok, Some(true));
    assert_eq!(verdict.md5_ok, Some(true));
}

#[test]
fn test_multiple_files_and_locales() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_path(&dir);

    let mut archive = Archive::create(&path).unwrap();
    archive
        .add_file_data("ui.txt", b"neutral", AddFileOptions::new())
        .unwrap();
    archive
        .add_file_data("ui.txt", b"english", AddFileOptions::new().locale(0x409))
        .unwrap();
    archive.close().unwrap();

    let mut archive = Archive::open(&path).unwrap();
    assert_eq!(archive.read_file_locale("ui.txt", 0x409).unwrap(), b"english");
    assert_eq!(archive.read_file_locale("ui.txt", 0).unwrap(), b"neutral");
    // Unknown locale falls back to neutral
    assert_eq!(archive.read_file_locale("ui.txt", 0x40C).unwrap(), b"neutral");
}
