//! Stream provider composition: partial and bitmap mirrors over a
//! master, download callbacks, and archives read through them

use squall::stream::{Stream, StreamFlags};
use squall::{AddFileOptions, Archive};
use std::cell::RefCell;
use std::rc::Rc;

fn master_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7) % 253) as u8).collect()
}

#[test]
fn test_partial_mirror_equals_master() {
    let dir = tempfile::tempdir().unwrap();
    let master_path = dir.path().join("master.mpq");
    let local_path = dir.path().join("local.mpq.part");

    let data = master_bytes(200_000);
    std::fs::write(&master_path, &data).unwrap();

    let url = format!("part-{}*{}", local_path.display(), master_path.display());
    let mut stream = Stream::open(&url, StreamFlags::empty()).unwrap();

    // Any byte range equals the same range read from the master
    for (offset, len) in [(0usize, 1000usize), (65_000, 33_000), (199_000, 1_000)] {
        let mut buf = vec![0u8; len];
        stream.read(offset as u64, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[offset..offset + len], "range at {}", offset);
    }
}

#[test]
fn test_bitmap_mirror_equals_master() {
    let dir = tempfile::tempdir().unwrap();
    let master_path = dir.path().join("master.mpq");
    let local_path = dir.path().join("mirror.mpq");

    let data = master_bytes(150_000);
    std::fs::write(&master_path, &data).unwrap();

    let mut stream =
        Stream::open_mirror(&local_path, &master_path.display().to_string()).unwrap();
    for (offset, len) in [(10usize, 50usize), (40_000, 70_000), (149_000, 1_000)] {
        let mut buf = vec![0u8; len];
        stream.read(offset as u64, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[offset..offset + len], "range at {}", offset);
    }
}

#[test]
fn test_download_callback_per_missing_run() {
    let dir = tempfile::tempdir().unwrap();
    let master_path = dir.path().join("master.mpq");
    let local_path = dir.path().join("mirror.mpq");

    let data = master_bytes(0x10000);
    std::fs::write(&master_path, &data).unwrap();

    let mut stream =
        Stream::open_mirror(&local_path, &master_path.display().to_string()).unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    stream.set_progress_callback(Some(Box::new(move |offset, length| {
        sink.borrow_mut().push((offset, length));
    })));

    // First read: everything is missing, one run plus the terminator
    let mut buf = vec![0u8; 0x8000];
    stream.read(0, &mut buf).unwrap();
    {
        let log = events.borrow();
        assert_eq!(log.len(), 2, "one missing-run event and one terminator");
        assert_eq!(log[0].0, 0);
        assert!(log[0].1 >= 0x8000);
        assert_eq!(*log.last().unwrap(), (0, 0));
    }

    // Second read of the same range: nothing missing, no events
    events.borrow_mut().clear();
    stream.read(0, &mut buf).unwrap();
    assert!(events.borrow().is_empty());
}

#[test]
fn test_fetched_blocks_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let master_path = dir.path().join("master.mpq");
    let local_path = dir.path().join("mirror.mpq");

    let data = master_bytes(0x20000);
    std::fs::write(&master_path, &data).unwrap();

    {
        let mut stream =
            Stream::open_mirror(&local_path, &master_path.display().to_string()).unwrap();
        let mut buf = vec![0u8; 0x4000];
        stream.read(0x4000, &mut buf).unwrap();
        stream.close().unwrap();
    }

    // Reopen: the fetched range is served locally (no download events),
    // an unfetched one still goes to the master.
    let mut stream =
        Stream::open_mirror(&local_path, &master_path.display().to_string()).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    stream.set_progress_callback(Some(Box::new(move |offset, length| {
        sink.borrow_mut().push((offset, length));
    })));

    let mut buf = vec![0u8; 0x4000];
    stream.read(0x4000, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[0x4000..0x8000]);
    assert!(events.borrow().is_empty(), "fetched blocks must persist");

    stream.read(0x10000, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[0x10000..0x14000]);
    assert!(!events.borrow().is_empty());
}

#[test]
fn test_archive_read_through_partial_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let master_path = dir.path().join("master.mpq");
    let local_path = dir.path().join("local.mpq.part");

    let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 240) as u8).collect();
    {
        let mut archive = Archive::create(&master_path).unwrap();
        archive
            .add_file_data("big.bin", &payload, AddFileOptions::new())
            .unwrap();
        archive.close().unwrap();
    }

    let url = format!("part-{}*{}", local_path.display(), master_path.display());
    let mut archive = Archive::open_url(&url).unwrap();
    assert!(archive.is_read_only());
    assert_eq!(archive.read_file("big.bin").unwrap(), payload);
}

#[test]
fn test_http_master_is_a_stub() {
    // The HTTP provider only exists as a contract: reads fail with the
    // incomplete-file error, so a mirror over it cannot be populated.
    let dir = tempfile::tempdir().unwrap();
    let local_path = dir.path().join("mirror.mpq");

    let result = Stream::open_mirror(&local_path, "http://updates.invalid/archive.mpq");
    assert!(result.is_err());
}

#[test]
fn test_map_provider_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapped.bin");
    let data = master_bytes(5_000);
    std::fs::write(&path, &data).unwrap();

    #[cfg(feature = "mmap")]
    {
        let mut stream =
            Stream::open(&format!("map:{}", path.display()), StreamFlags::empty()).unwrap();
        let mut buf = vec![0u8; 100];
        stream.read(2_000, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[2_000..2_100]);
        assert!(stream.is_read_only());
    }
}
