//! Integration tests exercising the full open → navigate → mutate →
//! commit → reopen lifecycle over in-memory buffers.

use std::io::Cursor;

use ole::{CompoundFile, EntryKind, OpenOptions};

fn commit_and_reopen(mut cf: CompoundFile<Cursor<Vec<u8>>>) -> CompoundFile<Cursor<Vec<u8>>> {
    let mut target = Cursor::new(Vec::new());
    cf.save(&mut target).unwrap();
    CompoundFile::open(target, OpenOptions::default()).unwrap()
}

#[test]
fn round_trip_preserves_nested_storage_and_stream() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        let mut storage = root.add_storage("MyStorage").unwrap();
        let mut stream = storage.add_stream("s1").unwrap();
        stream.set_data(&[0x00, 0x01, 0x02, 0x03]).unwrap();
    }
    let mut reopened = commit_and_reopen(cf);

    let mut root = reopened.root_storage();
    assert!(root.exists_storage("MyStorage"));
    let mut storage = root.get_storage("MyStorage").unwrap();
    assert!(storage.exists_stream("s1"));
    let mut stream = storage.get_stream("s1").unwrap();
    assert_eq!(stream.size(), 4);
    assert_eq!(stream.get_data().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn round_trip_twice_is_idempotent() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("Workbook").unwrap();
        stream.set_data(&vec![0x42u8; 9000]).unwrap();
    }
    let mut once = commit_and_reopen(cf);
    assert_eq!(once.root_storage().get_stream("Workbook").unwrap().size(), 9000);
    let mut twice = commit_and_reopen(once);
    let mut stream = twice.root_storage().get_stream("Workbook").unwrap();
    assert_eq!(stream.size(), 9000);
    assert_eq!(stream.get_data().unwrap(), vec![0x42u8; 9000]);
}

#[test]
fn large_stream_promotes_to_normal_residency_and_survives_commit() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("Workbook").unwrap();
        stream.set_data(&vec![0xABu8; 8192]).unwrap();
    }
    let mut reopened = commit_and_reopen(cf);
    let mut stream = reopened.root_storage().get_stream("Workbook").unwrap();
    assert_eq!(stream.size(), 8192);
    assert_eq!(stream.get_data().unwrap(), vec![0xABu8; 8192]);
}

#[test]
fn duplicate_name_and_invalid_name_are_rejected() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    let mut root = cf.root_storage();
    root.add_stream("dup").unwrap();
    assert!(root.add_stream("dup").is_err());
    assert!(root.add_stream("bad/name").is_err());
}

#[test]
fn get_all_named_entries_is_flat_and_hierarchy_independent() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        root.add_stream("ObjectPool").unwrap();
        let mut storage = root.add_storage("Nested").unwrap();
        storage.add_stream("ObjectPool").unwrap();
    }
    let matches = cf.get_all_named_entries("ObjectPool");
    assert_eq!(matches.len(), 2);
}

#[test]
fn append_across_cutoff_promotes_and_preserves_bytes() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.add_stream("s1").unwrap();
    stream.set_data(&[1, 2, 3]).unwrap();
    stream.append_data(&vec![9u8; 5000]).unwrap();
    assert_eq!(stream.size(), 5003);
    let mut data = stream.get_data().unwrap();
    assert_eq!(&data[..3], &[1, 2, 3]);
    data.drain(..3);
    assert_eq!(data, vec![9u8; 5000]);
}

#[test]
fn enumerate_children_reflects_length_first_ordering_after_reopen() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        root.add_stream("zzz").unwrap();
        root.add_stream("a").unwrap();
        root.add_stream("bb").unwrap();
    }
    let mut reopened = commit_and_reopen(cf);
    let names: Vec<String> = reopened
        .root_storage()
        .enumerate_children()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["a", "bb", "zzz"]);
}

#[test]
fn visit_entries_distinguishes_storage_from_stream() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        root.add_storage("AStorage").unwrap();
        root.add_stream("AStream").unwrap();
    }
    let mut root = cf.root_storage();
    let mut kinds = Vec::new();
    root.visit_entries(false, &mut |e| kinds.push((e.name.clone(), e.kind)));
    assert!(kinds.contains(&("AStorage".to_string(), EntryKind::Storage)));
    assert!(kinds.contains(&("AStream".to_string(), EntryKind::Stream)));
}

#[test]
fn read_only_compound_file_forbids_commit() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 3, OpenOptions::read_only()).unwrap();
    assert!(cf.commit(false).is_err());
}

#[test]
fn v4_file_round_trips_with_larger_sectors() {
    let mut cf = CompoundFile::create(Cursor::new(Vec::new()), 4, OpenOptions::default()).unwrap();
    {
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("big").unwrap();
        stream.set_data(&vec![0x7Eu8; 20_000]).unwrap();
    }
    let mut reopened = commit_and_reopen(cf);
    assert_eq!(reopened.major_version(), 4);
    let mut stream = reopened.root_storage().get_stream("big").unwrap();
    assert_eq!(stream.get_data().unwrap(), vec![0x7Eu8; 20_000]);
}
