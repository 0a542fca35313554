//! Public storage/stream façade. Handles are lightweight:
//! `{&mut CompoundFile<B>, dir_sid}`, resolved through the flat
//! directory vector on every call rather than carrying their own state.

use std::io::{Read, Seek, Write};

use crate::cfb::CompoundFile;
use crate::directory::{DirectoryEntry, ObjectType};
use crate::error::Result;

/// Whether a named directory entry is a storage or a stream, as surfaced
/// by [`Storage::enumerate_children`]/[`Storage::visit_entries`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Storage,
    Stream,
}

/// A shallow, read-only summary of one directory entry, independent of
/// any borrow on the owning [`CompoundFile`].
#[derive(Clone, Debug)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

impl EntryInfo {
    fn from_entry(entry: &DirectoryEntry) -> Self {
        EntryInfo {
            name: entry.name.clone(),
            kind: match entry.object_type {
                ObjectType::Storage => EntryKind::Storage,
                _ => EntryKind::Stream,
            },
            size: entry.size,
        }
    }
}

/// A handle onto one storage (directory node) inside a [`CompoundFile`].
/// Invalid after the owning engine is closed.
pub struct Storage<'a, B> {
    cf: &'a mut CompoundFile<B>,
    sid: u32,
}

impl<'a, B: Read + Write + Seek> Storage<'a, B> {
    pub(crate) fn new(cf: &'a mut CompoundFile<B>, sid: u32) -> Self {
        Storage { cf, sid }
    }

    pub fn name(&self) -> &str {
        &self.cf.entry(self.sid).name
    }

    pub fn exists_stream(&self, name: &str) -> bool {
        self.cf
            .child_sid(self.sid, name)
            .is_some_and(|sid| self.cf.entry(sid).object_type == ObjectType::Stream)
    }

    pub fn exists_storage(&self, name: &str) -> bool {
        self.cf
            .child_sid(self.sid, name)
            .is_some_and(|sid| self.cf.entry(sid).object_type == ObjectType::Storage)
    }

    pub fn get_stream(&mut self, name: &str) -> Result<Stream<'_, B>> {
        let sid = self.cf.lookup_child(self.sid, name, false)?;
        Ok(Stream::new(self.cf, sid))
    }

    pub fn get_storage(&mut self, name: &str) -> Result<Storage<'_, B>> {
        let sid = self.cf.lookup_child(self.sid, name, true)?;
        Ok(Storage::new(self.cf, sid))
    }

    pub fn add_stream(&mut self, name: &str) -> Result<Stream<'_, B>> {
        let sid = self.cf.add_child(self.sid, DirectoryEntry::new_stream(name))?;
        Ok(Stream::new(self.cf, sid))
    }

    pub fn add_storage(&mut self, name: &str) -> Result<Storage<'_, B>> {
        let sid = self.cf.add_child(self.sid, DirectoryEntry::new_storage(name))?;
        Ok(Storage::new(self.cf, sid))
    }

    /// Direct children, in ascending name order.
    pub fn enumerate_children(&self) -> Vec<EntryInfo> {
        self.cf
            .enumerate_children(self.sid)
            .into_iter()
            .map(|sid| EntryInfo::from_entry(self.cf.entry(sid)))
            .collect()
    }

    /// Walk this storage's children, optionally descending into
    /// sub-storages, calling `visitor` for every entry in ascending name
    /// order at each level.
    pub fn visit_entries(&mut self, recursive: bool, visitor: &mut dyn FnMut(&EntryInfo)) {
        self.cf.visit_entries(self.sid, recursive, &mut |_sid, entry| {
            visitor(&EntryInfo::from_entry(entry));
        });
    }
}

/// A handle onto one stream (leaf) inside a [`CompoundFile`]. Invalid
/// after the owning engine is closed.
pub struct Stream<'a, B> {
    cf: &'a mut CompoundFile<B>,
    sid: u32,
}

impl<'a, B: Read + Write + Seek> Stream<'a, B> {
    pub(crate) fn new(cf: &'a mut CompoundFile<B>, sid: u32) -> Self {
        Stream { cf, sid }
    }

    pub fn name(&self) -> &str {
        &self.cf.entry(self.sid).name
    }

    pub fn size(&self) -> u64 {
        self.cf.entry(self.sid).size
    }

    /// Read the whole stream.
    pub fn get_data(&mut self) -> Result<Vec<u8>> {
        self.cf.read_stream_data(self.sid, 0, None)
    }

    /// Partial read starting at `offset`, at most `count` bytes.
    pub fn get_data_range(&mut self, offset: u64, count: u64) -> Result<Vec<u8>> {
        self.cf.read_stream_data(self.sid, offset, Some(count))
    }

    /// Replace the stream's entire contents.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        self.cf.set_stream_data(self.sid, data)
    }

    /// Append to the stream's contents, promoting mini → normal residency
    /// if the new total crosses the cutoff.
    pub fn append_data(&mut self, data: &[u8]) -> Result<()> {
        self.cf.append_stream_data(self.sid, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenOptions;
    use std::io::Cursor;

    fn new_file() -> CompoundFile<Cursor<Vec<u8>>> {
        CompoundFile::create(
            Cursor::new(Vec::new()),
            crate::constants::MAJOR_VERSION_3_VALUE,
            OpenOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn add_and_read_back_nested_stream() {
        let mut cf = new_file();
        {
            let mut root = cf.root_storage();
            let mut storage = root.add_storage("MyStorage").unwrap();
            let mut stream = storage.add_stream("s1").unwrap();
            stream.set_data(&[0x00, 0x01, 0x02, 0x03]).unwrap();
        }
        let mut root = cf.root_storage();
        assert!(root.exists_storage("MyStorage"));
        assert!(!root.exists_stream("MyStorage"));
        let mut storage = root.get_storage("MyStorage").unwrap();
        assert!(storage.exists_stream("s1"));
        let mut stream = storage.get_stream("s1").unwrap();
        assert_eq!(stream.size(), 4);
        assert_eq!(stream.get_data().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn partial_read_respects_offset_and_count() {
        let mut cf = new_file();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("s1").unwrap();
        stream.set_data(b"0123456789").unwrap();
        assert_eq!(stream.get_data_range(3, 4).unwrap(), b"3456");
        assert_eq!(stream.get_data_range(8, 10).unwrap(), b"89");
    }

    #[test]
    fn enumerate_children_is_name_ordered() {
        let mut cf = new_file();
        let mut root = cf.root_storage();
        root.add_stream("zzz").unwrap();
        root.add_stream("a").unwrap();
        root.add_stream("bb").unwrap();
        let names: Vec<String> = root.enumerate_children().into_iter().map(|e| e.name).collect();
        // length-first ordering: "a" < "bb" < "zzz"
        assert_eq!(names, vec!["a", "bb", "zzz"]);
    }

    #[test]
    fn visit_entries_recurses_into_storages() {
        let mut cf = new_file();
        {
            let mut root = cf.root_storage();
            let mut storage = root.add_storage("Outer").unwrap();
            storage.add_stream("inner").unwrap();
            root.add_stream("top").unwrap();
        }
        let mut root = cf.root_storage();
        let mut seen = Vec::new();
        root.visit_entries(true, &mut |info| seen.push(info.name.clone()));
        assert!(seen.contains(&"Outer".to_string()));
        assert!(seen.contains(&"inner".to_string()));
        assert!(seen.contains(&"top".to_string()));
    }
}
