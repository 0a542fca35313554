//! Lazily-materialised sector storage. A [`SectorCollection`] owns every
//! normal sector in the file, indexed by sector id (SID); bytes are read
//! from the backing stream on first touch and released on demand.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorKind {
    Normal,
    Fat,
    Difat,
    Directory,
    RangeLock,
}

pub struct Sector {
    pub id: u32,
    pub size: usize,
    pub kind: SectorKind,
    bytes: Option<Vec<u8>>,
    pub dirty: bool,
}

impl Sector {
    pub fn new(id: u32, size: usize, kind: SectorKind) -> Self {
        Sector {
            id,
            size,
            kind,
            bytes: None,
            dirty: false,
        }
    }

    pub fn zeroed(id: u32, size: usize, kind: SectorKind) -> Self {
        Sector {
            id,
            size,
            kind,
            bytes: Some(vec![0u8; size]),
            dirty: true,
        }
    }

    /// Byte offset of this sector in the backing stream (header occupies
    /// the first `size` bytes, so sector 0 starts right after it).
    pub fn offset(&self) -> u64 {
        self.size as u64 + self.id as u64 * self.size as u64
    }

    pub fn data<B: Read + Seek>(&mut self, backing: &mut B) -> Result<&mut Vec<u8>> {
        if self.bytes.is_none() {
            let mut buf = vec![0u8; self.size];
            backing.seek(SeekFrom::Start(self.offset()))?;
            match backing.read_exact(&mut buf) {
                Ok(()) => {}
                Err(_) => buf.fill(0),
            }
            self.bytes = Some(buf);
        }
        Ok(self.bytes.as_mut().unwrap())
    }

    pub fn zero_data(&mut self) {
        self.bytes = Some(vec![0u8; self.size]);
        self.dirty = true;
    }

    /// Overwrite this sector's bytes wholesale and mark it dirty.
    pub fn set_data(&mut self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.size);
        self.bytes = Some(bytes);
        self.dirty = true;
    }

    pub fn release_data(&mut self) {
        if !self.dirty {
            self.bytes = None;
        }
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn write_back<B: Write + Seek>(&self, backing: &mut B) -> Result<()> {
        if let Some(bytes) = &self.bytes {
            backing.seek(SeekFrom::Start(self.offset()))?;
            backing.write_all(bytes)?;
        }
        Ok(())
    }
}

/// Sparse, id-indexed container of sectors. Grows as chains are walked;
/// never shrinks (freed sectors stay allocated, marked free in the FAT).
#[derive(Default)]
pub struct SectorCollection {
    sectors: Vec<Option<Sector>>,
}

impl SectorCollection {
    pub fn new() -> Self {
        SectorCollection { sectors: Vec::new() }
    }

    pub fn with_capacity(expected_sectors: u32) -> Self {
        let mut sectors = Vec::with_capacity(expected_sectors as usize);
        sectors.resize_with(expected_sectors as usize, || None);
        SectorCollection { sectors }
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    fn ensure_len(&mut self, len: usize) {
        if self.sectors.len() < len {
            self.sectors.resize_with(len, || None);
        }
    }

    pub fn get_or_init(&mut self, id: u32, size: usize, kind: SectorKind) -> &mut Sector {
        self.ensure_len(id as usize + 1);
        let slot = &mut self.sectors[id as usize];
        if slot.is_none() {
            *slot = Some(Sector::new(id, size, kind));
        }
        slot.as_mut().unwrap()
    }

    pub fn get(&self, id: u32) -> Option<&Sector> {
        self.sectors.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Sector> {
        self.sectors.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    /// Adopt an unassigned sector (`id == u32::MAX`), giving it the next
    /// free slot and returning the id it was assigned.
    pub fn adopt(&mut self, mut sector: Sector) -> u32 {
        let id = self.sectors.len() as u32;
        sector.id = id;
        self.sectors.push(Some(sector));
        id
    }

    pub fn insert_at(&mut self, sector: Sector) {
        let id = sector.id;
        self.ensure_len(id as usize + 1);
        self.sectors[id as usize] = Some(sector);
    }

    pub fn dirty_ids(&self) -> Vec<u32> {
        self.sectors
            .iter()
            .flatten()
            .filter(|s| s.dirty)
            .map(|s| s.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sector> {
        self.sectors.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sector> {
        self.sectors.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn lazily_reads_sector_bytes() {
        let mut backing = Cursor::new(vec![0xAAu8; 512 + 512]);
        let mut collection = SectorCollection::new();
        let sector = collection.get_or_init(0, 512, SectorKind::Normal);
        let data = sector.data(&mut backing).unwrap();
        assert_eq!(data.len(), 512);
        assert!(data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn adopt_assigns_next_id() {
        let mut collection = SectorCollection::new();
        let id0 = collection.adopt(Sector::zeroed(u32::MAX, 512, SectorKind::Normal));
        let id1 = collection.adopt(Sector::zeroed(u32::MAX, 512, SectorKind::Normal));
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
    }
}
