//! A seekable, growable byte window over an ordered chain of fixed-size
//! units (normal sectors or 64-byte mini-sectors).
//!
//! The view itself knows nothing about FAT/mini-FAT bookkeeping; callers
//! that need to grow a chain pass an `allocate` closure that returns the
//! new unit ids, and are responsible for persisting the updated chain's
//! links afterwards.

use std::io::{Read, Result as IoResult, Seek, SeekFrom};

use crate::error::Result;

/// Backing store for one kind of unit (normal sector or mini-sector).
pub trait UnitStore {
    fn unit_size(&self) -> usize;
    fn read_unit(&mut self, id: u32, out: &mut [u8]) -> Result<()>;
    fn write_unit(&mut self, id: u32, data: &[u8]) -> Result<()>;
}

pub struct StreamView<'a, S: UnitStore> {
    store: &'a mut S,
    chain: Vec<u32>,
    length: u64,
    position: u64,
}

impl<'a, S: UnitStore> StreamView<'a, S> {
    pub fn new(store: &'a mut S, chain: Vec<u32>, length: u64) -> Self {
        StreamView {
            store,
            chain,
            length,
            position: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn chain(&self) -> &[u32] {
        &self.chain
    }

    pub fn into_chain(self) -> Vec<u32> {
        self.chain
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek_to(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.length as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        let new_pos = new_pos.max(0) as u64;
        self.position = new_pos;
        if new_pos > self.length {
            self.length = new_pos;
        }
        Ok(self.position)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let unit_size = self.store.unit_size() as u64;
        let remaining = self.length.saturating_sub(self.position);
        let to_read = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0usize;
        let mut pos = self.position;
        let mut unit_buf = vec![0u8; unit_size as usize];
        while done < to_read {
            let unit_index = (pos / unit_size) as usize;
            let within = (pos % unit_size) as usize;
            let id = match self.chain.get(unit_index) {
                Some(&id) => id,
                None => break,
            };
            self.store.read_unit(id, &mut unit_buf)?;
            let take = (unit_buf.len() - within).min(to_read - done);
            buf[done..done + take].copy_from_slice(&unit_buf[within..within + take]);
            done += take;
            pos += take as u64;
        }
        self.position = pos;
        Ok(done)
    }

    /// Write `buf` at the current position, extending the chain (via
    /// `allocate`) and `length` as needed.
    pub fn write(
        &mut self,
        buf: &[u8],
        mut allocate: impl FnMut(usize) -> Vec<u32>,
    ) -> Result<usize> {
        let unit_size = self.store.unit_size() as u64;
        let end = self.position + buf.len() as u64;
        let capacity = self.chain.len() as u64 * unit_size;
        if end > capacity {
            let extra_units = ((end - capacity) + unit_size - 1) / unit_size;
            let new_units = allocate(extra_units as usize);
            self.chain.extend(new_units);
        }
        if end > self.length {
            self.length = end;
        }

        let mut done = 0usize;
        let mut pos = self.position;
        let mut unit_buf = vec![0u8; unit_size as usize];
        while done < buf.len() {
            let unit_index = (pos / unit_size) as usize;
            let within = (pos % unit_size) as usize;
            let id = self.chain[unit_index];
            let take = (unit_buf.len() - within).min(buf.len() - done);
            if within != 0 || take != unit_buf.len() {
                self.store.read_unit(id, &mut unit_buf)?;
            }
            unit_buf[within..within + take].copy_from_slice(&buf[done..done + take]);
            self.store.write_unit(id, &unit_buf)?;
            done += take;
            pos += take as u64;
        }
        self.position = pos;
        Ok(done)
    }
}

impl<'a, S: UnitStore> Read for StreamView<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        StreamView::read(self, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

impl<'a, S: UnitStore> Seek for StreamView<'a, S> {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        StreamView::seek_to(self, pos)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemStore {
        unit_size: usize,
        units: Vec<Vec<u8>>,
    }

    impl UnitStore for MemStore {
        fn unit_size(&self) -> usize {
            self.unit_size
        }
        fn read_unit(&mut self, id: u32, out: &mut [u8]) -> Result<()> {
            out.copy_from_slice(&self.units[id as usize]);
            Ok(())
        }
        fn write_unit(&mut self, id: u32, data: &[u8]) -> Result<()> {
            self.units[id as usize].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn reads_across_unit_boundary() {
        let mut store = MemStore {
            unit_size: 4,
            units: vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]],
        };
        let mut view = StreamView::new(&mut store, vec![0, 1], 8);
        let mut buf = [0u8; 6];
        let n = view.read(&mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn write_extends_chain_via_allocator() {
        let mut store = MemStore {
            unit_size: 4,
            units: vec![vec![0; 4], vec![0; 4]],
        };
        let mut view = StreamView::new(&mut store, vec![0], 0);
        let written = view.write(&[1, 2, 3, 4, 5, 6], |n| (1..=n as u32).collect());
        assert_eq!(written.unwrap(), 6);
        assert_eq!(view.len(), 6);
        assert_eq!(view.chain(), &[0, 1]);
    }
}
