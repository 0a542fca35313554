//! `CompoundFile<B>`: the engine orchestrator. Ties the header codec,
//! the allocation graph, the directory tree, and the stream view
//! together behind the public open/navigate/mutate/commit lifecycle,
//! generic over any synchronous `B: Read + Write + Seek` backing store.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};

use log::{debug, trace, warn};

use crate::alloc;
use crate::config::OpenOptions;
use crate::constants::{
    self, DIFSECT, ENDOFCHAIN, FATSECT, FREESECT, MAJOR_VERSION_3_VALUE, RANGE_LOCK_THRESHOLD,
};
use crate::directory::{self, DirectoryEntry, ObjectType, ENTRY_LEN};
use crate::error::{Error, Result};
use crate::ftype::{self, OleFileType};
use crate::header::{parse_raw_header, Header, INLINE_DIFAT_LEN};
use crate::sector::{SectorCollection, SectorKind};
use crate::storage::Storage;
use crate::stream_view::{StreamView, UnitStore};
use crate::tree;

/// Unit store over normal (full) sectors, backed by the lazily-loaded
/// sector collection and, when a sector has never been touched, the
/// original backing stream.
struct NormalStore<'a, B> {
    sectors: &'a mut SectorCollection,
    backing: Option<&'a mut B>,
    sector_size: usize,
}

impl<'a, B: Read + Seek> UnitStore for NormalStore<'a, B> {
    fn unit_size(&self) -> usize {
        self.sector_size
    }

    fn read_unit(&mut self, id: u32, out: &mut [u8]) -> Result<()> {
        let sector = self.sectors.get_or_init(id, self.sector_size, SectorKind::Normal);
        match self.backing.as_deref_mut() {
            Some(backing) => out.copy_from_slice(sector.data(backing)?),
            None => {
                let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
                out.copy_from_slice(sector.data(&mut cursor)?);
            }
        }
        Ok(())
    }

    fn write_unit(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.sectors
            .get_or_init(id, self.sector_size, SectorKind::Normal)
            .set_data(data.to_vec());
        Ok(())
    }
}

/// Unit store over 64-byte mini-sectors, backed directly by the
/// in-memory mini-stream buffer. The mini-stream is itself a normal
/// stream, persisted as one on commit; see [`CompoundFile::relayout`].
struct MiniStore<'a> {
    bytes: &'a mut Vec<u8>,
}

impl<'a> UnitStore for MiniStore<'a> {
    fn unit_size(&self) -> usize {
        constants::MINI_SECTOR_SIZE
    }

    fn read_unit(&mut self, id: u32, out: &mut [u8]) -> Result<()> {
        let start = id as usize * constants::MINI_SECTOR_SIZE;
        let end = start + constants::MINI_SECTOR_SIZE;
        if end <= self.bytes.len() {
            out.copy_from_slice(&self.bytes[start..end]);
        } else {
            out.fill(0);
        }
        Ok(())
    }

    fn write_unit(&mut self, id: u32, data: &[u8]) -> Result<()> {
        let start = id as usize * constants::MINI_SECTOR_SIZE;
        let end = start + constants::MINI_SECTOR_SIZE;
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// The MS-CFB range-lock sector's reserved range starts at
/// [`RANGE_LOCK_THRESHOLD`]; the sector covering that offset is id
/// `(threshold - sector_size) / sector_size`.
fn range_lock_sector_id(sector_size: usize) -> u32 {
    ((RANGE_LOCK_THRESHOLD - sector_size as u64) / sector_size as u64) as u32
}

pub struct CompoundFile<B> {
    backing: Option<B>,
    header: Header,
    fat: Vec<u32>,
    mini_fat: Vec<u32>,
    directory: Vec<DirectoryEntry>,
    sectors: SectorCollection,
    mini_stream: Vec<u8>,
    options: OpenOptions,
    closed: bool,
}

impl<B> CompoundFile<B> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.options.is_read_only() {
            return Err(Error::InvalidOperation(
                "compound file was opened read-only",
            ));
        }
        Ok(())
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    pub fn major_version(&self) -> u16 {
        self.header.major_version
    }

    pub fn file_type(&self) -> OleFileType {
        ftype::file_type(self.directory[0].class_id_string().as_deref())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.backing = None;
        self.closed = true;
    }

    // -- directory introspection, usable by the storage/stream façade --

    pub(crate) fn entry(&self, sid: u32) -> &DirectoryEntry {
        &self.directory[sid as usize]
    }

    pub(crate) fn child_sid(&self, parent: u32, name: &str) -> Option<u32> {
        tree::find(&self.directory, self.directory[parent as usize].child_sid, name)
    }

    pub(crate) fn lookup_child(&self, parent: u32, name: &str, want_storage: bool) -> Result<u32> {
        match self.child_sid(parent, name) {
            Some(sid) => {
                let ty = self.directory[sid as usize].object_type;
                let matches = if want_storage {
                    ty == ObjectType::Storage
                } else {
                    ty == ObjectType::Stream
                };
                if matches {
                    Ok(sid)
                } else {
                    Err(Error::ItemNotFound(name.to_string()))
                }
            }
            None => Err(Error::ItemNotFound(name.to_string())),
        }
    }

    pub(crate) fn enumerate_children(&self, parent: u32) -> Vec<u32> {
        tree::in_order(&self.directory, self.directory[parent as usize].child_sid)
    }

    pub(crate) fn visit_entries(
        &self,
        parent: u32,
        recursive: bool,
        visitor: &mut dyn FnMut(u32, &DirectoryEntry),
    ) {
        for sid in self.enumerate_children(parent) {
            visitor(sid, &self.directory[sid as usize]);
            if recursive && self.directory[sid as usize].object_type == ObjectType::Storage {
                self.visit_entries(sid, recursive, visitor);
            }
        }
    }

    /// Flat, hierarchy-independent scan of every allocated directory
    /// entry with the given name, regardless of which storage holds it.
    pub fn get_all_named_entries(&self, name: &str) -> Vec<u32> {
        self.directory
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_allocated() && e.name == name)
            .map(|(i, _)| i as u32)
            .collect()
    }
}

impl<B: Read + Write + Seek> CompoundFile<B> {
    pub fn root_storage(&mut self) -> Storage<'_, B> {
        Storage::new(self, 0)
    }

    /// Open and parse an existing compound file.
    pub fn open(mut backing: B, options: OpenOptions) -> Result<Self> {
        backing.seek(SeekFrom::Start(0))?;
        let raw = parse_raw_header(&mut backing)?;
        let header = Header::from_raw(raw);
        let sector_size = header.sector_size();
        let word_per_sector = sector_size / 4;

        let stream_len = backing.seek(SeekFrom::End(0))?;
        let num_sectors = if stream_len > sector_size as u64 {
            (stream_len - sector_size as u64 + sector_size as u64 - 1) / sector_size as u64
        } else {
            0
        };
        let mut sectors = SectorCollection::with_capacity(num_sectors as u32);
        trace!("loading compound file: {num_sectors} sectors of {sector_size} bytes");

        // --- DIFAT: inline 109 entries, then overflow sectors ---
        let inline_take = (header.num_fat_sectors as usize).min(INLINE_DIFAT_LEN);
        let mut fat_sector_ids: Vec<u32> = header.inline_difat[..inline_take]
            .iter()
            .copied()
            .filter(|&v| v != FREESECT)
            .collect();
        let mut difat_sector_ids = Vec::new();
        if header.num_fat_sectors as usize > fat_sector_ids.len() {
            let mut current = header.first_difat_sector;
            while current != ENDOFCHAIN && current != FREESECT {
                if header.num_difat_sectors > 0
                    && difat_sector_ids.len() as u32 >= header.num_difat_sectors
                {
                    return Err(Error::CorruptedFormat(
                        "DIFAT sectors count mismatched".to_string(),
                    ));
                }
                difat_sector_ids.push(current);
                let sector = sectors.get_or_init(current, sector_size, SectorKind::Difat);
                let bytes = sector.data(&mut backing)?.clone();
                for chunk in bytes[..(word_per_sector - 1) * 4].chunks_exact(4) {
                    let v = u32::from_le_bytes(chunk.try_into().unwrap());
                    if v != FREESECT {
                        fat_sector_ids.push(v);
                    }
                }
                let link_off = (word_per_sector - 1) * 4;
                let next = u32::from_le_bytes(bytes[link_off..link_off + 4].try_into().unwrap());
                if next == FREESECT {
                    // Historical leniency: some writers terminate the DIFAT
                    // chain with FREESECT instead of ENDOFCHAIN.
                    warn!("DIFAT chain terminated by FREESECT instead of ENDOFCHAIN");
                }
                current = next;
            }
        }
        debug!("difat resolved {} fat sectors", fat_sector_ids.len());

        // --- FAT ---
        let mut fat = Vec::with_capacity(fat_sector_ids.len() * word_per_sector);
        for &id in &fat_sector_ids {
            let sector = sectors.get_or_init(id, sector_size, SectorKind::Fat);
            let bytes = sector.data(&mut backing)?.clone();
            for chunk in bytes.chunks_exact(4) {
                fat.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
        }

        // --- directory ---
        let dir_chain = alloc::walk_chain(&fat, header.first_directory_sector)?;
        let mut directory = Vec::new();
        for &id in &dir_chain {
            let sector = sectors.get_or_init(id, sector_size, SectorKind::Directory);
            let bytes = sector.data(&mut backing)?.clone();
            for rec in bytes.chunks_exact(ENTRY_LEN) {
                directory.push(DirectoryEntry::parse(
                    rec,
                    header.major_version,
                    options.validation_exception_enabled,
                )?);
            }
        }
        if directory.is_empty() {
            directory.push(DirectoryEntry::new_root());
        }
        validate_sibling_refs(&mut directory, options.validation_exception_enabled)?;
        debug!("directory holds {} entries", directory.len());

        // --- mini-FAT ---
        let mini_fat_chain = alloc::walk_chain(&fat, header.first_mini_fat_sector)?;
        let mut mini_fat = Vec::with_capacity(mini_fat_chain.len() * word_per_sector);
        for &id in &mini_fat_chain {
            let sector = sectors.get_or_init(id, sector_size, SectorKind::Normal);
            let bytes = sector.data(&mut backing)?.clone();
            for chunk in bytes.chunks_exact(4) {
                mini_fat.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
        }

        // --- mini-stream (a normal stream rooted at the root entry) ---
        let root_size = directory[0].size;
        let mini_chain = alloc::walk_chain(&fat, directory[0].start_sector)?;
        let mut mini_stream = Vec::with_capacity(root_size as usize);
        for &id in &mini_chain {
            let sector = sectors.get_or_init(id, sector_size, SectorKind::Normal);
            let bytes = sector.data(&mut backing)?.clone();
            mini_stream.extend_from_slice(&bytes);
        }
        mini_stream.truncate(root_size as usize);

        if stream_len >= RANGE_LOCK_THRESHOLD && header.major_version == MAJOR_VERSION_3_VALUE {
            let rl_id = range_lock_sector_id(sector_size);
            if (rl_id as usize) < fat.len()
                && fat[rl_id as usize] == ENDOFCHAIN
                && sectors.get(rl_id).is_none()
            {
                trace!("file crosses the range-lock threshold; tagging reserved sector {rl_id}");
                sectors.get_or_init(rl_id, sector_size, SectorKind::RangeLock);
            }
        }

        Ok(CompoundFile {
            backing: Some(backing),
            header,
            fat,
            mini_fat,
            directory,
            sectors,
            mini_stream,
            options,
            closed: false,
        })
    }

    /// Create a brand-new, empty compound file. Nothing is written to
    /// `backing` until the first [`CompoundFile::commit`].
    pub fn create(backing: B, major_version: u16, options: OpenOptions) -> Result<Self> {
        let header = Header::new_empty(major_version)?;
        Ok(CompoundFile {
            backing: Some(backing),
            header,
            fat: Vec::new(),
            mini_fat: Vec::new(),
            directory: vec![DirectoryEntry::new_root()],
            sectors: SectorCollection::new(),
            mini_stream: Vec::new(),
            options,
            closed: false,
        })
    }

    pub(crate) fn add_child(&mut self, parent: u32, entry: DirectoryEntry) -> Result<u32> {
        self.ensure_writable()?;
        directory::validate_name(&entry.name)?;
        if self.child_sid(parent, &entry.name).is_some() {
            return Err(Error::DuplicatedItem(entry.name));
        }
        let new_sid = match self.directory.iter().position(|e| !e.is_allocated()) {
            Some(idx) => {
                self.directory[idx] = entry;
                idx as u32
            }
            None => {
                self.directory.push(entry);
                (self.directory.len() - 1) as u32
            }
        };
        let mut children = self.enumerate_children(parent);
        children.push(new_sid);
        let new_root = tree::rebuild(&mut self.directory, children)?;
        self.directory[parent as usize].child_sid = new_root;
        Ok(new_sid)
    }

    pub(crate) fn read_stream_data(&mut self, sid: u32, offset: u64, len: Option<u64>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let total = self.directory[sid as usize].size;
        let start = self.directory[sid as usize].start_sector;
        let offset = offset.min(total);
        let take = len.map(|l| l.min(total - offset)).unwrap_or(total - offset);
        let mut buf = vec![0u8; take as usize];
        if take == 0 {
            return Ok(buf);
        }
        let is_mini = total < self.header.mini_stream_cutoff as u64;
        if is_mini {
            let chain = alloc::walk_chain(&self.mini_fat, start)?;
            let mut store = MiniStore { bytes: &mut self.mini_stream };
            let mut view = StreamView::new(&mut store, chain, total);
            view.seek_to(SeekFrom::Start(offset))?;
            view.read(&mut buf)?;
        } else {
            let chain = alloc::walk_chain(&self.fat, start)?;
            let sector_size = self.header.sector_size();
            let mut store = NormalStore {
                sectors: &mut self.sectors,
                backing: self.backing.as_mut(),
                sector_size,
            };
            let mut view = StreamView::new(&mut store, chain, total);
            view.seek_to(SeekFrom::Start(offset))?;
            view.read(&mut buf)?;
        }
        Ok(buf)
    }

    pub(crate) fn set_stream_data(&mut self, sid: u32, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let cutoff = self.header.mini_stream_cutoff as u64;
        let new_is_mini = (data.len() as u64) < cutoff;

        let old_size = self.directory[sid as usize].size;
        let old_start = self.directory[sid as usize].start_sector;
        if old_size > 0 || old_start != ENDOFCHAIN {
            let old_is_mini = old_size < cutoff;
            self.free_stream_chain(old_start, old_is_mini)?;
        }

        let chain = if new_is_mini {
            self.write_mini_content(ENDOFCHAIN, data)?
        } else {
            self.write_flat_content(ENDOFCHAIN, data)?
        };
        let entry = &mut self.directory[sid as usize];
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = data.len() as u64;
        Ok(())
    }

    /// Append is expressed as read-old, concatenate, re-`set`: the
    /// simplest implementation that preserves the "promote on crossing
    /// the cutoff" contract without duplicating the set/free/allocate
    /// bookkeeping. See DESIGN.md for why this repo does not attempt a
    /// sector-preserving in-place append.
    pub(crate) fn append_stream_data(&mut self, sid: u32, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(());
        }
        let mut combined = self.read_stream_data(sid, 0, None)?;
        combined.extend_from_slice(data);
        self.set_stream_data(sid, &combined)
    }

    fn free_stream_chain(&mut self, start: u32, is_mini: bool) -> Result<()> {
        if is_mini {
            let chain = alloc::walk_chain(&self.mini_fat, start)?;
            alloc::free_chain(&mut self.mini_fat, &chain);
            if self.options.erase_free_sectors {
                for &id in &chain {
                    let s = id as usize * constants::MINI_SECTOR_SIZE;
                    let e = s + constants::MINI_SECTOR_SIZE;
                    if e <= self.mini_stream.len() {
                        self.mini_stream[s..e].fill(0);
                    }
                }
            }
        } else {
            let chain = alloc::walk_chain(&self.fat, start)?;
            alloc::free_chain(&mut self.fat, &chain);
            if self.options.erase_free_sectors {
                for &id in &chain {
                    if let Some(sector) = self.sectors.get_mut(id) {
                        sector.zero_data();
                    }
                }
            }
        }
        Ok(())
    }

    fn write_flat_content(&mut self, existing_start: u32, content: &[u8]) -> Result<Vec<u32>> {
        let sector_size = self.header.sector_size();
        let needed = if content.is_empty() {
            0
        } else {
            (content.len() + sector_size - 1) / sector_size
        };
        let mut chain = alloc::walk_chain(&self.fat, existing_start)?;
        if chain.len() < needed {
            let mut free = if self.options.sector_recycle {
                alloc::free_list(&self.fat)
            } else {
                VecDeque::new()
            };
            let extra = alloc::allocate_chain(&mut self.fat, &mut free, needed - chain.len());
            chain.extend(extra);
        } else if chain.len() > needed {
            let tail: Vec<u32> = chain.split_off(needed);
            alloc::free_chain(&mut self.fat, &tail);
        }
        if !chain.is_empty() {
            alloc::set_chain_links(&mut self.fat, &chain);
        }
        let mut pos = 0usize;
        for &id in &chain {
            let mut buf = vec![0u8; sector_size];
            let take = (content.len() - pos).min(sector_size);
            buf[..take].copy_from_slice(&content[pos..pos + take]);
            self.sectors
                .get_or_init(id, sector_size, SectorKind::Normal)
                .set_data(buf);
            pos += take;
        }
        Ok(chain)
    }

    fn write_mini_content(&mut self, existing_start: u32, content: &[u8]) -> Result<Vec<u32>> {
        let unit = constants::MINI_SECTOR_SIZE;
        let needed = if content.is_empty() {
            0
        } else {
            (content.len() + unit - 1) / unit
        };
        let mut chain = alloc::walk_chain(&self.mini_fat, existing_start)?;
        if chain.len() < needed {
            let mut free = if self.options.sector_recycle {
                alloc::free_list(&self.mini_fat)
            } else {
                VecDeque::new()
            };
            let extra = alloc::allocate_chain(&mut self.mini_fat, &mut free, needed - chain.len());
            chain.extend(extra);
        } else if chain.len() > needed {
            let tail: Vec<u32> = chain.split_off(needed);
            alloc::free_chain(&mut self.mini_fat, &tail);
        }
        if !chain.is_empty() {
            alloc::set_chain_links(&mut self.mini_fat, &chain);
        }
        let mut pos = 0usize;
        for &id in &chain {
            let start = id as usize * unit;
            let end = start + unit;
            if end > self.mini_stream.len() {
                self.mini_stream.resize(end, 0);
            }
            let take = (content.len() - pos).min(unit);
            self.mini_stream[start..start + take].copy_from_slice(&content[pos..pos + take]);
            if take < unit {
                self.mini_stream[start + take..end].fill(0);
            }
            pos += take;
        }
        Ok(chain)
    }

    /// Recompute every derived on-disk structure (mini-stream, mini-FAT,
    /// directory, FAT, DIFAT, header fields) from the in-memory state.
    /// Always a full, naive rewrite rather than a buffered incremental
    /// commit: every touched sector is marked dirty here and physically
    /// written by the caller.
    fn relayout(&mut self) -> Result<()> {
        let sector_size = self.header.sector_size();
        let word_per_sector = sector_size / 4;

        for v in self.fat.iter_mut() {
            if *v == FATSECT || *v == DIFSECT {
                *v = FREESECT;
            }
        }

        if self.header.major_version == MAJOR_VERSION_3_VALUE {
            let projected = self.fat.len() as u64 * sector_size as u64 + sector_size as u64;
            if projected >= RANGE_LOCK_THRESHOLD {
                let rl_id = range_lock_sector_id(sector_size);
                if rl_id as usize >= self.fat.len() {
                    self.fat.resize(rl_id as usize + 1, FREESECT);
                }
                if self.fat[rl_id as usize] == FREESECT {
                    debug!("reserving range-lock sector {rl_id}");
                    self.fat[rl_id as usize] = ENDOFCHAIN;
                    self.sectors
                        .get_or_init(rl_id, sector_size, SectorKind::RangeLock)
                        .zero_data();
                }
            }
        }

        let old_mini_start = self.directory[0].start_sector;
        let mini_stream_snapshot = self.mini_stream.clone();
        let mini_chain = self.write_flat_content(old_mini_start, &mini_stream_snapshot)?;
        self.directory[0].start_sector = mini_chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.directory[0].size = self.mini_stream.len() as u64;

        let needed_mini_fat_words =
            (self.mini_stream.len() + constants::MINI_SECTOR_SIZE - 1) / constants::MINI_SECTOR_SIZE;
        if self.mini_fat.len() < needed_mini_fat_words {
            self.mini_fat.resize(needed_mini_fat_words, FREESECT);
        }
        let mini_fat_bytes: Vec<u8> = self
            .mini_fat
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let old_mini_fat_start = self.header.first_mini_fat_sector;
        let mini_fat_chain = self.write_flat_content(old_mini_fat_start, &mini_fat_bytes)?;
        self.header.first_mini_fat_sector =
            mini_fat_chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.num_mini_fat_sectors = mini_fat_chain.len() as u32;

        let major_version = self.header.major_version;
        let dir_bytes: Vec<u8> = self
            .directory
            .iter()
            .flat_map(|e| e.encode(major_version))
            .collect();
        let old_dir_start = self.header.first_directory_sector;
        let dir_chain = self.write_flat_content(old_dir_start, &dir_bytes)?;
        self.header.first_directory_sector = dir_chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.directory_sectors_len = if self.header.is_v4() {
            dir_chain.len() as u32
        } else {
            0
        };

        let (fat_sector_ids, difat_sector_ids) = self.layout_fat_difat(word_per_sector)?;
        debug!(
            "commit: {} fat sectors, {} difat sectors",
            fat_sector_ids.len(),
            difat_sector_ids.len()
        );

        for (i, &id) in fat_sector_ids.iter().enumerate() {
            let mut buf = vec![0u8; sector_size];
            for w in 0..word_per_sector {
                let idx = i * word_per_sector + w;
                let val = self.fat.get(idx).copied().unwrap_or(FREESECT);
                buf[w * 4..w * 4 + 4].copy_from_slice(&val.to_le_bytes());
            }
            self.sectors
                .get_or_init(id, sector_size, SectorKind::Fat)
                .set_data(buf);
        }

        let cap_per_difat = word_per_sector - 1;
        for (i, &id) in difat_sector_ids.iter().enumerate() {
            let mut buf = vec![0u8; sector_size];
            for w in 0..cap_per_difat {
                let idx = INLINE_DIFAT_LEN + i * cap_per_difat + w;
                let val = fat_sector_ids.get(idx).copied().unwrap_or(FREESECT);
                buf[w * 4..w * 4 + 4].copy_from_slice(&val.to_le_bytes());
            }
            let next = difat_sector_ids.get(i + 1).copied().unwrap_or(ENDOFCHAIN);
            let off = cap_per_difat * 4;
            buf[off..off + 4].copy_from_slice(&next.to_le_bytes());
            self.sectors
                .get_or_init(id, sector_size, SectorKind::Difat)
                .set_data(buf);
        }

        self.header.num_fat_sectors = fat_sector_ids.len() as u32;
        self.header.first_difat_sector = difat_sector_ids.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.num_difat_sectors = difat_sector_ids.len() as u32;
        let mut inline = vec![FREESECT; INLINE_DIFAT_LEN];
        for (slot, &id) in inline.iter_mut().zip(fat_sector_ids.iter()) {
            *slot = id;
        }
        self.header.inline_difat = inline;

        Ok(())
    }

    /// Pin however many FAT and DIFAT sectors the current FAT table
    /// requires, iterating to a fixpoint since pinning more meta-sectors
    /// can itself grow the table enough to require yet another
    /// meta-sector.
    fn layout_fat_difat(&mut self, word_per_sector: usize) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut fat_sector_ids: Vec<u32> = Vec::new();
        let mut difat_sector_ids: Vec<u32> = Vec::new();
        for _ in 0..64 {
            let needed_fat = ((self.fat.len() + word_per_sector - 1) / word_per_sector).max(1);
            let needed_difat = if needed_fat <= INLINE_DIFAT_LEN {
                0
            } else {
                let overflow = needed_fat - INLINE_DIFAT_LEN;
                (overflow + word_per_sector - 2) / (word_per_sector - 1)
            };
            if fat_sector_ids.len() == needed_fat && difat_sector_ids.len() == needed_difat {
                return Ok((fat_sector_ids, difat_sector_ids));
            }
            for &id in fat_sector_ids.iter().chain(difat_sector_ids.iter()) {
                if (id as usize) < self.fat.len() {
                    self.fat[id as usize] = FREESECT;
                }
            }
            let mut free = alloc::free_list(&self.fat);
            let total = needed_fat + needed_difat;
            let mut fresh = Vec::with_capacity(total);
            for _ in 0..total {
                let id = match free.pop_front() {
                    Some(id) => id,
                    None => {
                        self.fat.push(FREESECT);
                        (self.fat.len() - 1) as u32
                    }
                };
                fresh.push(id);
            }
            fat_sector_ids = fresh[..needed_fat].to_vec();
            difat_sector_ids = fresh[needed_fat..].to_vec();
            alloc::mark_special_sectors(&mut self.fat, &fat_sector_ids, &difat_sector_ids);
        }
        Err(Error::CorruptedFormat(
            "FAT/DIFAT layout did not converge".to_string(),
        ))
    }

    /// Persist every dirty sector plus the header to the backing stream
    /// in place. The header is written last so that a torn write leaves
    /// only the header, not the data, looking incomplete.
    pub fn commit(&mut self, release_memory: bool) -> Result<()> {
        self.ensure_writable()?;
        self.relayout()?;
        let dirty = self.sectors.dirty_ids();
        let backing = self.backing.as_mut().ok_or(Error::Disposed)?;
        for id in dirty {
            if let Some(sector) = self.sectors.get_mut(id) {
                sector.write_back(backing)?;
                sector.mark_clean();
                if release_memory {
                    sector.release_data();
                }
            }
        }
        backing.seek(SeekFrom::Start(0))?;
        self.header.write_to(backing)?;
        Ok(())
    }

    /// Persist the full current state to a different destination (save
    /// as), leaving the original backing stream untouched and still
    /// open. Sectors never touched this session are pulled from the
    /// original backing stream on demand.
    pub fn save<W: Write + Seek>(&mut self, target: &mut W) -> Result<()> {
        self.ensure_open()?;
        self.relayout()?;
        let sector_size = self.header.sector_size();
        let mut header_buf = Vec::new();
        self.header.write_to(&mut header_buf)?;
        target.seek(SeekFrom::Start(0))?;
        target.write_all(&header_buf)?;

        let max_id = self.sectors.len() as u32;
        for id in 0..max_id {
            let mut buf = vec![0u8; sector_size];
            if let Some(backing) = self.backing.as_mut() {
                if let Some(sector) = self.sectors.get_mut(id) {
                    buf.copy_from_slice(sector.data(backing)?);
                }
            }
            target.seek(SeekFrom::Start(sector_size as u64 + id as u64 * sector_size as u64))?;
            target.write_all(&buf)?;
        }
        Ok(())
    }
}

/// Sibling SIDs must be in range and point at an allocated entry.
/// Invalid references are fatal under strict validation, silently
/// dropped (treated as absent) under lenient mode.
fn validate_sibling_refs(directory: &mut [DirectoryEntry], strict: bool) -> Result<()> {
    let len = directory.len();

    fn check(directory: &[DirectoryEntry], len: usize, sid: Option<u32>, strict: bool) -> Result<Option<u32>> {
        match sid {
            None => Ok(None),
            Some(s) => {
                if (s as usize) >= len || !directory[s as usize].is_allocated() {
                    if strict {
                        Err(Error::CorruptedFormat(format!(
                            "invalid sibling reference {s}"
                        )))
                    } else {
                        warn!("dropping invalid sibling reference {s} under lenient validation");
                        Ok(None)
                    }
                } else {
                    Ok(Some(s))
                }
            }
        }
    }

    let mut fixups = Vec::new();
    for i in 0..len {
        if !directory[i].is_allocated() {
            continue;
        }
        let left = check(directory, len, directory[i].left_sid, strict)?;
        let right = check(directory, len, directory[i].right_sid, strict)?;
        let child = check(directory, len, directory[i].child_sid, strict)?;
        fixups.push((i, left, right, child));
    }
    for (i, left, right, child) in fixups {
        directory[i].left_sid = left;
        directory[i].right_sid = right;
        directory[i].child_sid = child;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenOptions;
    use std::io::Cursor;

    fn new_file(major_version: u16) -> CompoundFile<Cursor<Vec<u8>>> {
        CompoundFile::create(Cursor::new(Vec::new()), major_version, OpenOptions::default())
            .unwrap()
    }

    #[test]
    fn create_then_commit_then_reopen_v3() {
        let mut cf = new_file(constants::MAJOR_VERSION_3_VALUE);
        {
            let mut root = cf.root_storage();
            let mut storage = root.add_storage("MyStorage").unwrap();
            let mut stream = storage.add_stream("s1").unwrap();
            stream.set_data(&[0x00, 0x01, 0x02, 0x03]).unwrap();
        }
        cf.commit(false).unwrap();
        let backing = {
            let backing = cf.backing.take().unwrap();
            cf.closed = true;
            backing
        };

        let mut reopened = CompoundFile::open(backing, OpenOptions::default()).unwrap();
        // root + storage + stream; the directory sector may also carry
        // trailing all-zero padding records, preserved positionally as
        // Unallocated entries rather than trimmed.
        assert_eq!(
            reopened.directory.iter().filter(|e| e.is_allocated()).count(),
            3
        );
        let mut root = reopened.root_storage();
        assert!(root.exists_storage("MyStorage"));
        let mut storage = root.get_storage("MyStorage").unwrap();
        assert!(storage.exists_stream("s1"));
        let mut stream = storage.get_stream("s1").unwrap();
        assert_eq!(stream.size(), 4);
        assert_eq!(stream.get_data().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn promotes_stream_from_mini_to_normal_on_growth() {
        let mut cf = new_file(constants::MAJOR_VERSION_3_VALUE);
        let sid = cf.add_child(0, DirectoryEntry::new_stream("big")).unwrap();
        cf.set_stream_data(sid, &[1, 2, 3]).unwrap();
        assert!(cf.entry(sid).size < cf.header.mini_stream_cutoff as u64);
        let payload = vec![7u8; 8192];
        cf.set_stream_data(sid, &payload).unwrap();
        assert_eq!(cf.entry(sid).size, 8192);
        let read_back = cf.read_stream_data(sid, 0, None).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn duplicate_stream_name_rejected() {
        let mut cf = new_file(constants::MAJOR_VERSION_3_VALUE);
        cf.add_child(0, DirectoryEntry::new_stream("dup")).unwrap();
        let err = cf.add_child(0, DirectoryEntry::new_stream("dup")).unwrap_err();
        assert!(matches!(err, Error::DuplicatedItem(_)));
    }

    #[test]
    fn read_only_forbids_writes() {
        let mut cf = CompoundFile::create(
            Cursor::new(Vec::new()),
            constants::MAJOR_VERSION_3_VALUE,
            OpenOptions::read_only(),
        )
        .unwrap();
        let err = cf.add_child(0, DirectoryEntry::new_stream("x")).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn difat_overflow_allocates_one_overflow_sector() {
        // v3: 128 FAT sids per sector. 109 inline entries cover 13952
        // normal sectors; push the FAT past that so layout must spill
        // into an overflow DIFAT sector.
        let mut cf = new_file(constants::MAJOR_VERSION_3_VALUE);
        cf.fat = vec![FREESECT; 14_000];
        let (fat_sector_ids, difat_sector_ids) = cf.layout_fat_difat(128).unwrap();
        assert_eq!(fat_sector_ids.len(), 110);
        assert_eq!(difat_sector_ids.len(), 1);
        for &id in &fat_sector_ids {
            assert_eq!(cf.fat[id as usize], FATSECT);
        }
        for &id in &difat_sector_ids {
            assert_eq!(cf.fat[id as usize], DIFSECT);
        }
    }

    #[test]
    fn range_lock_sector_reserved_past_threshold() {
        let mut cf = new_file(constants::MAJOR_VERSION_3_VALUE);
        let sector_size = cf.header.sector_size() as u64;
        let needed = ((RANGE_LOCK_THRESHOLD - sector_size) + sector_size - 1) / sector_size;
        cf.fat = vec![FREESECT; needed as usize];
        cf.relayout().unwrap();
        let rl_id = range_lock_sector_id(sector_size as usize);
        assert_eq!(cf.fat[rl_id as usize], ENDOFCHAIN);
        assert_eq!(
            cf.sectors.get(rl_id).map(|s| s.kind),
            Some(SectorKind::RangeLock)
        );
    }
}
