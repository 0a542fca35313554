//! 128-byte directory entries and the case-insensitive, length-first
//! name ordering the balanced tree in [`crate::tree`] is keyed by.
//!
//! <https://winprotocoldoc.blob.core.windows.net/productionwindowsarchives/MS-CFB/%5bMS-CFB%5d.pdf>

use std::cmp::Ordering;

use chrono::NaiveDateTime;

use crate::constants::{self, MAJOR_VERSION_3_VALUE};
use crate::error::{Error, Result};

/// 100-nanosecond ticks between the Windows FILETIME epoch (1601-01-01)
/// and the Unix epoch (1970-01-01), used to convert FILETIME fields to
/// and from `chrono`'s `NaiveDateTime` via `epochs::windows_file` for
/// reads; there is no `epochs` encoder, so the reverse direction is
/// computed directly here.
const WINDOWS_EPOCH_OFFSET_100NS: i64 = 116_444_736_000_000_000;

fn filetime_to_datetime(ticks: u64) -> Option<NaiveDateTime> {
    if ticks == 0 {
        return None;
    }
    epochs::windows_file(ticks as i64)
}

fn datetime_to_filetime(dt: NaiveDateTime) -> u64 {
    let unix_100ns = dt.and_utc().timestamp() * 10_000_000
        + (dt.and_utc().timestamp_subsec_nanos() as i64) / 100;
    (unix_100ns + WINDOWS_EPOCH_OFFSET_100NS).max(0) as u64
}

pub const ENTRY_LEN: usize = constants::SIZE_OF_DIRECTORY_ENTRY;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Unallocated,
    Storage,
    Stream,
    Root,
}

impl ObjectType {
    fn to_byte(self) -> u8 {
        match self {
            ObjectType::Unallocated => 0x00,
            ObjectType::Storage => 0x01,
            ObjectType::Stream => 0x02,
            ObjectType::Root => 0x05,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeColor {
    Red,
    Black,
}

/// A parsed directory entry, still indexed by its position in the flat
/// directory vector (its "SID", distinct from a sector id).
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    pub name: String,
    pub object_type: ObjectType,
    pub color: NodeColor,
    pub left_sid: Option<u32>,
    pub right_sid: Option<u32>,
    pub child_sid: Option<u32>,
    pub class_id: Option<[u8; 16]>,
    pub state_bits: u32,
    pub creation_time: Option<NaiveDateTime>,
    pub modification_time: Option<NaiveDateTime>,
    pub start_sector: u32,
    pub size: u64,
}

impl DirectoryEntry {
    pub fn new_unallocated() -> Self {
        DirectoryEntry {
            name: String::new(),
            object_type: ObjectType::Unallocated,
            color: NodeColor::Black,
            left_sid: None,
            right_sid: None,
            child_sid: None,
            class_id: None,
            state_bits: 0,
            creation_time: None,
            modification_time: None,
            start_sector: constants::ENDOFCHAIN,
            size: 0,
        }
    }

    pub fn new_root() -> Self {
        DirectoryEntry {
            name: "Root Entry".to_string(),
            object_type: ObjectType::Root,
            color: NodeColor::Black,
            left_sid: None,
            right_sid: None,
            child_sid: None,
            class_id: None,
            state_bits: 0,
            creation_time: None,
            modification_time: None,
            start_sector: constants::ENDOFCHAIN,
            size: 0,
        }
    }

    pub fn new_storage(name: &str) -> Self {
        DirectoryEntry {
            name: name.to_string(),
            object_type: ObjectType::Storage,
            color: NodeColor::Black,
            left_sid: None,
            right_sid: None,
            child_sid: None,
            class_id: None,
            state_bits: 0,
            creation_time: None,
            modification_time: None,
            start_sector: constants::ENDOFCHAIN,
            size: 0,
        }
    }

    pub fn new_stream(name: &str) -> Self {
        DirectoryEntry {
            name: name.to_string(),
            object_type: ObjectType::Stream,
            color: NodeColor::Black,
            left_sid: None,
            right_sid: None,
            child_sid: None,
            class_id: None,
            state_bits: 0,
            creation_time: None,
            modification_time: None,
            start_sector: constants::ENDOFCHAIN,
            size: 0,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.object_type != ObjectType::Unallocated
    }

    /// Canonical uppercase hyphenated CLSID string for display.
    pub fn class_id_string(&self) -> Option<String> {
        self.class_id.map(|bytes| {
            let a = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let b = u16::from_le_bytes([bytes[4], bytes[5]]);
            let c = u16::from_le_bytes([bytes[6], bytes[7]]);
            format!(
                "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
                a, b, c, bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15]
            )
        })
    }

    pub fn parse(raw: &[u8], major_version: u16, strict: bool) -> Result<Self> {
        if raw.len() != ENTRY_LEN {
            return Err(Error::OleInvalidDirectoryEntry(
                "length",
                format!("expected {ENTRY_LEN} bytes, found {}", raw.len()),
            ));
        }

        let object_type = match raw[66] {
            0x00 => ObjectType::Unallocated,
            0x01 => ObjectType::Storage,
            0x02 => ObjectType::Stream,
            0x05 => ObjectType::Root,
            other => {
                if strict {
                    return Err(Error::OleInvalidDirectoryEntry(
                        "object_type",
                        format!("invalid value: {other:#x}"),
                    ));
                }
                ObjectType::Unallocated
            }
        };

        if object_type == ObjectType::Unallocated {
            return Ok(DirectoryEntry::new_unallocated());
        }

        let name_len_bytes = u16::from_le_bytes([raw[64], raw[65]]) as usize;
        if name_len_bytes > 64 || name_len_bytes % 2 != 0 {
            return Err(Error::OleInvalidDirectoryEntry(
                "name_length",
                format!("invalid value: {name_len_bytes}"),
            ));
        }
        let name_chars = if name_len_bytes >= 2 {
            name_len_bytes / 2 - 1
        } else {
            0
        };
        let utf16: Vec<u16> = raw[0..name_chars * 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let name = String::from_utf16(&utf16)?;

        let color = match raw[67] {
            0x00 => NodeColor::Red,
            0x01 => NodeColor::Black,
            other => {
                if strict {
                    return Err(Error::OleInvalidDirectoryEntry(
                        "color",
                        format!("invalid value: {other:#x}"),
                    ));
                }
                NodeColor::Black
            }
        };

        let left_sid = parse_sibling_id(&raw[68..72], "left_sid")?;
        let right_sid = parse_sibling_id(&raw[72..76], "right_sid")?;
        let child_sid = parse_sibling_id(&raw[76..80], "child_sid")?;

        let mut class_bytes = [0u8; 16];
        class_bytes.copy_from_slice(&raw[80..96]);
        let class_id = if class_bytes == [0u8; 16] {
            None
        } else {
            Some(class_bytes)
        };

        let state_bits = u32::from_le_bytes(raw[96..100].try_into().unwrap());
        let creation_time = filetime_to_datetime(u64::from_le_bytes(raw[100..108].try_into().unwrap()));
        let modification_time =
            filetime_to_datetime(u64::from_le_bytes(raw[108..116].try_into().unwrap()));
        let start_sector = u32::from_le_bytes(raw[116..120].try_into().unwrap());

        let mut size_bytes: [u8; 8] = raw[120..128].try_into().unwrap();
        if major_version == MAJOR_VERSION_3_VALUE {
            // The most significant 32 bits of this field MUST be zero in a
            // version 3 compound file, but some old writers leave stale
            // garbage there, so it is masked off rather than trusted.
            size_bytes[4..8].fill(0);
        }
        let size = u64::from_le_bytes(size_bytes);

        if size != 0 && object_type == ObjectType::Storage {
            return Err(Error::OleInvalidDirectoryEntry(
                "size",
                "storage entry has non-zero stream size".to_string(),
            ));
        }
        if object_type == ObjectType::Root && size % constants::MINI_SECTOR_SIZE as u64 != 0 {
            return Err(Error::OleInvalidDirectoryEntry(
                "size",
                "root entry's mini-stream size is not a multiple of 64".to_string(),
            ));
        }

        Ok(DirectoryEntry {
            name,
            object_type,
            color,
            left_sid,
            right_sid,
            child_sid,
            class_id,
            state_bits,
            creation_time,
            modification_time,
            start_sector,
            size,
        })
    }

    pub fn encode(&self, major_version: u16) -> [u8; ENTRY_LEN] {
        let mut buf = [0u8; ENTRY_LEN];
        if self.object_type == ObjectType::Unallocated {
            return buf;
        }
        let utf16: Vec<u16> = self.name.encode_utf16().collect();
        for (i, unit) in utf16.iter().enumerate().take(32) {
            buf[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        let name_len_bytes = ((utf16.len() + 1) * 2) as u16;
        buf[64..66].copy_from_slice(&name_len_bytes.to_le_bytes());
        buf[66] = self.object_type.to_byte();
        buf[67] = match self.color {
            NodeColor::Red => 0x00,
            NodeColor::Black => 0x01,
        };
        buf[68..72].copy_from_slice(&sibling_to_bytes(self.left_sid));
        buf[72..76].copy_from_slice(&sibling_to_bytes(self.right_sid));
        buf[76..80].copy_from_slice(&sibling_to_bytes(self.child_sid));
        if let Some(class_id) = self.class_id {
            buf[80..96].copy_from_slice(&class_id);
        }
        buf[96..100].copy_from_slice(&self.state_bits.to_le_bytes());
        let creation_ticks = self.creation_time.map(datetime_to_filetime).unwrap_or(0);
        let modification_ticks = self.modification_time.map(datetime_to_filetime).unwrap_or(0);
        buf[100..108].copy_from_slice(&creation_ticks.to_le_bytes());
        buf[108..116].copy_from_slice(&modification_ticks.to_le_bytes());
        buf[116..120].copy_from_slice(&self.start_sector.to_le_bytes());
        let _ = major_version;
        buf[120..128].copy_from_slice(&self.size.to_le_bytes());
        buf
    }
}

fn parse_sibling_id(raw: &[u8], field: &'static str) -> Result<Option<u32>> {
    let bytes: [u8; 4] = raw.try_into().unwrap();
    if bytes == constants::NO_STREAM {
        return Ok(None);
    }
    let value = u32::from_le_bytes(bytes);
    if value > constants::MAX_REG_STREAM_ID_VALUE {
        return Err(Error::OleInvalidDirectoryEntry(
            field,
            format!("invalid value: {value:#x}"),
        ));
    }
    Ok(Some(value))
}

fn sibling_to_bytes(sid: Option<u32>) -> [u8; 4] {
    match sid {
        Some(sid) => sid.to_le_bytes(),
        None => constants::NO_STREAM,
    }
}

/// The canonical CFB name ordering: first by UTF-16 length in bytes,
/// then by upper-cased codepoint sequence. A shorter name always sorts
/// before a longer one, regardless of content.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    let a_len = a.encode_utf16().count();
    let b_len = b.encode_utf16().count();
    a_len.cmp(&b_len).then_with(|| {
        let a_upper: Vec<u16> = a.to_uppercase().encode_utf16().collect();
        let b_upper: Vec<u16> = b.to_uppercase().encode_utf16().collect();
        a_upper.cmp(&b_upper)
    })
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name must not be empty".to_string()));
    }
    if name.encode_utf16().count() > constants::MAX_NAME_CHARS {
        return Err(Error::InvalidName(format!(
            "name {name:?} exceeds {} UTF-16 code units",
            constants::MAX_NAME_CHARS
        )));
    }
    if name.chars().any(|c| constants::FORBIDDEN_NAME_CHARS.contains(&c)) {
        return Err(Error::InvalidName(format!(
            "name {name:?} contains a forbidden character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_stream_entry() {
        let mut entry = DirectoryEntry::new_stream("s1");
        entry.size = 4;
        entry.start_sector = 7;
        let encoded = entry.encode(4);
        let decoded = DirectoryEntry::parse(&encoded, 4, true).unwrap();
        assert_eq!(decoded.name, "s1");
        assert_eq!(decoded.object_type, ObjectType::Stream);
        assert_eq!(decoded.size, 4);
        assert_eq!(decoded.start_sector, 7);
    }

    #[test]
    fn name_ordering_is_length_first() {
        assert_eq!(compare_names("zz", "aaa"), Ordering::Less);
        assert_eq!(compare_names("abc", "ABD"), Ordering::Less);
        assert_eq!(compare_names("abc", "abc"), Ordering::Equal);
    }

    #[test]
    fn rejects_forbidden_characters() {
        assert!(validate_name("bad/name").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("ok").is_ok());
    }

    #[test]
    fn masks_high_bits_of_v3_stream_size() {
        let mut raw = [0u8; ENTRY_LEN];
        raw[66] = 0x02; // stream
        raw[120..124].copy_from_slice(&100u32.to_le_bytes());
        raw[124..128].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        raw[68..72].copy_from_slice(&constants::NO_STREAM);
        raw[72..76].copy_from_slice(&constants::NO_STREAM);
        raw[76..80].copy_from_slice(&constants::NO_STREAM);
        let entry = DirectoryEntry::parse(&raw, MAJOR_VERSION_3_VALUE, true).unwrap();
        assert_eq!(entry.size, 100);
    }
}
