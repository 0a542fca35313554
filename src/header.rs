//! Header codec: parse, validate, and serialize the fixed 512-byte (v3) /
//! sector-padded (v4) header, including the 109-entry inline DIFAT.
//!
//! <https://winprotocoldoc.blob.core.windows.net/productionwindowsarchives/MS-CFB/%5bMS-CFB%5d.pdf>

use crate::{
    constants,
    error::{Error, HeaderErrorType},
    Result,
};
use derivative::Derivative;
use std::array::TryFromSliceError;
use std::io::{Read, Write};

pub const INLINE_DIFAT_LEN: usize = 109;

/// Parsed, validated header. Field names mirror the MS-CFB spec terms
/// rather than the historical SAT/SSAT/MSAT jargon.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    pub sector_shift: u16,
    pub mini_sector_shift: u16,
    pub directory_sectors_len: u32,
    pub mini_stream_cutoff: u32,
    pub first_fat_sector: u32,
    pub num_fat_sectors: u32,
    pub first_directory_sector: u32,
    pub first_mini_fat_sector: u32,
    pub num_mini_fat_sectors: u32,
    pub first_difat_sector: u32,
    pub num_difat_sectors: u32,
    /// First 109 FAT sector ids, inline in the header.
    #[derivative(Debug = "ignore")]
    pub inline_difat: Vec<u32>,
}

impl Header {
    pub fn sector_size(&self) -> usize {
        1usize << self.sector_shift
    }

    pub fn mini_sector_size(&self) -> usize {
        1usize << self.mini_sector_shift
    }

    pub fn is_v4(&self) -> bool {
        self.major_version == constants::MAJOR_VERSION_4_VALUE
    }

    /// A fresh, empty-file header for the requested major version.
    pub fn new_empty(major_version: u16) -> Result<Self> {
        let sector_shift = match major_version {
            constants::MAJOR_VERSION_3_VALUE => 9,
            4 => 12,
            other => return Err(Error::UnsupportedVersion(other)),
        };
        Ok(Header {
            major_version,
            minor_version: 0x003E,
            sector_shift,
            mini_sector_shift: constants::MINI_SECTOR_SHIFT,
            directory_sectors_len: 0,
            mini_stream_cutoff: constants::DEFAULT_MINI_STREAM_CUTOFF,
            first_fat_sector: constants::ENDOFCHAIN,
            num_fat_sectors: 0,
            first_directory_sector: constants::ENDOFCHAIN,
            first_mini_fat_sector: constants::ENDOFCHAIN,
            num_mini_fat_sectors: 0,
            first_difat_sector: constants::ENDOFCHAIN,
            num_difat_sectors: 0,
            inline_difat: vec![constants::FREESECT; INLINE_DIFAT_LEN],
        })
    }

    pub fn from_raw(raw: RawFileHeader) -> Self {
        Header {
            major_version: u16::from_le_bytes(raw.major_version),
            minor_version: u16::from_le_bytes(raw.minor_version),
            sector_shift: u16::from_le_bytes(raw.sector_size),
            mini_sector_shift: u16::from_le_bytes(raw.mini_sector_size),
            directory_sectors_len: u32::from_le_bytes(raw.directory_sectors_len),
            mini_stream_cutoff: u32::from_le_bytes(raw.standard_stream_min_size),
            first_fat_sector: constants::ENDOFCHAIN,
            num_fat_sectors: u32::from_le_bytes(raw.sector_allocation_table_len),
            first_directory_sector: u32::from_le_bytes(
                raw.sector_allocation_table_first_sector,
            ),
            first_mini_fat_sector: u32::from_le_bytes(
                raw.short_sector_allocation_table_first_sector,
            ),
            num_mini_fat_sectors: u32::from_le_bytes(raw.short_sector_allocation_table_len),
            first_difat_sector: u32::from_le_bytes(raw.master_sector_allocation_table_first_sector),
            num_difat_sectors: u32::from_le_bytes(raw.master_sector_allocation_table_len),
            inline_difat: raw.sector_allocation_table_head,
        }
    }

    /// Serialize into a `sector_size()`-byte (or at least 512-byte) buffer.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut buf = vec![0u8; self.sector_size().max(constants::HEADER_LENGTH)];
        buf[0..8].copy_from_slice(&constants::MAGIC_BYTES);
        // bytes 8..24 (reserved class id) stay zero
        buf[24..26].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[26..28].copy_from_slice(&self.major_version.to_le_bytes());
        buf[28..30].copy_from_slice(&[0xFE, 0xFF]);
        buf[30..32].copy_from_slice(&self.sector_shift.to_le_bytes());
        buf[32..34].copy_from_slice(&self.mini_sector_shift.to_le_bytes());
        // bytes 34..40 reserved, stay zero
        buf[40..44].copy_from_slice(&self.directory_sectors_len.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_fat_sectors.to_le_bytes());
        buf[48..52].copy_from_slice(&self.first_directory_sector.to_le_bytes());
        // bytes 52..56 transaction signature, stay zero
        buf[56..60].copy_from_slice(&self.mini_stream_cutoff.to_le_bytes());
        buf[60..64].copy_from_slice(&self.first_mini_fat_sector.to_le_bytes());
        buf[64..68].copy_from_slice(&self.num_mini_fat_sectors.to_le_bytes());
        buf[68..72].copy_from_slice(&self.first_difat_sector.to_le_bytes());
        buf[72..76].copy_from_slice(&self.num_difat_sectors.to_le_bytes());
        for (i, sid) in self.inline_difat.iter().enumerate() {
            let off = 76 + i * 4;
            buf[off..off + 4].copy_from_slice(&sid.to_le_bytes());
        }
        out.write_all(&buf)?;
        Ok(())
    }
}

/// Raw, still-byte-array-typed fields straight off the wire, before
/// numeric conversion and validation in [`Header::from_raw`].
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct RawFileHeader {
    minor_version: [u8; 2],
    major_version: [u8; 2],
    sector_size: [u8; 2],
    mini_sector_size: [u8; 2],
    directory_sectors_len: [u8; 4],
    sector_allocation_table_len: [u8; 4],
    sector_allocation_table_first_sector: [u8; 4],
    standard_stream_min_size: [u8; 4],
    short_sector_allocation_table_first_sector: [u8; 4],
    short_sector_allocation_table_len: [u8; 4],
    master_sector_allocation_table_first_sector: [u8; 4],
    master_sector_allocation_table_len: [u8; 4],
    #[derivative(Debug = "ignore")]
    sector_allocation_table_head: Vec<u32>,
}

pub fn parse_raw_header<R: Read>(read: &mut R) -> Result<RawFileHeader> {
    let mut header = [0u8; constants::HEADER_LENGTH];
    read.read_exact(&mut header).map_err(|_| {
        Error::OleInvalidHeader(HeaderErrorType::NotEnoughBytes(
            constants::HEADER_LENGTH,
            0,
        ))
    })?;

    let _: [u8; 8] = (&header[0..8])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing("signature", err.to_string()))
        })
        .and_then(|signature: [u8; 8]| {
            if signature != constants::MAGIC_BYTES {
                Err(Error::OleInvalidHeader(HeaderErrorType::WrongMagicBytes(
                    signature.into(),
                )))
            } else {
                Ok(signature)
            }
        })?;

    let _: [u8; 16] = (&header[8..24])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "class_identifier",
                err.to_string(),
            ))
        })
        .and_then(|class_identifier| {
            if class_identifier != [0u8; 16] {
                Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "class_identifier",
                    "non-zero entries in class_identifier field".to_string(),
                )))
            } else {
                Ok(class_identifier)
            }
        })?;

    let minor_version: [u8; 2] = (&header[24..26])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing("minor_version", err.to_string()))
        })?;

    let major_version: [u8; 2] = (&header[26..28])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing("major_version", err.to_string()))
        })
        .and_then(|major_version: [u8; 2]| match major_version {
            constants::MAJOR_VERSION_3 | constants::MAJOR_VERSION_4 => Ok(major_version),
            _ => Err(Error::UnsupportedVersion(u16::from_le_bytes(major_version))),
        })?;

    let _: [u8; 2] = (&header[28..30])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "byte_order_identifier",
                err.to_string(),
            ))
        })
        .and_then(
            |byte_order_identifier: [u8; 2]| match byte_order_identifier {
                [0xFE, 0xFF] => Ok(byte_order_identifier),
                _ => Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "byte_order_identifier",
                    format!(
                        "incorrect byte order identifier {:x?}",
                        byte_order_identifier
                    ),
                ))),
            },
        )?;

    let sector_size: [u8; 2] = (&header[30..32])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing("sector_size", err.to_string()))
        })
        .and_then(|sector_size: [u8; 2]| match major_version {
            constants::MAJOR_VERSION_3 if sector_size == constants::SECTOR_SIZE_VERSION_3 => {
                Ok(sector_size)
            }
            constants::MAJOR_VERSION_4 if sector_size == constants::SECTOR_SIZE_VERSION_4 => {
                Ok(sector_size)
            }
            _ => Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "sector_size",
                format!(
                    "incorrect sector size {:x?} for major version {:x?}",
                    sector_size, major_version
                ),
            ))),
        })?;

    let mini_sector_size: [u8; 2] = (&header[32..34])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "mini_sector_size",
                err.to_string(),
            ))
        })
        .and_then(|mini_sector_size: [u8; 2]| match mini_sector_size {
            [0x06, 0x00] => Ok(mini_sector_size),
            _ => Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "mini_sector_size",
                format!("incorrect mini sector size {:x?}", mini_sector_size),
            ))),
        })?;

    let _: [u8; 6] = (&header[34..40])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing("first_reserved", err.to_string()))
        })
        .and_then(|reserved| {
            if reserved != [0u8; 6] {
                Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "first_reserved",
                    "non-zero entries in reserved field".to_string(),
                )))
            } else {
                Ok(reserved)
            }
        })?;

    let directory_sectors_len: [u8; 4] = (&header[40..44])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "directory_sectors_len",
                err.to_string(),
            ))
        })
        .and_then(|directory_sectors_len| {
            if directory_sectors_len != [0u8; 4] && major_version == constants::MAJOR_VERSION_3 {
                Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "directory_sectors_len",
                    "non-zero number of directory sectors with major version 3".to_string(),
                )))
            } else {
                Ok(directory_sectors_len)
            }
        })?;

    let sector_allocation_table_len: [u8; 4] =
        (&header[44..48])
            .try_into()
            .map_err(|err: TryFromSliceError| {
                Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "sector_allocation_table_len",
                    err.to_string(),
                ))
            })?;
    let sector_allocation_table_first_sector: [u8; 4] =
        (&header[48..52])
            .try_into()
            .map_err(|err: TryFromSliceError| {
                Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "sector_allocation_table_first_sector",
                    err.to_string(),
                ))
            })?;
    let _: [u8; 4] = (&header[52..56])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "transaction_signature_number",
                err.to_string(),
            ))
        })?;

    let standard_stream_min_size: [u8; 4] = (&header[56..60])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "standard_stream_min_size",
                err.to_string(),
            ))
        })
        .and_then(|standard_stream_min_size| {
            if standard_stream_min_size != constants::CORRECT_STANDARD_STREAM_MIN_SIZE {
                Err(Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "standard_stream_min_size",
                    format!(
                        "incorrect standard_stream_min_size {:x?}",
                        standard_stream_min_size
                    ),
                )))
            } else {
                Ok(standard_stream_min_size)
            }
        })?;

    let short_sector_allocation_table_first_sector: [u8; 4] = (&header[60..64])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "short_sector_allocation_table_first_sector",
                err.to_string(),
            ))
        })?;
    let short_sector_allocation_table_len: [u8; 4] =
        (&header[64..68])
            .try_into()
            .map_err(|err: TryFromSliceError| {
                Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "short_sector_allocation_table_len",
                    err.to_string(),
                ))
            })?;
    let master_sector_allocation_table_first_sector: [u8; 4] = (&header[68..72])
        .try_into()
        .map_err(|err: TryFromSliceError| {
            Error::OleInvalidHeader(HeaderErrorType::Parsing(
                "master_sector_allocation_table_first_sector",
                err.to_string(),
            ))
        })?;
    let master_sector_allocation_table_len: [u8; 4] =
        (&header[72..76])
            .try_into()
            .map_err(|err: TryFromSliceError| {
                Error::OleInvalidHeader(HeaderErrorType::Parsing(
                    "master_sector_allocation_table_len",
                    err.to_string(),
                ))
            })?;

    let sector_allocation_table_head = (&header[76..512])
        .chunks_exact(4)
        .map(|quad| u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
        .collect::<Vec<_>>();

    Ok(RawFileHeader {
        minor_version,
        major_version,
        sector_size,
        mini_sector_size,
        directory_sectors_len,
        sector_allocation_table_len,
        sector_allocation_table_first_sector,
        standard_stream_min_size,
        short_sector_allocation_table_first_sector,
        short_sector_allocation_table_len,
        master_sector_allocation_table_first_sector,
        master_sector_allocation_table_len,
        sector_allocation_table_head,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_v3_header_round_trips() {
        let header = Header::new_empty(constants::MAJOR_VERSION_3_VALUE).unwrap();
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 512);
        let mut cursor = Cursor::new(buf);
        let raw = parse_raw_header(&mut cursor).unwrap();
        let reparsed = Header::from_raw(raw);
        assert_eq!(reparsed.major_version, constants::MAJOR_VERSION_3_VALUE);
        assert_eq!(reparsed.sector_shift, 9);
        assert_eq!(reparsed.mini_stream_cutoff, constants::DEFAULT_MINI_STREAM_CUTOFF);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = vec![0u8; 512];
        bytes[0] = 0x00;
        let mut cursor = Cursor::new(bytes);
        assert!(parse_raw_header(&mut cursor).is_err());
    }
}
