//! Read, navigate, and rewrite MS Compound File Binary (CFB / OLE2 /
//! "structured storage") containers: the legacy envelope format behind
//! `.doc`/`.xls`/`.ppt` and many embedded-object streams.
//!
//! The engine is a small on-disk filesystem: a header, a two-tiered
//! sector allocation graph (FAT, DIFAT, mini-FAT), a directory tree that
//! names and links storages and streams, and a stream view that presents
//! a logically contiguous byte range over a discontiguous chain of
//! sectors. [`CompoundFile`] ties these together; [`storage::Storage`]
//! and [`storage::Stream`] are the public navigation/read/write handles.
//!
//! ```rust
//! use ole::{CompoundFile, OpenOptions};
//! use std::io::Cursor;
//!
//! let mut cf = CompoundFile::create(
//!     Cursor::new(Vec::new()),
//!     3,
//!     OpenOptions::default(),
//! ).unwrap();
//! {
//!     let mut root = cf.root_storage();
//!     let mut stream = root.add_stream("s1").unwrap();
//!     stream.set_data(&[0x00, 0x01, 0x02, 0x03]).unwrap();
//! }
//! cf.commit(false).unwrap();
//! ```

#[macro_use]
extern crate lazy_static;

mod alloc;
mod cfb;
mod config;
mod constants;
mod directory;
mod error;
mod ftype;
mod header;
mod sector;
mod storage;
mod stream_view;
mod tree;

pub use cfb::CompoundFile;
pub use config::{OpenOptions, UpdateMode};
pub use error::{Error, Result};
pub use ftype::OleFileType;
pub use storage::{EntryInfo, EntryKind, Storage, Stream};
