//! Single error type for the crate. Every fallible public function returns
//! [`Result<T>`].

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("InvalidHeader => {0}")]
    OleInvalidHeader(HeaderErrorType),

    #[error("CorruptedFormat => {0}")]
    CorruptedFormat(String),

    #[error("UnsupportedVersion => major version {0} is not 3 or 4")]
    UnsupportedVersion(u16),

    #[error("ItemNotFound => {0}")]
    ItemNotFound(String),

    #[error("DuplicatedItem => {0}")]
    DuplicatedItem(String),

    #[error("InvalidName => {0}")]
    InvalidName(String),

    #[error("InvalidOperation => {0}")]
    InvalidOperation(&'static str),

    #[error("Disposed => the compound file has already been closed")]
    Disposed,

    #[error("InvalidDirectoryEntry => {0}")]
    OleInvalidDirectoryEntry(&'static str, String),

    #[error("StdIo => {0}")]
    StdIo(#[from] std::io::Error),

    #[error("FromUtf16 => {0}")]
    FromUtf16(#[from] std::string::FromUtf16Error),
}

#[derive(thiserror::Error, Debug)]
pub enum HeaderErrorType {
    #[error("the magic number was expected but not found, found {0:?} instead")]
    WrongMagicBytes(Vec<u8>),
    #[error("tried to read {0} bytes, found {1} bytes")]
    NotEnoughBytes(usize, usize),
    #[error("ParsingLocation => {0} UnderlyingError => {1}")]
    Parsing(&'static str, String),
}
