use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Operation attempted while the map is not in the ACTIVE state.
    NotActive,
    /// Backpressure signal: the write was rejected, retry or shed load.
    Blocked,
    /// Write landed on a level that has been exchanged out (internal retry signal).
    Frozen,
    InvalidLevelMagic,
    UnsupportedLevelVersion(u32),
    ChecksumMismatch,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    CorruptedLevel(String),
    InsufficientSpace { required: u64, available: u64 },
    InvalidState(String),
    InvalidOperation(String),
    LockError(io::Error),
    /// A background pass was cancelled cooperatively during shutdown.
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::NotActive => write!(f, "Storage map is not active"),
            Error::Blocked => write!(f, "Write blocked by backpressure"),
            Error::Frozen => write!(f, "Level is frozen"),
            Error::InvalidLevelMagic => write!(f, "Invalid level file magic"),
            Error::UnsupportedLevelVersion(v) => {
                write!(f, "Unsupported level format version: {}", v)
            }
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::CorruptedLevel(msg) => write!(f, "Corrupted level: {}", msg),
            Error::InsufficientSpace {
                required,
                available,
            } => write!(
                f,
                "Insufficient disk space: {} bytes required, {} available",
                required, available
            ),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::Cancelled => write!(f, "Background pass cancelled"),
        }
    }
}

impl std::error::Error for Error {}
