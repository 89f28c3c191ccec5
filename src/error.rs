use std::fmt;

#[derive(Debug)]
pub enum Error {
    Storage(String),
    Codec(String),
    NotFound { what: String },
    DuplicateOp { op_id: String },
    InvalidState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::Codec(msg) => write!(f, "codec error: {}", msg),
            Error::NotFound { what } => write!(f, "not found: {}", what),
            Error::DuplicateOp { op_id } => write!(f, "duplicate operation: {}", op_id),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
