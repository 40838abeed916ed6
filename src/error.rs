/// Error types for the mmdbkit library
use std::fmt;
use std::io;

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, MmdbError>;

/// Fallback message for errors that reach the boundary without one.
///
/// The spelling is preserved from the system this engine replaces; callers
/// match on it.
const UNKNOWN_FALLBACK: &str = "An unknown error has occured.";

/// Main error type for database operations
///
/// The taxonomy is closed: every failure from a lower layer is mapped onto
/// one of these variants before it crosses the public API. Anything that
/// does not fit becomes `Unknown`, never an open-ended dynamic type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmdbError {
    /// I/O failure opening, reading, or mapping the database file
    Open(String),

    /// Malformed container or metadata (missing marker, bad fields)
    Format(String),

    /// Corrupt database content (unknown type tag, bad tree record,
    /// pointer cycle, truncated data)
    InvalidDatabase(String),

    /// Address not present in the database; raised only by strict lookups
    AddressNotFound(String),

    /// Any failure that does not fit the taxonomy above
    Unknown(String),
}

impl fmt::Display for MmdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmdbError::Open(msg) => write!(f, "Open error: {}", msg),
            MmdbError::Format(msg) => write!(f, "Format error: {}", msg),
            MmdbError::InvalidDatabase(msg) => write!(f, "{}", msg),
            MmdbError::AddressNotFound(msg) => write!(f, "Address not found: {}", msg),
            MmdbError::Unknown(msg) => {
                if msg.is_empty() {
                    write!(f, "{}", UNKNOWN_FALLBACK)
                } else {
                    write!(f, "{}", msg)
                }
            }
        }
    }
}

impl std::error::Error for MmdbError {}

impl From<io::Error> for MmdbError {
    fn from(err: io::Error) -> Self {
        MmdbError::Open(err.to_string())
    }
}

impl From<String> for MmdbError {
    fn from(msg: String) -> Self {
        MmdbError::Unknown(msg)
    }
}

impl From<&str> for MmdbError {
    fn from(msg: &str) -> Self {
        MmdbError::Unknown(msg.to_string())
    }
}
