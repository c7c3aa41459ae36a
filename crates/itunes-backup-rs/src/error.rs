use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The manifest could not be read from disk
    #[error("IO error reading manifest - {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest too short: {0} bytes")]
    BufferTooShort(usize),

    /// No well-ordered tag group was found inside the proximity window
    #[error("No {group} record group found")]
    RecordNotFound { group: &'static str },

    /// A record declares more payload than the buffer holds
    #[error("Truncated {tag} record: declared {declared} bytes, {available} available")]
    Truncated {
        tag: &'static str,
        declared: usize,
        available: usize,
    },

    #[error("Cannot decode {len}-byte {tag} record as an integer")]
    InvalidInteger { tag: &'static str, len: usize },

    #[error("Missing components (WPKY, SALT or ITER)")]
    MissingFields,

    #[error("Incorrect {field} length: expected {expected} bytes, found {found}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// DPIC is zero or DPSL has the wrong length
    #[error("Invalid DPIC/DPSL")]
    InvalidSecondary,
}
