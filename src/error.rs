//! Error types for point streaming and index builds

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Cannot open mesh source {}: {reason}", .path.display())]
    SourceOpen { path: PathBuf, reason: String },

    #[error("Mesh source read failed: {0}")]
    SourceRead(String),

    #[error("Malformed point record: expected 72 bytes, got {len}")]
    MalformedRecord { len: usize },

    #[error("Index capacity exceeded: declared {capacity} records")]
    CapacityExceeded { capacity: u64 },

    #[error("Mesh source cannot be rewound")]
    UnsupportedReset,

    #[error("Cursor failed on an earlier read; reset before streaming again")]
    CursorFailed,

    #[error("Key-value store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Index builder already closed")]
    BuilderClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rocksdb::Error> for IndexError {
    fn from(e: rocksdb::Error) -> Self {
        IndexError::StoreUnavailable(e.into_string())
    }
}

impl IndexError {
    /// Stable error code for trial reports
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::SourceOpen { .. } => "SOURCE_OPEN",
            IndexError::SourceRead(_) => "SOURCE_READ",
            IndexError::MalformedRecord { .. } => "MALFORMED_RECORD",
            IndexError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            IndexError::UnsupportedReset => "UNSUPPORTED_RESET",
            IndexError::CursorFailed => "CURSOR_FAILED",
            IndexError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            IndexError::BuilderClosed => "BUILDER_CLOSED",
            IndexError::InvalidConfig(_) => "INVALID_CONFIG",
            IndexError::InvalidFormat(_) => "INVALID_FORMAT",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether the error should abort the whole run rather than one trial.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, IndexError::SourceOpen { .. })
    }
}
