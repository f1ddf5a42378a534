use nmm_core::id::ManagerHandle;
use thiserror::Error;

/// Result type local to nmm-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Host budget plus spill could not cover the request.
    #[error("out of memory for '{consumer}': requested {requested} bytes, granted {granted} after spilling {spilled}")]
    OutOfMemory {
        consumer: String,
        requested: u64,
        granted: u64,
        spilled: u64,
    },

    /// A release exceeded tracked usage. Always a bookkeeping bug.
    #[error("arithmetic underflow in '{name}': releasing {requested} bytes with only {used} tracked")]
    ArithmeticUnderflow {
        name: String,
        requested: u64,
        used: u64,
    },

    /// Operation invoked outside its required lifecycle context.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("unknown memory manager handle {0}")]
    UnknownHandle(ManagerHandle),

    #[error("usage snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Config(#[from] nmm_core::Error),
}

impl Error {
    /// `OutOfMemory` is the only condition a caller can recover from by
    /// retrying at a higher layer.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Snapshot(e.to_string())
    }
}
