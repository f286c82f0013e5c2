//! Operator-facing error taxonomy and the pump's result surface.

use std::fmt;

use serde::Serialize;

/// Errors surfaced through the operator API and the meta/purge/holder
/// layers. Internal plumbing uses `anyhow` and lands in `Other`.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Meta or index content on disk can not be parsed, or a relay file
    /// header is structurally unusable.
    #[error("corrupt relay meta: {0}")]
    MetaCorrupt(String),
    /// An operator op is not valid in the current holder stage. The message
    /// names the stage, e.g. "current stage is Paused".
    #[error("invalid stage: {0}")]
    InvalidStage(String),
    #[error("relay operation {0} not supported")]
    UnsupportedOp(String),
    /// A purge is already in flight.
    #[error("relay purger is already purging")]
    SelfPurging,
    /// The purger was handed unusable arguments.
    #[error("invalid purge arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors a `Reader` can yield. The pump maps `Canceled` to a canceled
/// process result and propagates everything else unwrapped.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("binlog checksum mismatch")]
    ChecksumMismatch,
    #[error("sync was closed")]
    SyncClosed,
    #[error("need to sync again")]
    NeedSyncAgain,
    #[error("reader canceled")]
    Canceled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How one pump run ended. Everything the pump hit is captured verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub is_canceled: bool,
    pub errors: Vec<ProcessError>,
}

impl ProcessResult {
    pub fn canceled() -> ProcessResult {
        ProcessResult {
            is_canceled: true,
            errors: Vec::new(),
        }
    }

    pub fn with_error(err: impl fmt::Display) -> ProcessResult {
        ProcessResult {
            is_canceled: false,
            errors: vec![ProcessError::new(err)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessError {
    pub msg: String,
}

impl ProcessError {
    pub fn new(err: impl fmt::Display) -> ProcessError {
        ProcessError {
            msg: format!("{err:#}"),
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

/// Human-readable error snapshot returned by the holder's `error()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayErrorInfo {
    pub msg: String,
}
