//! MySQL binlog relay core: a durable, restart-safe staging buffer between
//! an upstream primary and downstream replication tasks.
//!
//! The relay subscribes to the upstream replication stream, persists every
//! event into a UUID-suffixed sub-directory under `relay_dir`, keeps a
//! checkpoint (binlog position + GTID set) per sub-directory, recovers a
//! possibly torn file tail on restart, and lets an operator drive the whole
//! thing through the holder state machine.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;

use binlog::Flavor;

pub mod error;
pub mod holder;
pub mod meta;
pub mod purge;
pub mod recover;
pub mod relay;
pub mod retry;

pub use error::{ProcessError, ProcessResult, RelayError};
pub use holder::{RelayHolder, RelayOp, RelayStatus, Stage};
pub use relay::{Process, Relay};

use crate::meta::parse_sub_dir;
use crate::retry::ReaderRetryConfig;

pub mod defaults {
    use std::time::Duration;

    /// Non-rotate meta saves are flushed at most this often; rotate events
    /// and pump exit always flush.
    pub const DEFAULT_FLUSH_META_INTERVAL: Duration = Duration::from_secs(30);
}

/// Relay configuration. Populated by the embedding process; the relay core
/// does not read config files itself.
#[derive(Debug, Clone)]
pub struct RelayConf {
    /// Base directory holding `server-uuid.index` and the sub-directories.
    pub relay_dir: Utf8PathBuf,
    pub flavor: Flavor,
    /// GTID-mode positioning; otherwise filename + offset only.
    pub enable_gtid: bool,
    /// One-shot starting binlog filename applied on the next meta re-setup,
    /// then cleared. Empty means "from the minimum checkpoint".
    pub binlog_name: String,
    /// One-shot starting GTID set, same lifecycle as `binlog_name`.
    pub binlog_gtid: String,
    /// Server id announced to the upstream; 0 asks the upstream for a free
    /// random one during init.
    pub server_id: u32,
    /// One-shot operator override for the next sub-directory suffix; 0 is
    /// unset. Cleared after the next meta re-setup.
    pub uuid_suffix: u32,
    pub reader_retry: ReaderRetryConfig,
    /// Disable fsync. Tests only.
    pub no_sync: bool,
}

impl Default for RelayConf {
    fn default() -> Self {
        RelayConf {
            relay_dir: Utf8PathBuf::from("./relay_log"),
            flavor: Flavor::MySql,
            enable_gtid: false,
            binlog_name: String::new(),
            binlog_gtid: String::new(),
            server_id: 0,
            uuid_suffix: 0,
            reader_retry: ReaderRetryConfig::default(),
            no_sync: false,
        }
    }
}

impl RelayConf {
    pub fn flush_meta_interval(&self) -> Duration {
        defaults::DEFAULT_FLUSH_META_INTERVAL
    }
}

/// The position the pump is currently writing at: sub-directory, file and
/// end offset of the last applied event. Published by the pump, consumed by
/// the purger to bound how far a purge may go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayLogInfo {
    /// `<uuid>.<suffix>` sub-directory name.
    pub sub_dir: String,
    pub uuid_suffix: u32,
    pub filename: String,
    /// End offset of the last applied event in `filename`.
    pub pos: u64,
}

impl RelayLogInfo {
    pub fn new(sub_dir: &str, filename: impl Into<String>, pos: u64) -> Result<Self, RelayError> {
        let (_, uuid_suffix) = parse_sub_dir(sub_dir)?;
        Ok(RelayLogInfo {
            sub_dir: sub_dir.to_string(),
            uuid_suffix,
            filename: filename.into(),
            pos,
        })
    }

    /// Ordering used for purge safety: sub-directory suffix first, then
    /// filename, lexicographically. The offset does not participate.
    pub fn earlier(&self, other: &RelayLogInfo) -> bool {
        (self.uuid_suffix, self.filename.as_str()) < (other.uuid_suffix, other.filename.as_str())
    }
}

impl fmt::Display for RelayLogInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sub_dir, self.filename)
    }
}
