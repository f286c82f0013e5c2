//! MySQL/MariaDB binlog format support for the relay: event framing and
//! checksums, GTID set algebra, and an event generator for tests.
//!
//! This crate knows nothing about directories, meta files or lifecycles;
//! it only understands bytes in the binlog wire/file format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod event;
pub mod gen;
pub mod gtid;

pub use event::{Event, EventDecoder, EventHeader, EventPayload, EventType};
pub use gtid::GtidSet;

/// Upstream server flavor. Governs which GTID representation is used and
/// which header events are expected in a relay file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flavor {
    MySql,
    MariaDb,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::MySql => "mysql",
            Flavor::MariaDb => "mariadb",
        }
    }
}

impl Default for Flavor {
    fn default() -> Self {
        Flavor::MySql
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(Flavor::MySql),
            "mariadb" => Ok(Flavor::MariaDb),
            other => Err(anyhow::anyhow!("unknown flavor {other:?}")),
        }
    }
}
