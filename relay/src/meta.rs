//! Relay meta persistence: per-sub-directory checkpoint and the
//! `server-uuid.index` file.
//!
//! Layout under `relay_dir`:
//!
//! ```text
//! server-uuid.index        one "<uuid>.<suffix>" per line, append-only
//! <uuid>.<suffix>/
//!   relay.meta             binlog-name / binlog-pos / binlog-gtid
//!   mysql-bin.000001
//!   ...
//! ```
//!
//! The meta file is rewritten via temp file + fsync + rename + directory
//! fsync so a crash never leaves a torn checkpoint. The index is only ever
//! appended to.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use binlog::{Flavor, GtidSet};

use crate::error::RelayError;

pub const UUID_INDEX_FILENAME: &str = "server-uuid.index";
pub const META_FILENAME: &str = "relay.meta";
const META_TMP_FILENAME: &str = "relay.meta.tmp";

const SUFFIX_WIDTH: usize = 6;

/// A binlog position: filename plus byte offset. Within one sub-directory
/// filenames order lexicographically, so the derived ordering is the stream
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Position {
    pub name: String,
    pub pos: u64,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u64) -> Position {
        Position {
            name: name.into(),
            pos,
        }
    }

    /// The position before any real event: no file yet, offset 4 (the size
    /// of the binlog magic).
    pub fn min_checkpoint() -> Position {
        Position {
            name: String::new(),
            pos: 4,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// `<uuid>.<suffix>` with a six-digit zero-padded decimal suffix.
pub fn sub_dir_name(uuid: &str, suffix: u32) -> String {
    format!("{uuid}.{suffix:06}")
}

pub fn parse_sub_dir(name: &str) -> Result<(String, u32), RelayError> {
    let corrupt = || RelayError::MetaCorrupt(format!("invalid sub-directory name {name:?}"));
    let (uuid, suffix) = name.rsplit_once('.').ok_or_else(corrupt)?;
    if uuid.len() != 36 || suffix.len() != SUFFIX_WIDTH {
        return Err(corrupt());
    }
    let suffix: u32 = suffix.parse().map_err(|_| corrupt())?;
    if suffix == 0 {
        return Err(corrupt());
    }
    Ok((uuid.to_string(), suffix))
}

/// True for `mysql-bin.000001`-style names: a non-empty base, a dot, an
/// all-digit sequence.
pub fn verify_binlog_filename(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((base, seq)) => {
            !base.is_empty() && !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

struct Inner {
    /// Every sub-directory ever created, in creation order. The last entry
    /// is the active one.
    uuids: Vec<String>,
    current: Option<String>,
    pos: Position,
    gset: GtidSet,
    dirty: bool,
}

/// The per-source meta store. All operations are serialized on an internal
/// mutex; file IO happens under it, which keeps `add_dir` atomic with
/// respect to observers.
pub struct LocalMeta {
    relay_dir: Utf8PathBuf,
    flavor: Flavor,
    no_sync: bool,
    inner: Mutex<Inner>,
}

impl LocalMeta {
    pub fn new(relay_dir: impl Into<Utf8PathBuf>, flavor: Flavor, no_sync: bool) -> LocalMeta {
        LocalMeta {
            relay_dir: relay_dir.into(),
            flavor,
            no_sync,
            inner: Mutex::new(Inner {
                uuids: Vec::new(),
                current: None,
                pos: Position::min_checkpoint(),
                gset: GtidSet::empty(flavor),
                dirty: false,
            }),
        }
    }

    pub fn relay_dir(&self) -> &Utf8Path {
        &self.relay_dir
    }

    /// Read the index and the active sub-directory's meta file. Absent files
    /// initialize to the empty state / minimum checkpoint.
    pub fn load(&self) -> Result<(), RelayError> {
        let mut inner = self.lock();

        let index_path = self.relay_dir.join(UUID_INDEX_FILENAME);
        let mut uuids = Vec::new();
        if index_path.exists() {
            let content = fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read {index_path}"))
                .map_err(RelayError::Other)?;
            let mut last_suffix = 0u32;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (_, suffix) = parse_sub_dir(line)?;
                if suffix <= last_suffix {
                    return Err(RelayError::MetaCorrupt(format!(
                        "uuid index is not monotonic at {line:?}"
                    )));
                }
                last_suffix = suffix;
                uuids.push(line.to_string());
            }
        }

        inner.current = uuids.last().cloned();
        inner.uuids = uuids;
        inner.pos = Position::min_checkpoint();
        inner.gset = GtidSet::empty(self.flavor);
        inner.dirty = false;

        if let Some(current) = inner.current.clone() {
            let meta_path = self.relay_dir.join(&current).join(META_FILENAME);
            if meta_path.exists() {
                let (pos, gset) = self.read_meta_file(&meta_path)?;
                inner.pos = pos;
                inner.gset = gset;
            }
        }
        Ok(())
    }

    fn read_meta_file(&self, path: &Utf8Path) -> Result<(Position, GtidSet), RelayError> {
        let corrupt =
            |reason: String| RelayError::MetaCorrupt(format!("meta file {path}: {reason}"));
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {path}"))
            .map_err(RelayError::Other)?;

        let mut name = None;
        let mut pos = None;
        let mut gtid = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| corrupt(format!("bad line {line:?}")))?;
            match key.trim() {
                "binlog-name" => name = Some(value.trim().to_string()),
                "binlog-pos" => {
                    pos = Some(
                        value
                            .trim()
                            .parse::<u64>()
                            .map_err(|e| corrupt(format!("bad binlog-pos: {e}")))?,
                    )
                }
                "binlog-gtid" => gtid = Some(value.trim().to_string()),
                other => return Err(corrupt(format!("unknown field {other:?}"))),
            }
        }

        let name = name.ok_or_else(|| corrupt("missing binlog-name".into()))?;
        let pos = pos.ok_or_else(|| corrupt("missing binlog-pos".into()))?;
        let gset = GtidSet::parse(self.flavor, gtid.as_deref().unwrap_or(""))
            .map_err(|e| corrupt(e.to_string()))?;
        Ok((Position { name, pos }, gset))
    }

    /// Append a new sub-directory for `uuid` and make it active.
    ///
    /// With `suffix == 0` the next suffix is computed (last + 1, or 1). A
    /// non-zero `suffix` is an operator override: it may re-activate the
    /// last indexed sub-directory or start a later one, but never rewind
    /// below it, so the index stays append-only.
    pub fn add_dir(
        &self,
        uuid: &str,
        pos: Option<Position>,
        gset: Option<GtidSet>,
        suffix: u32,
    ) -> Result<(), RelayError> {
        let mut inner = self.lock();

        let last_suffix = match inner.uuids.last() {
            Some(last) => parse_sub_dir(last)?.1,
            None => 0,
        };
        let (name, append) = if suffix == 0 {
            (sub_dir_name(uuid, last_suffix + 1), true)
        } else {
            let name = sub_dir_name(uuid, suffix);
            if inner.uuids.last() == Some(&name) {
                (name, false)
            } else if suffix > last_suffix {
                (name, true)
            } else {
                return Err(RelayError::InvalidArgs(format!(
                    "uuid suffix {suffix} does not advance past the indexed suffix {last_suffix}"
                )));
            }
        };

        let dir = self.relay_dir.join(&name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create sub-directory {dir}"))?;
        self.fsync_dir(&self.relay_dir)?;

        inner.pos = pos.unwrap_or_else(Position::min_checkpoint);
        inner.gset = gset.unwrap_or_else(|| GtidSet::empty(self.flavor));
        inner.current = Some(name.clone());
        self.write_meta_file(&mut inner)?;

        if append {
            self.append_index(&name)?;
            inner.uuids.push(name.clone());
        }
        info!(sub_dir = %name, "added relay sub-directory");
        Ok(())
    }

    /// Apply the configured one-shot start point. Only effective while the
    /// active sub-meta is still virgin (minimum checkpoint, empty GTID
    /// set); returns whether anything was adjusted.
    pub fn adjust_with_start_pos(
        &self,
        binlog_name: &str,
        binlog_gtid: &str,
        enable_gtid: bool,
    ) -> Result<bool, RelayError> {
        let mut inner = self.lock();
        if inner.current.is_none()
            || inner.pos != Position::min_checkpoint()
            || !inner.gset.is_empty()
        {
            return Ok(false);
        }

        let gset = if enable_gtid {
            GtidSet::parse(self.flavor, binlog_gtid)
                .map_err(|e| RelayError::InvalidArgs(e.to_string()))?
        } else {
            GtidSet::empty(self.flavor)
        };
        if !binlog_name.is_empty() && !verify_binlog_filename(binlog_name) {
            return Err(RelayError::InvalidArgs(format!(
                "invalid binlog filename {binlog_name:?}"
            )));
        }
        if binlog_name.is_empty() && gset.is_empty() {
            return Ok(false);
        }

        inner.pos = Position {
            name: binlog_name.to_string(),
            pos: 4,
        };
        inner.gset = gset;
        self.write_meta_file(&mut inner)?;
        Ok(true)
    }

    pub fn pos(&self) -> (String, Position) {
        let inner = self.lock();
        (
            inner.current.clone().unwrap_or_default(),
            inner.pos.clone(),
        )
    }

    pub fn gtid(&self) -> (String, GtidSet) {
        let inner = self.lock();
        (
            inner.current.clone().unwrap_or_default(),
            inner.gset.clone(),
        )
    }

    /// Buffer a checkpoint update; `flush` persists it.
    pub fn save(&self, pos: Position, gset: Option<GtidSet>) -> Result<(), RelayError> {
        let mut inner = self.lock();
        if inner.current.is_none() {
            return Err(RelayError::Other(anyhow::anyhow!(
                "no active relay sub-directory to save meta into"
            )));
        }
        inner.pos = pos;
        if let Some(gset) = gset {
            inner.gset = gset;
        }
        inner.dirty = true;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), RelayError> {
        let mut inner = self.lock();
        if inner.current.is_none() {
            return Err(RelayError::Other(anyhow::anyhow!(
                "no active relay sub-directory to flush meta into"
            )));
        }
        self.write_meta_file(&mut inner)
    }

    pub fn dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Extend the buffered GTID set with the upstream's purged prefix and
    /// persist when anything changed.
    pub fn extend_gtid_with_purged(&self, purged: &GtidSet) -> Result<bool, RelayError> {
        let mut inner = self.lock();
        if inner.current.is_none() || !inner.gset.extend_with_purged(purged) {
            return Ok(false);
        }
        self.write_meta_file(&mut inner)?;
        Ok(true)
    }

    /// Path of the active sub-directory.
    pub fn dir(&self) -> Option<Utf8PathBuf> {
        self.lock()
            .current
            .as_ref()
            .map(|c| self.relay_dir.join(c))
    }

    pub fn current_uuid(&self) -> Option<String> {
        self.lock().current.clone()
    }

    pub fn uuids(&self) -> Vec<String> {
        self.lock().uuids.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("relay meta mutex poisoned")
    }

    fn write_meta_file(&self, inner: &mut Inner) -> Result<(), RelayError> {
        let current = inner
            .current
            .as_ref()
            .expect("write_meta_file requires an active sub-directory");
        let dir = self.relay_dir.join(current);
        let content = format!(
            "binlog-name = {}\nbinlog-pos = {}\nbinlog-gtid = {}\n",
            inner.pos.name, inner.pos.pos, inner.gset
        );

        let tmp_path = dir.join(META_TMP_FILENAME);
        let final_path = dir.join(META_FILENAME);
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("failed to create {tmp_path}"))?;
        tmp.write_all(content.as_bytes())
            .with_context(|| format!("failed to write {tmp_path}"))?;
        if !self.no_sync {
            tmp.sync_all()
                .with_context(|| format!("failed to sync {tmp_path}"))?;
        }
        drop(tmp);
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("failed to rename {tmp_path} to {final_path}"))?;
        self.fsync_dir(&dir)?;

        inner.dirty = false;
        Ok(())
    }

    fn append_index(&self, line: &str) -> Result<(), RelayError> {
        let path = self.relay_dir.join(UUID_INDEX_FILENAME);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {path}"))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {path}"))?;
        if !self.no_sync {
            file.sync_all()
                .with_context(|| format!("failed to sync {path}"))?;
        }
        Ok(())
    }

    fn fsync_dir(&self, dir: &Utf8Path) -> Result<(), RelayError> {
        if self.no_sync {
            return Ok(());
        }
        File::open(dir)
            .and_then(|f| f.sync_all())
            .with_context(|| format!("failed to sync directory {dir}"))?;
        Ok(())
    }
}
