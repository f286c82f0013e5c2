//! Purging old relay files.
//!
//! The filename strategy mirrors `PURGE BINARY LOGS TO`: delete every relay
//! file lexicographically earlier than a named safe file, plus everything in
//! earlier sub-directories. The safe point is clamped to the pump's active
//! relay log so a purge can never outrun the reader. Deletion is
//! best-effort per file and idempotent on retry; checkpoints
//! (`relay.meta`) and the uuid index are never touched.

use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::error::RelayError;
use crate::meta::{parse_sub_dir, verify_binlog_filename};
use crate::RelayLogInfo;

/// Arguments for a purge request. Each strategy accepts exactly one
/// variant; handing it another fails with `InvalidArgs`.
#[derive(Debug)]
pub enum PurgeArgs {
    Filename(FilenameArgs),
}

#[derive(Debug)]
pub struct FilenameArgs {
    pub relay_base_dir: Utf8PathBuf,
    /// End-safe filename: files lexicographically earlier than this are
    /// purged.
    pub filename: String,
    /// Sub-directory `filename` lives in; empty selects the latest.
    pub sub_dir: String,
    /// Every sub-directory, in index order.
    pub uuids: Vec<String>,
    safe_relay_log: Option<RelayLogInfo>,
}

impl FilenameArgs {
    pub fn new(
        relay_base_dir: impl Into<Utf8PathBuf>,
        filename: impl Into<String>,
        sub_dir: impl Into<String>,
        uuids: Vec<String>,
    ) -> FilenameArgs {
        FilenameArgs {
            relay_base_dir: relay_base_dir.into(),
            filename: filename.into(),
            sub_dir: sub_dir.into(),
            uuids,
            safe_relay_log: None,
        }
    }

    /// Resolve the safe purge point against the pump's active relay log:
    /// the requested point, clamped back to the active file if that is
    /// earlier, with later sub-directories dropped from the work list.
    pub fn set_active_relay_log(
        &mut self,
        active: Option<&RelayLogInfo>,
    ) -> Result<(), RelayError> {
        let sub_dir = if self.sub_dir.is_empty() {
            self.uuids
                .last()
                .cloned()
                .ok_or_else(|| RelayError::InvalidArgs("no relay sub-directories".into()))?
        } else {
            self.sub_dir.clone()
        };

        let mut safe = RelayLogInfo::new(&sub_dir, self.filename.clone(), 0)
            .map_err(|e| RelayError::InvalidArgs(e.to_string()))?;
        if let Some(active) = active {
            if active.earlier(&safe) {
                safe = active.clone();
            }
        }

        // drop sub-directories newer than the safe point
        let mut uuids = Vec::with_capacity(self.uuids.len());
        for uuid in &self.uuids {
            let (_, suffix) = parse_sub_dir(uuid)?;
            if suffix > safe.uuid_suffix {
                break;
            }
            uuids.push(uuid.clone());
        }
        self.uuids = uuids;
        self.safe_relay_log = Some(safe);
        Ok(())
    }
}

impl fmt::Display for FilenameArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(relay_base_dir: {}, filename: {}, sub_dir: {}, uuids: {}, safe: {})",
            self.relay_base_dir,
            self.filename,
            self.sub_dir,
            self.uuids.join(";"),
            match &self.safe_relay_log {
                Some(safe) => safe.to_string(),
                None => "<unset>".to_string(),
            }
        )
    }
}

/// A way of deciding what to purge and doing it.
pub trait PurgeStrategy: Send + Sync {
    /// Whether the strategy wants to run in the background right now.
    fn check(&self, args: &PurgeArgs) -> Result<bool, RelayError>;

    /// Run one purge. At most one purge runs at a time; a concurrent call
    /// fails with `SelfPurging`.
    fn do_purge(&self, args: &PurgeArgs) -> Result<(), RelayError>;

    fn purging(&self) -> bool;
}

/// Purge up to a named file. Manually triggered only.
#[derive(Debug, Default)]
pub struct FilenameStrategy {
    purging: AtomicBool,
}

impl FilenameStrategy {
    pub fn new() -> FilenameStrategy {
        FilenameStrategy::default()
    }
}

impl PurgeStrategy for FilenameStrategy {
    fn check(&self, _args: &PurgeArgs) -> Result<bool, RelayError> {
        // never purges in the background
        Ok(false)
    }

    fn do_purge(&self, args: &PurgeArgs) -> Result<(), RelayError> {
        if self
            .purging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RelayError::SelfPurging);
        }
        let result = (|| {
            let PurgeArgs::Filename(fa) = args;
            let safe = fa.safe_relay_log.as_ref().ok_or_else(|| {
                RelayError::InvalidArgs(format!("safe relay log not resolved for {fa}"))
            })?;
            info!(args = %fa, "purging relay files by filename");
            purge_relay_files_before(&fa.relay_base_dir, &fa.uuids, safe)
        })();
        self.purging.store(false, Ordering::Release);
        result
    }

    fn purging(&self) -> bool {
        self.purging.load(Ordering::Acquire)
    }
}

/// Delete every relay file earlier than `safe`: all binlog files in
/// sub-directories before the safe one, and files lexicographically earlier
/// than the safe filename inside it.
fn purge_relay_files_before(
    base_dir: &Utf8Path,
    uuids: &[String],
    safe: &RelayLogInfo,
) -> Result<(), RelayError> {
    for uuid in uuids {
        let dir = base_dir.join(uuid);
        if !dir.exists() {
            continue;
        }
        let whole_dir = *uuid != safe.sub_dir;
        let mut removed = 0usize;
        for filename in collect_binlog_files(&dir)? {
            if !whole_dir && filename.as_str() >= safe.filename.as_str() {
                continue;
            }
            let path = dir.join(&filename);
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove relay file {path}"))?;
            removed += 1;
        }
        info!(sub_dir = %uuid, removed, "purged relay files");
    }
    Ok(())
}

/// Binlog-named files in `dir`, sorted. Checkpoints, the index and temp
/// files never qualify.
fn collect_binlog_files(dir: &Utf8Path) -> Result<Vec<String>, RelayError> {
    let mut files = Vec::new();
    let entries =
        dir.read_dir_utf8().with_context(|| format!("failed to list {dir}"))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {dir}"))?;
        let name = entry.file_name();
        if verify_binlog_filename(name)
            && entry
                .file_type()
                .with_context(|| format!("failed to stat {name}"))?
                .is_file()
        {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Front door for operator-triggered purges.
#[derive(Debug, Default)]
pub struct Purger {
    filename: FilenameStrategy,
}

impl Purger {
    pub fn new() -> Purger {
        Purger::default()
    }

    /// Purge by filename, clamped to the pump's active relay log.
    pub fn purge_to_filename(
        &self,
        mut args: FilenameArgs,
        active: Option<&RelayLogInfo>,
    ) -> Result<(), RelayError> {
        args.set_active_relay_log(active)?;
        self.filename.do_purge(&PurgeArgs::Filename(args))
    }

    pub fn purging(&self) -> bool {
        self.filename.purging()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    const UUID: &str = "24ecd093-8cec-11e9-aa0d-0242ac170002";

    fn sub(suffix: u32) -> String {
        format!("{UUID}.{suffix:06}")
    }

    fn touch_files(dir: &Utf8Path, sub_dir: &str, names: &[&str]) {
        let d = dir.join(sub_dir);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("relay.meta"), "binlog-name = \nbinlog-pos = 4\nbinlog-gtid = \n")
            .unwrap();
        for name in names {
            fs::write(d.join(name), b"x").unwrap();
        }
    }

    fn remaining(dir: &Utf8Path, sub_dir: &str) -> Vec<String> {
        collect_binlog_files(&dir.join(sub_dir)).unwrap()
    }

    #[test]
    fn test_purge_respects_active_relay_log() {
        let dir = Utf8TempDir::new().unwrap();
        let files = [
            "mysql-bin.000001",
            "mysql-bin.000002",
            "mysql-bin.000003",
            "mysql-bin.000004",
            "mysql-bin.000005",
        ];
        touch_files(dir.path(), &sub(1), &files);

        let active = RelayLogInfo::new(&sub(1), "mysql-bin.000003", 4).unwrap();
        let purger = Purger::new();
        purger
            .purge_to_filename(
                FilenameArgs::new(dir.path(), "mysql-bin.000004", "", vec![sub(1)]),
                Some(&active),
            )
            .unwrap();

        assert_eq!(
            remaining(dir.path(), &sub(1)),
            vec![
                "mysql-bin.000003".to_string(),
                "mysql-bin.000004".to_string(),
                "mysql-bin.000005".to_string(),
            ]
        );
        // the checkpoint survives
        assert!(dir.path().join(sub(1)).join("relay.meta").exists());
    }

    #[test]
    fn test_purge_earlier_sub_dirs_fully() {
        let dir = Utf8TempDir::new().unwrap();
        touch_files(
            dir.path(),
            &sub(1),
            &["mysql-bin.000001", "mysql-bin.000002"],
        );
        touch_files(
            dir.path(),
            &sub(2),
            &["mysql-bin.000001", "mysql-bin.000002"],
        );

        let active = RelayLogInfo::new(&sub(2), "mysql-bin.000002", 4).unwrap();
        let purger = Purger::new();
        purger
            .purge_to_filename(
                FilenameArgs::new(
                    dir.path(),
                    "mysql-bin.000002",
                    sub(2),
                    vec![sub(1), sub(2)],
                ),
                Some(&active),
            )
            .unwrap();

        assert!(remaining(dir.path(), &sub(1)).is_empty());
        assert_eq!(
            remaining(dir.path(), &sub(2)),
            vec!["mysql-bin.000002".to_string()]
        );
    }

    #[test]
    fn test_sub_dirs_newer_than_safe_point_are_skipped() {
        let dir = Utf8TempDir::new().unwrap();
        touch_files(dir.path(), &sub(1), &["mysql-bin.000001"]);
        touch_files(dir.path(), &sub(2), &["mysql-bin.000001"]);

        let mut args = FilenameArgs::new(
            dir.path(),
            "mysql-bin.000009",
            sub(1),
            vec![sub(1), sub(2)],
        );
        args.set_active_relay_log(None).unwrap();
        assert_eq!(args.uuids, vec![sub(1)]);
    }

    #[test]
    fn test_unresolved_safe_point_is_invalid_args() {
        let strategy = FilenameStrategy::new();
        let args = PurgeArgs::Filename(FilenameArgs::new(
            "/nonexistent",
            "mysql-bin.000001",
            "",
            vec![sub(1)],
        ));
        assert!(matches!(
            strategy.do_purge(&args),
            Err(RelayError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_purge_single_flight() {
        let strategy = FilenameStrategy::new();
        strategy.purging.store(true, Ordering::Release);
        let mut fa =
            FilenameArgs::new("/nonexistent", "mysql-bin.000001", "", vec![sub(1)]);
        fa.set_active_relay_log(None).unwrap();
        assert!(matches!(
            strategy.do_purge(&PurgeArgs::Filename(fa)),
            Err(RelayError::SelfPurging)
        ));
        assert!(strategy.purging());
    }

    #[test]
    fn test_check_never_fires() {
        let strategy = FilenameStrategy::new();
        let mut fa = FilenameArgs::new("/tmp", "mysql-bin.000001", "", vec![sub(1)]);
        fa.set_active_relay_log(None).unwrap();
        assert!(!strategy.check(&PurgeArgs::Filename(fa)).unwrap());
    }

    #[test]
    fn test_purge_is_idempotent() {
        let dir = Utf8TempDir::new().unwrap();
        touch_files(
            dir.path(),
            &sub(1),
            &["mysql-bin.000001", "mysql-bin.000002", "mysql-bin.000003"],
        );

        let purger = Purger::new();
        for _ in 0..2 {
            purger
                .purge_to_filename(
                    FilenameArgs::new(dir.path(), "mysql-bin.000003", "", vec![sub(1)]),
                    None,
                )
                .unwrap();
            assert_eq!(
                remaining(dir.path(), &sub(1)),
                vec!["mysql-bin.000003".to_string()]
            );
        }
    }
}
