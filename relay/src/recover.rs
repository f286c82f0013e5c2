//! Crash recovery of the latest relay file.
//!
//! The writer may have died mid-event, and the persisted checkpoint may be
//! ahead of what actually landed on disk (flushed early) or behind it
//! (flushed late). The on-disk prefix of complete events is the single
//! source of truth: scan the file for the last complete event boundary,
//! truncate anything past it, and align the checkpoint to the result.

use std::fs::OpenOptions;
use std::io::Read;

use anyhow::Context;
use camino::Utf8Path;
use tracing::{debug, info, warn};

use binlog::event::{DecodeError, EventDecoder, EventPayload, GtidEvent, BINLOG_MAGIC};
use binlog::{Flavor, GtidSet};

use crate::error::RelayError;
use crate::meta::{LocalMeta, Position};

const SCAN_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub struct RecoverResult {
    /// Whether the checkpoint was rewritten.
    pub recovered: bool,
    /// Whether bytes were cut off the file.
    pub truncated: bool,
    pub latest_pos: Position,
    pub latest_gtids: GtidSet,
}

struct ScanOutcome {
    /// End offset of the last complete event (at least the magic length).
    last_good: u64,
    file_len: u64,
    /// GTID set computed from the file: previous-GTIDs seed plus every
    /// committed transaction.
    gtids: Option<GtidSet>,
}

/// Recover the relay file the checkpoint points at, truncating a torn tail
/// and re-aligning the checkpoint. No-op when the checkpoint names no file
/// or the file does not exist yet. Idempotent.
pub fn try_recover_latest_file(
    meta: &LocalMeta,
    flavor: Flavor,
    purged: Option<&GtidSet>,
    no_sync: bool,
) -> Result<RecoverResult, RelayError> {
    let (_, latest_pos) = meta.pos();
    let (_, persisted_gtids) = meta.gtid();

    let nothing = |pos: Position, gtids: GtidSet| RecoverResult {
        recovered: false,
        truncated: false,
        latest_pos: pos,
        latest_gtids: gtids,
    };

    if latest_pos.name.is_empty() {
        return Ok(nothing(latest_pos, persisted_gtids));
    }
    let dir = meta.dir().ok_or_else(|| {
        RelayError::MetaCorrupt("checkpoint names a file but no sub-directory is active".into())
    })?;
    let path = dir.join(&latest_pos.name);
    if !path.exists() {
        // the pump will create it on its next run
        return Ok(nothing(latest_pos, persisted_gtids));
    }

    let scan = scan_file(&path, flavor)?;
    let truncated = scan.last_good < scan.file_len;
    if truncated {
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {path} for truncation"))?;
        file.set_len(scan.last_good)
            .with_context(|| format!("failed to truncate {path}"))?;
        if !no_sync {
            file.sync_all()
                .with_context(|| format!("failed to sync {path} after truncation"))?;
        }
        warn!(
            file = %path,
            from = scan.file_len,
            to = scan.last_good,
            "truncated torn relay file tail"
        );
    }

    let mut computed = scan
        .gtids
        .unwrap_or_else(|| GtidSet::empty(flavor));
    if let Some(purged) = purged {
        computed.extend_with_purged(purged);
    }

    let recovered_pos = Position::new(latest_pos.name.clone(), scan.last_good);

    // The on-disk prefix wins. The one exception: a checkpoint that already
    // matches the recovered position but carries extra GTIDs was flushed
    // ahead of a re-read and lost nothing, keep it.
    let keep_persisted = latest_pos == recovered_pos
        && !persisted_gtids.equal(&computed)
        && persisted_gtids.contain(&computed);
    let final_gtids = if keep_persisted {
        warn!(
            file = %path,
            computed = %computed,
            persisted = %persisted_gtids,
            "relay file is missing GTIDs the checkpoint already has, keeping the checkpoint"
        );
        persisted_gtids.clone()
    } else {
        computed
    };

    let recovered = latest_pos != recovered_pos || !persisted_gtids.equal(&final_gtids);
    if recovered {
        info!(
            file = %path,
            from = %latest_pos,
            to = %recovered_pos,
            gtids = %final_gtids,
            "aligned relay checkpoint to recovered file state"
        );
        meta.save(recovered_pos.clone(), Some(final_gtids.clone()))?;
        meta.flush()?;
    } else {
        debug!(file = %path, "relay file is intact, nothing to recover");
    }

    Ok(RecoverResult {
        recovered,
        truncated,
        latest_pos: recovered_pos,
        latest_gtids: final_gtids,
    })
}

/// Walk the file event by event, tracking the last complete event boundary
/// and the committed GTID set. A decode failure or a short tail stops the
/// walk; everything before it is the good prefix.
fn scan_file(path: &Utf8Path, flavor: Flavor) -> Result<ScanOutcome, RelayError> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open relay file {path}"))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("failed to stat {path}"))?
        .len();

    let mut magic = [0u8; BINLOG_MAGIC.len()];
    if file_len < BINLOG_MAGIC.len() as u64 {
        return Err(RelayError::MetaCorrupt(format!(
            "relay file {path} is shorter than the binlog magic"
        )));
    }
    file.read_exact(&mut magic)
        .with_context(|| format!("failed to read magic of {path}"))?;
    if magic != BINLOG_MAGIC {
        return Err(RelayError::MetaCorrupt(format!(
            "relay file {path} has no binlog magic"
        )));
    }

    let mut decoder = EventDecoder::new(flavor);
    let mut buf: Vec<u8> = Vec::with_capacity(SCAN_CHUNK);
    let mut eof = false;

    let mut last_good = BINLOG_MAGIC.len() as u64;
    let mut gtids: Option<GtidSet> = None;
    let mut pending: Option<GtidEvent> = None;
    let mut complete_events = 0usize;

    loop {
        match decoder.decode(&buf) {
            Ok((event, consumed)) => {
                buf.drain(..consumed);
                last_good += consumed as u64;
                complete_events += 1;

                if complete_events == 2
                    && !matches!(
                        event.payload,
                        EventPayload::PreviousGtids { .. } | EventPayload::MariadbGtidList { .. }
                    )
                {
                    return Err(RelayError::MetaCorrupt(format!(
                        "relay file {path} has no previous-GTIDs event in its header"
                    )));
                }

                match event.payload {
                    EventPayload::PreviousGtids { set }
                    | EventPayload::MariadbGtidList { set } => gtids = Some(set),
                    EventPayload::Gtid(g) => pending = Some(g),
                    EventPayload::Xid { .. } => {
                        commit_pending(&mut gtids, pending.take());
                    }
                    EventPayload::Query { ref query, .. } => {
                        // BEGIN opens a transaction; anything else closes
                        // one (DDL, COMMIT)
                        if !query.trim().eq_ignore_ascii_case("BEGIN") {
                            commit_pending(&mut gtids, pending.take());
                        }
                    }
                    _ => {}
                }
            }
            Err(DecodeError::Incomplete { .. }) if !eof => {
                let mut chunk = vec![0u8; SCAN_CHUNK];
                let n = file
                    .read(&mut chunk)
                    .with_context(|| format!("failed to read {path}"))?;
                if n == 0 {
                    eof = true;
                    if buf.is_empty() {
                        break;
                    }
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(DecodeError::Incomplete { have, need }) => {
                debug!(
                    file = %path,
                    offset = last_good,
                    have,
                    need,
                    "relay file ends in a partial event"
                );
                break;
            }
            Err(DecodeError::Corrupt(reason)) => {
                debug!(
                    file = %path,
                    offset = last_good,
                    %reason,
                    "relay file tail does not parse"
                );
                break;
            }
        }
    }

    if complete_events >= 1 && gtids.is_none() {
        return Err(RelayError::MetaCorrupt(format!(
            "relay file {path} has no previous-GTIDs event in its header"
        )));
    }

    Ok(ScanOutcome {
        last_good,
        file_len,
        gtids,
    })
}

fn commit_pending(gtids: &mut Option<GtidSet>, pending: Option<GtidEvent>) {
    let (Some(set), Some(gtid)) = (gtids.as_mut(), pending) else {
        return;
    };
    // flavor mismatch can not happen for events decoded from one stream
    let _ = match gtid {
        GtidEvent::MySql { sid, gno } => set.insert_mysql(sid, gno),
        GtidEvent::MariaDb(g) => set.insert_mariadb(g),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use uuid::Uuid;

    use binlog::gen::EventGenerator;

    const UUID: &str = "24ecd093-8cec-11e9-aa0d-0242ac170002";
    const SID: &str = "3ccc475b-2343-11e7-be21-6c0b84d59f30";
    const FILENAME: &str = "mysql-bin.000001";

    fn setup(dir: &Utf8TempDir) -> LocalMeta {
        let meta = LocalMeta::new(dir.path(), Flavor::MySql, true);
        meta.load().unwrap();
        meta.add_dir(UUID, Some(Position::new(FILENAME, 123)), None, 0)
            .unwrap();
        meta
    }

    /// File header plus one DDL and one three-row DML transaction.
    fn gen_file(previous: &str) -> (EventGenerator, Vec<u8>) {
        let mut gen = EventGenerator::with_origin(
            Flavor::MySql,
            11,
            Uuid::parse_str(SID).unwrap(),
            15,
        );
        let previous = GtidSet::parse(Flavor::MySql, previous).unwrap();
        let mut data = gen.file_header(&previous).to_vec();
        data.extend_from_slice(&gen.ddl("db", "CREATE DATABASE db"));
        data.extend_from_slice(&gen.dml_txn(3));
        (gen, data)
    }

    fn write_relay_file(meta: &LocalMeta, data: &[u8]) {
        std::fs::write(meta.dir().unwrap().join(FILENAME), data).unwrap();
    }

    #[test]
    fn test_no_file_in_checkpoint_is_noop() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = LocalMeta::new(dir.path(), Flavor::MySql, true);
        meta.load().unwrap();

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(!res.recovered);
        assert!(!res.truncated);
    }

    #[test]
    fn test_missing_file_is_noop() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(!res.recovered);
        let (_, pos) = meta.pos();
        assert_eq!(pos, Position::new(FILENAME, 123));
    }

    #[test]
    fn test_intact_file_aligns_checkpoint() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let (gen, data) = gen_file(&format!("{SID}:1-14"));
        write_relay_file(&meta, &data);

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(res.recovered);
        assert!(!res.truncated);
        let (_, pos) = meta.pos();
        assert_eq!(pos, Position::new(FILENAME, gen.latest_pos));
        let (_, gtids) = meta.gtid();
        assert!(gtids.equal(&gen.gset));
        assert!(!meta.dirty());
    }

    #[test]
    fn test_truncated_tail_is_cut() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let (gen, mut data) = gen_file(&format!("{SID}:1-14"));
        let good_len = data.len() as u64;
        data.extend_from_slice(b"invalid event data");
        write_relay_file(&meta, &data);

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(res.recovered);
        assert!(res.truncated);
        assert_eq!(res.latest_pos, Position::new(FILENAME, good_len));
        assert_eq!(
            std::fs::metadata(meta.dir().unwrap().join(FILENAME))
                .unwrap()
                .len(),
            good_len
        );
        let (_, gtids) = meta.gtid();
        assert!(gtids.equal(&gen.gset));
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let (_, mut data) = gen_file(&format!("{SID}:1-14"));
        data.extend_from_slice(&[0xab; 18]);
        write_relay_file(&meta, &data);

        let first = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(first.truncated);
        let file_after = std::fs::read(meta.dir().unwrap().join(FILENAME)).unwrap();

        let second = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(!second.recovered);
        assert!(!second.truncated);
        assert_eq!(second.latest_pos, first.latest_pos);
        assert!(second.latest_gtids.equal(&first.latest_gtids));
        assert_eq!(
            std::fs::read(meta.dir().unwrap().join(FILENAME)).unwrap(),
            file_after
        );
    }

    #[test]
    fn test_meta_ahead_of_data_is_rewound() {
        // the checkpoint claims more than the file holds: offset past the
        // end and a GTID superset; disk wins on both counts
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let (gen, mut data) = gen_file(&format!("{SID}:1-14"));
        let good_len = data.len() as u64;
        data.extend_from_slice(b"invalid event data");
        write_relay_file(&meta, &data);

        let ahead = GtidSet::parse(Flavor::MySql, &format!("{SID}:1-20")).unwrap();
        meta.save(Position::new(FILENAME, good_len + 4096), Some(ahead))
            .unwrap();
        meta.flush().unwrap();

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(res.recovered);
        let (_, pos) = meta.pos();
        assert_eq!(pos, Position::new(FILENAME, good_len));
        let (_, gtids) = meta.gtid();
        assert!(gtids.equal(&gen.gset));
    }

    #[test]
    fn test_persisted_superset_kept_when_position_matches() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let (gen, data) = gen_file(&format!("{SID}:1-14"));
        write_relay_file(&meta, &data);

        let superset = GtidSet::parse(
            Flavor::MySql,
            &format!("{SID}:1-30,53bfca22-690d-11e7-8a62-18ded7a37b78:1-5"),
        )
        .unwrap();
        assert!(superset.contain(&gen.gset));
        meta.save(Position::new(FILENAME, gen.latest_pos), Some(superset.clone()))
            .unwrap();
        meta.flush().unwrap();

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(!res.recovered);
        let (_, gtids) = meta.gtid();
        assert!(gtids.equal(&superset));
    }

    #[test]
    fn test_purged_extends_computed_set() {
        // the file's origins start past 1 because the upstream purged the
        // prefix; recovery rewrites them to start at 1
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let (mut gen, mut data) = {
            let mut gen = EventGenerator::with_origin(
                Flavor::MySql,
                11,
                Uuid::parse_str(SID).unwrap(),
                124,
            );
            let previous =
                GtidSet::parse(Flavor::MySql, &format!("{SID}:123")).unwrap();
            let data = gen.file_header(&previous).to_vec();
            (gen, data)
        };
        data.extend_from_slice(&gen.ddl("db", "CREATE DATABASE db"));
        data.extend_from_slice(b"garbage");
        write_relay_file(&meta, &data);

        let purged = GtidSet::parse(Flavor::MySql, &format!("{SID}:1-122")).unwrap();
        let res =
            try_recover_latest_file(&meta, Flavor::MySql, Some(&purged), true).unwrap();
        assert!(res.recovered);
        let (_, gtids) = meta.gtid();
        assert_eq!(gtids.to_string(), format!("{SID}:1-124"));
    }

    #[test]
    fn test_header_only_file() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let mut gen = EventGenerator::with_origin(
            Flavor::MySql,
            11,
            Uuid::parse_str(SID).unwrap(),
            1,
        );
        let previous = GtidSet::parse(Flavor::MySql, &format!("{SID}:1-14")).unwrap();
        let mut data = gen.file_header(&previous).to_vec();
        let header_len = data.len() as u64;
        data.extend_from_slice(b"partial");
        write_relay_file(&meta, &data);

        let res = try_recover_latest_file(&meta, Flavor::MySql, None, true).unwrap();
        assert!(res.truncated);
        assert_eq!(res.latest_pos, Position::new(FILENAME, header_len));
        let (_, gtids) = meta.gtid();
        assert!(gtids.equal(&previous));
    }

    #[test]
    fn test_missing_previous_gtids_is_corrupt() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        let mut gen = EventGenerator::new(Flavor::MySql, 11);
        // craft a file whose second event is not a previous-GTIDs event
        let mut data = gen.file_header(&GtidSet::empty(Flavor::MySql)).to_vec();
        let fde_end = {
            // header is magic + FDE + previous-GTIDs; drop the latter and
            // append a rotate instead
            let mut decoder = EventDecoder::new(Flavor::MySql);
            let (_, fde_len) = decoder.decode(&data[BINLOG_MAGIC.len()..]).unwrap();
            BINLOG_MAGIC.len() + fde_len
        };
        data.truncate(fde_end);
        gen.latest_pos = fde_end as u64;
        data.extend_from_slice(&gen.rotate("mysql-bin.000002", 4));
        write_relay_file(&meta, &data);

        assert!(matches!(
            try_recover_latest_file(&meta, Flavor::MySql, None, true),
            Err(RelayError::MetaCorrupt(_))
        ));
    }

    #[test]
    fn test_not_a_binlog_file_is_corrupt() {
        let dir = Utf8TempDir::new().unwrap();
        let meta = setup(&dir);
        write_relay_file(&meta, b"this is not a binlog file at all");

        assert!(matches!(
            try_recover_latest_file(&meta, Flavor::MySql, None, true),
            Err(RelayError::MetaCorrupt(_))
        ));
    }
}
