//! Flavor-tagged GTID sets.
//!
//! MySQL sets map an origin UUID to sorted, coalesced, inclusive transaction
//! intervals (`3E11FA47-...:1-3:5-9`). MariaDB sets keep the highest seen
//! sequence per replication domain (`0-1-100`). Both support parse, display,
//! union, containment and equality; the MySQL form additionally round-trips
//! the binary encoding used by the previous-GTIDs file-header event.

use std::collections::BTreeMap;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Flavor;

#[derive(Debug, thiserror::Error)]
pub enum GtidError {
    #[error("invalid GTID set {text:?}: {reason}")]
    Parse { text: String, reason: String },
    #[error("GTID flavor mismatch: {0} vs {1}")]
    FlavorMismatch(Flavor, Flavor),
}

fn parse_err(text: &str, reason: impl fmt::Display) -> GtidError {
    GtidError::Parse {
        text: text.to_string(),
        reason: reason.to_string(),
    }
}

/// Inclusive transaction id interval within one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Sort and coalesce overlapping or adjacent intervals in place.
fn normalize(intervals: &mut Vec<Interval>) {
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

/// True when `intervals` (normalized) fully covers `needle`.
fn covers(intervals: &[Interval], needle: Interval) -> bool {
    intervals
        .iter()
        .any(|iv| iv.start <= needle.start && needle.end <= iv.end)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MysqlGtidSet {
    sids: BTreeMap<Uuid, Vec<Interval>>,
}

impl MysqlGtidSet {
    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }

    pub fn add_interval(&mut self, sid: Uuid, interval: Interval) {
        let intervals = self.sids.entry(sid).or_default();
        intervals.push(interval);
        normalize(intervals);
    }

    pub fn insert_gno(&mut self, sid: Uuid, gno: u64) {
        self.add_interval(sid, Interval { start: gno, end: gno });
    }

    pub fn union(&mut self, other: &MysqlGtidSet) {
        for (sid, intervals) in &other.sids {
            let own = self.sids.entry(*sid).or_default();
            own.extend_from_slice(intervals);
            normalize(own);
        }
    }

    pub fn contain(&self, other: &MysqlGtidSet) -> bool {
        other.sids.iter().all(|(sid, intervals)| {
            let Some(own) = self.sids.get(sid) else {
                return false;
            };
            intervals.iter().all(|iv| covers(own, *iv))
        })
    }

    fn parse(text: &str) -> Result<MysqlGtidSet, GtidError> {
        let mut set = MysqlGtidSet::default();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (sid, intervals) = part
                .split_once(':')
                .ok_or_else(|| parse_err(text, format!("missing ':' in {part:?}")))?;
            let sid = Uuid::parse_str(sid).map_err(|e| parse_err(text, e))?;
            for interval in intervals.split(':') {
                let (start, end) = match interval.split_once('-') {
                    Some((s, e)) => (s, e),
                    None => (interval, interval),
                };
                let start: u64 = start.parse().map_err(|e| parse_err(text, e))?;
                let end: u64 = end.parse().map_err(|e| parse_err(text, e))?;
                if start == 0 || end < start {
                    return Err(parse_err(text, format!("bad interval {interval:?}")));
                }
                set.add_interval(sid, Interval { start, end });
            }
        }
        Ok(set)
    }

    /// Binary form used by the previous-GTIDs event: interval ends are
    /// encoded exclusive.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, self.sids.len() as u64);
        out.extend_from_slice(&buf);
        for (sid, intervals) in &self.sids {
            out.extend_from_slice(sid.as_bytes());
            LittleEndian::write_u64(&mut buf, intervals.len() as u64);
            out.extend_from_slice(&buf);
            for iv in intervals {
                LittleEndian::write_u64(&mut buf, iv.start);
                out.extend_from_slice(&buf);
                LittleEndian::write_u64(&mut buf, iv.end + 1);
                out.extend_from_slice(&buf);
            }
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<MysqlGtidSet, GtidError> {
        let bad = |reason: &str| parse_err("<binary>", reason);
        let take = |n: usize, buf: &mut &[u8]| -> Result<Vec<u8>, GtidError> {
            if buf.len() < n {
                return Err(bad("truncated GTID set payload"));
            }
            let (head, rest) = buf.split_at(n);
            *buf = rest;
            Ok(head.to_vec())
        };

        let n_sids = LittleEndian::read_u64(&take(8, &mut buf)?);
        let mut set = MysqlGtidSet::default();
        for _ in 0..n_sids {
            let sid = Uuid::from_slice(&take(16, &mut buf)?)
                .map_err(|e| parse_err("<binary>", e))?;
            let n_intervals = LittleEndian::read_u64(&take(8, &mut buf)?);
            for _ in 0..n_intervals {
                let start = LittleEndian::read_u64(&take(8, &mut buf)?);
                let end = LittleEndian::read_u64(&take(8, &mut buf)?);
                if start == 0 || end <= start {
                    return Err(bad("bad interval in GTID set payload"));
                }
                set.add_interval(
                    sid,
                    Interval {
                        start,
                        end: end - 1,
                    },
                );
            }
        }
        Ok(set)
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (sid, intervals) in &self.sids {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{sid}")?;
            for iv in intervals {
                write!(f, ":{iv}")?;
            }
        }
        Ok(())
    }
}

/// One MariaDB GTID: domain, originating server, sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MariadbGtid {
    pub domain: u32,
    pub server_id: u32,
    pub seq: u64,
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.seq)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidSet {
    domains: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn insert(&mut self, gtid: MariadbGtid) {
        match self.domains.get_mut(&gtid.domain) {
            Some(existing) if existing.seq >= gtid.seq => {}
            Some(existing) => *existing = gtid,
            None => {
                self.domains.insert(gtid.domain, gtid);
            }
        }
    }

    pub fn union(&mut self, other: &MariadbGtidSet) {
        for gtid in other.domains.values() {
            self.insert(*gtid);
        }
    }

    pub fn contain(&self, other: &MariadbGtidSet) -> bool {
        other.domains.values().all(|gtid| {
            self.domains
                .get(&gtid.domain)
                .is_some_and(|own| own.seq >= gtid.seq)
        })
    }

    pub fn gtids(&self) -> impl Iterator<Item = &MariadbGtid> {
        self.domains.values()
    }

    fn parse(text: &str) -> Result<MariadbGtidSet, GtidError> {
        let mut set = MariadbGtidSet::default();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let fields: Vec<&str> = part.split('-').collect();
            if fields.len() != 3 {
                return Err(parse_err(text, format!("bad MariaDB GTID {part:?}")));
            }
            set.insert(MariadbGtid {
                domain: fields[0].parse().map_err(|e| parse_err(text, e))?,
                server_id: fields[1].parse().map_err(|e| parse_err(text, e))?,
                seq: fields[2].parse().map_err(|e| parse_err(text, e))?,
            });
        }
        Ok(set)
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for gtid in self.domains.values() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{gtid}")?;
        }
        Ok(())
    }
}

/// A set of committed transactions, tagged with the upstream flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GtidSet {
    MySql(MysqlGtidSet),
    MariaDb(MariadbGtidSet),
}

impl GtidSet {
    pub fn empty(flavor: Flavor) -> GtidSet {
        match flavor {
            Flavor::MySql => GtidSet::MySql(MysqlGtidSet::default()),
            Flavor::MariaDb => GtidSet::MariaDb(MariadbGtidSet::default()),
        }
    }

    /// Parse the canonical text form; an empty string parses to the empty
    /// set of the given flavor.
    pub fn parse(flavor: Flavor, text: &str) -> Result<GtidSet, GtidError> {
        match flavor {
            Flavor::MySql => MysqlGtidSet::parse(text).map(GtidSet::MySql),
            Flavor::MariaDb => MariadbGtidSet::parse(text).map(GtidSet::MariaDb),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            GtidSet::MySql(_) => Flavor::MySql,
            GtidSet::MariaDb(_) => Flavor::MariaDb,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GtidSet::MySql(s) => s.is_empty(),
            GtidSet::MariaDb(s) => s.is_empty(),
        }
    }

    pub fn union(&mut self, other: &GtidSet) -> Result<(), GtidError> {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => {
                a.union(b);
                Ok(())
            }
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => {
                a.union(b);
                Ok(())
            }
            (a, b) => Err(GtidError::FlavorMismatch(a.flavor(), b.flavor())),
        }
    }

    /// True when every transaction in `other` is also in `self`. Sets of
    /// different flavors never contain each other.
    pub fn contain(&self, other: &GtidSet) -> bool {
        match (self, other) {
            (GtidSet::MySql(a), GtidSet::MySql(b)) => a.contain(b),
            (GtidSet::MariaDb(a), GtidSet::MariaDb(b)) => a.contain(b),
            _ => false,
        }
    }

    pub fn equal(&self, other: &GtidSet) -> bool {
        self == other
    }

    pub fn insert_mysql(&mut self, sid: Uuid, gno: u64) -> Result<(), GtidError> {
        match self {
            GtidSet::MySql(s) => {
                s.insert_gno(sid, gno);
                Ok(())
            }
            GtidSet::MariaDb(_) => {
                Err(GtidError::FlavorMismatch(Flavor::MariaDb, Flavor::MySql))
            }
        }
    }

    pub fn insert_mariadb(&mut self, gtid: MariadbGtid) -> Result<(), GtidError> {
        match self {
            GtidSet::MariaDb(s) => {
                s.insert(gtid);
                Ok(())
            }
            GtidSet::MySql(_) => {
                Err(GtidError::FlavorMismatch(Flavor::MySql, Flavor::MariaDb))
            }
        }
    }

    /// Rewrite origins whose first interval starts past 1 to start at 1 when
    /// `purged` covers the missing prefix, i.e. `X:123-456` becomes
    /// `X:1-456` when the purged set contains `X:1-122`. A relay file only
    /// sees transactions the server still had; the purged prefix is known
    /// committed. MariaDB sets carry no interval history and are unaffected.
    ///
    /// Returns true when anything changed.
    pub fn extend_with_purged(&mut self, purged: &GtidSet) -> bool {
        let (GtidSet::MySql(own), GtidSet::MySql(purged)) = (self, purged) else {
            return false;
        };
        let mut changed = false;
        for (sid, intervals) in own.sids.iter_mut() {
            let Some(first) = intervals.first_mut() else {
                continue;
            };
            if first.start <= 1 {
                continue;
            }
            let missing = Interval {
                start: 1,
                end: first.start - 1,
            };
            if purged
                .sids
                .get(sid)
                .is_some_and(|pivs| covers(pivs, missing))
            {
                first.start = 1;
                changed = true;
            }
        }
        changed
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtidSet::MySql(s) => s.fmt(f),
            GtidSet::MariaDb(s) => s.fmt(f),
        }
    }
}
