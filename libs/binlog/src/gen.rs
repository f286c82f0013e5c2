//! Binlog event generator.
//!
//! Produces encoded event frames with correct `log_pos` chaining and CRC32
//! trailers, so tests can craft complete, well-formed relay files (and then
//! damage them in controlled ways). Not a faithful server: rows events carry
//! opaque bodies and the format-description event advertises a fixed server
//! version.

use bytes::Bytes;
use uuid::Uuid;

use crate::event::{ChecksumAlg, EventType, BINLOG_MAGIC, CHECKSUM_LEN, EVENT_HEADER_LEN};
use crate::gtid::{GtidSet, MariadbGtid};
use crate::Flavor;

const GEN_TIMESTAMP: u32 = 1_700_000_000;

pub struct EventGenerator {
    pub flavor: Flavor,
    pub server_id: u32,
    pub checksum_alg: ChecksumAlg,
    /// Offset at which the next generated event starts; equals the current
    /// end of the generated file.
    pub latest_pos: u64,
    /// Committed GTID set so far, previous-GTIDs seed included.
    pub gset: GtidSet,
    /// Origin for generated MySQL transactions.
    pub sid: Uuid,
    next_gno: u64,
    domain: u32,
    next_seq: u64,
    next_xid: u64,
    pending: Option<u64>,
}

impl EventGenerator {
    pub fn new(flavor: Flavor, server_id: u32) -> EventGenerator {
        Self::with_origin(flavor, server_id, Uuid::new_v4(), 1)
    }

    pub fn with_origin(
        flavor: Flavor,
        server_id: u32,
        sid: Uuid,
        next_gno: u64,
    ) -> EventGenerator {
        EventGenerator {
            flavor,
            server_id,
            checksum_alg: ChecksumAlg::Crc32,
            latest_pos: 0,
            gset: GtidSet::empty(flavor),
            sid,
            next_gno,
            domain: 0,
            next_seq: next_gno,
            next_xid: 10,
            pending: None,
        }
    }

    /// Encode one frame starting at an explicit offset, without touching the
    /// generator position.
    fn frame_at(&self, event_type: EventType, timestamp: u32, log_pos: u32, body: &[u8]) -> Bytes {
        let size = EVENT_HEADER_LEN + body.len() + self.trailer_len();
        let mut out = Vec::with_capacity(size);
        crate::event::EventHeader {
            timestamp,
            event_type,
            server_id: self.server_id,
            event_size: size as u32,
            log_pos,
            flags: 0,
        }
        .encode_into(&mut out);
        out.extend_from_slice(body);
        if self.checksum_alg == ChecksumAlg::Crc32 {
            let crc = crc32fast::hash(&out);
            out.extend_from_slice(&crc.to_le_bytes());
        }
        Bytes::from(out)
    }

    fn trailer_len(&self) -> usize {
        match self.checksum_alg {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => CHECKSUM_LEN,
        }
    }

    /// Encode one frame at the current position and advance it.
    fn frame(&mut self, event_type: EventType, body: &[u8]) -> Bytes {
        let size = (EVENT_HEADER_LEN + body.len() + self.trailer_len()) as u64;
        let end = self.latest_pos + size;
        let out = self.frame_at(event_type, GEN_TIMESTAMP, end as u32, body);
        self.latest_pos = end;
        out
    }

    /// File magic, format-description event and previous-GTIDs (MySQL) or
    /// GTID-list (MariaDB) event. Resets the generator position and seeds
    /// the committed set with `previous`.
    pub fn file_header(&mut self, previous: &GtidSet) -> Bytes {
        self.latest_pos = BINLOG_MAGIC.len() as u64;
        self.gset = previous.clone();

        let mut out = Vec::new();
        out.extend_from_slice(&BINLOG_MAGIC);

        let mut fde = Vec::new();
        fde.extend_from_slice(&4u16.to_le_bytes());
        let mut server_version = [0u8; 50];
        let version: &[u8] = match self.flavor {
            Flavor::MySql => b"5.7.31-log",
            Flavor::MariaDb => b"10.6.7-MariaDB-log",
        };
        server_version[..version.len()].copy_from_slice(version);
        fde.extend_from_slice(&server_version);
        fde.extend_from_slice(&GEN_TIMESTAMP.to_le_bytes());
        fde.push(EVENT_HEADER_LEN as u8);
        // post-header length table; zeroed, nothing reads it back
        fde.extend_from_slice(&[0u8; 40]);
        fde.push(self.checksum_alg.code());
        if self.checksum_alg == ChecksumAlg::Off {
            // the 4-byte checksum field is present even when unused
            fde.extend_from_slice(&[0u8; CHECKSUM_LEN]);
        }
        out.extend_from_slice(&self.frame(EventType::FormatDescription, &fde));

        match previous {
            GtidSet::MySql(set) => {
                out.extend_from_slice(&self.frame(EventType::PreviousGtids, &set.encode()));
            }
            GtidSet::MariaDb(set) => {
                let gtids: Vec<&MariadbGtid> = set.gtids().collect();
                let mut body = Vec::with_capacity(4 + gtids.len() * 16);
                body.extend_from_slice(&(gtids.len() as u32).to_le_bytes());
                for g in gtids {
                    body.extend_from_slice(&g.domain.to_le_bytes());
                    body.extend_from_slice(&g.server_id.to_le_bytes());
                    body.extend_from_slice(&g.seq.to_le_bytes());
                }
                out.extend_from_slice(&self.frame(EventType::MariadbGtidList, &body));
            }
        }
        Bytes::from(out)
    }

    pub fn rotate(&mut self, next_binlog: &str, position: u64) -> Bytes {
        let mut body = Vec::with_capacity(8 + next_binlog.len());
        body.extend_from_slice(&position.to_le_bytes());
        body.extend_from_slice(next_binlog.as_bytes());
        self.frame(EventType::Rotate, &body)
    }

    /// Artificial rotate as emitted by an upstream on connect: zero
    /// timestamp, zero log_pos, never lands in a file.
    pub fn fake_rotate(&self, next_binlog: &str, position: u64) -> Bytes {
        let mut body = Vec::with_capacity(8 + next_binlog.len());
        body.extend_from_slice(&position.to_le_bytes());
        body.extend_from_slice(next_binlog.as_bytes());
        self.frame_at(EventType::Rotate, 0, 0, &body)
    }

    pub fn heartbeat(&self) -> Bytes {
        self.frame_at(
            EventType::Heartbeat,
            GEN_TIMESTAMP,
            self.latest_pos as u32,
            b"",
        )
    }

    /// GTID event opening the next transaction.
    pub fn gtid_event(&mut self) -> Bytes {
        match self.flavor {
            Flavor::MySql => {
                let gno = self.next_gno;
                self.next_gno += 1;
                self.pending = Some(gno);
                let mut body = Vec::with_capacity(25);
                body.push(0); // commit flag
                body.extend_from_slice(self.sid.as_bytes());
                body.extend_from_slice(&gno.to_le_bytes());
                self.frame(EventType::Gtid, &body)
            }
            Flavor::MariaDb => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.pending = Some(seq);
                let mut body = Vec::with_capacity(13);
                body.extend_from_slice(&seq.to_le_bytes());
                body.extend_from_slice(&self.domain.to_le_bytes());
                body.push(0); // flags
                self.frame(EventType::MariadbGtid, &body)
            }
        }
    }

    /// Plain query event; does not commit anything by itself.
    pub fn query_event(&mut self, schema: &str, query: &str) -> Bytes {
        let mut body = Vec::with_capacity(13 + schema.len() + 1 + query.len());
        body.extend_from_slice(&1u32.to_le_bytes()); // thread id
        body.extend_from_slice(&0u32.to_le_bytes()); // exec time
        body.push(schema.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes()); // error code
        body.extend_from_slice(&0u16.to_le_bytes()); // status vars len
        body.extend_from_slice(schema.as_bytes());
        body.push(0);
        body.extend_from_slice(query.as_bytes());
        self.frame(EventType::Query, &body)
    }

    pub fn xid_event(&mut self) -> Bytes {
        let xid = self.next_xid;
        self.next_xid += 1;
        let out = self.frame(EventType::Xid, &xid.to_le_bytes());
        self.commit_pending();
        out
    }

    /// GTID + DDL query, committed.
    pub fn ddl(&mut self, schema: &str, query: &str) -> Bytes {
        let mut out = self.gtid_event().to_vec();
        out.extend_from_slice(&self.query_event(schema, query));
        self.commit_pending();
        Bytes::from(out)
    }

    /// GTID + `rows` opaque rows events + XID, committed.
    pub fn dml_txn(&mut self, rows: usize) -> Bytes {
        let mut out = self.gtid_event().to_vec();
        for i in 0..rows {
            let body = [i as u8; 20];
            out.extend_from_slice(&self.frame(EventType::WriteRows, &body));
        }
        out.extend_from_slice(&self.xid_event());
        Bytes::from(out)
    }

    fn commit_pending(&mut self) {
        let Some(n) = self.pending.take() else {
            return;
        };
        match self.flavor {
            Flavor::MySql => {
                self.gset
                    .insert_mysql(self.sid, n)
                    .expect("generator set has generator flavor");
            }
            Flavor::MariaDb => {
                self.gset
                    .insert_mariadb(MariadbGtid {
                        domain: self.domain,
                        server_id: self.server_id,
                        seq: n,
                    })
                    .expect("generator set has generator flavor");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDecoder, EventPayload};

    #[test]
    fn test_generated_file_scans_cleanly() {
        let mut gen = EventGenerator::new(Flavor::MySql, 11);
        let previous = GtidSet::parse(
            Flavor::MySql,
            "3ccc475b-2343-11e7-be21-6c0b84d59f30:1-14",
        )
        .unwrap();
        let mut data = gen.file_header(&previous).to_vec();
        data.extend_from_slice(&gen.ddl("db", "CREATE DATABASE db"));
        data.extend_from_slice(&gen.dml_txn(3));

        assert_eq!(gen.latest_pos as usize, data.len());

        let mut decoder = EventDecoder::new(Flavor::MySql);
        let mut offset = BINLOG_MAGIC.len();
        let mut committed = previous.clone();
        let mut pending = None;
        while offset < data.len() {
            let (ev, consumed) = decoder.decode(&data[offset..]).unwrap();
            offset += consumed;
            match ev.payload {
                EventPayload::Gtid(crate::event::GtidEvent::MySql { sid, gno }) => {
                    pending = Some((sid, gno));
                }
                EventPayload::Xid { .. } | EventPayload::Query { .. } => {
                    if let Some((sid, gno)) = pending.take() {
                        committed.insert_mysql(sid, gno).unwrap();
                    }
                }
                _ => {}
            }
        }
        assert_eq!(offset, data.len());
        assert_eq!(committed, gen.gset);
    }

    #[test]
    fn test_fake_rotate_is_artificial() {
        let mut gen = EventGenerator::new(Flavor::MySql, 11);
        let header = gen.file_header(&GtidSet::empty(Flavor::MySql));
        let before = gen.latest_pos;
        let frame = gen.fake_rotate("mysql-bin.000009", 4);
        assert_eq!(gen.latest_pos, before);

        // walk the file header first so the decoder learns the checksum alg
        let mut decoder = EventDecoder::new(Flavor::MySql);
        let mut offset = BINLOG_MAGIC.len();
        while offset < header.len() {
            let (_, consumed) = decoder.decode(&header[offset..]).unwrap();
            offset += consumed;
        }

        let (ev, _) = decoder.decode(&frame).unwrap();
        assert_eq!(ev.header.timestamp, 0);
        assert_eq!(ev.header.log_pos, 0);
    }
}
