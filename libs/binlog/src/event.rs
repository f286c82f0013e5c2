//! Binlog event framing.
//!
//! Every event starts with the same 19-byte header; the header's
//! `event_size` self-delimits the frame and `log_pos` records the end offset
//! of the event within its file. A relay file is the 4-byte magic followed
//! by a format-description event, a previous-GTIDs (MySQL) or GTID-list
//! (MariaDB) event, and then the stream proper.
//!
//! The decoder distinguishes an incomplete tail (more bytes may arrive, or
//! the file was cut mid-event) from structural corruption; recovery relies
//! on that distinction to find the last good event boundary.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use uuid::Uuid;

use crate::gtid::{GtidSet, MariadbGtid, MariadbGtidSet, MysqlGtidSet};
use crate::Flavor;

/// First four bytes of every binlog file.
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];
pub const EVENT_HEADER_LEN: usize = 19;
pub const CHECKSUM_LEN: usize = 4;

/// Fixed-size prefix of the format-description body: binlog version (2),
/// server version (50), create timestamp (4), event header length (1).
const FDE_FIXED_LEN: usize = 57;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not enough bytes for a complete event. At end of input this marks a
    /// truncated tail.
    #[error("incomplete event: have {have} bytes, need {need}")]
    Incomplete { have: usize, need: usize },
    /// The bytes can not be a well-formed event.
    #[error("corrupt event: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlg {
    Off,
    Crc32,
}

impl ChecksumAlg {
    fn from_u8(b: u8) -> Option<ChecksumAlg> {
        match b {
            0 => Some(ChecksumAlg::Off),
            1 => Some(ChecksumAlg::Crc32),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => 1,
        }
    }

    fn trailer_len(self) -> usize {
        match self {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => CHECKSUM_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Unknown,
    Query,
    Stop,
    Rotate,
    FormatDescription,
    Xid,
    TableMap,
    Heartbeat,
    Ignorable,
    RowsQuery,
    WriteRows,
    UpdateRows,
    DeleteRows,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    MariadbAnnotateRows,
    MariadbBinlogCheckpoint,
    MariadbGtid,
    MariadbGtidList,
    Other(u8),
}

impl EventType {
    pub fn from_code(code: u8) -> EventType {
        match code {
            0 => EventType::Unknown,
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            27 => EventType::Heartbeat,
            28 => EventType::Ignorable,
            29 => EventType::RowsQuery,
            30 => EventType::WriteRows,
            31 => EventType::UpdateRows,
            32 => EventType::DeleteRows,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            160 => EventType::MariadbAnnotateRows,
            161 => EventType::MariadbBinlogCheckpoint,
            162 => EventType::MariadbGtid,
            163 => EventType::MariadbGtidList,
            other => EventType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            EventType::Unknown => 0,
            EventType::Query => 2,
            EventType::Stop => 3,
            EventType::Rotate => 4,
            EventType::FormatDescription => 15,
            EventType::Xid => 16,
            EventType::TableMap => 19,
            EventType::Heartbeat => 27,
            EventType::Ignorable => 28,
            EventType::RowsQuery => 29,
            EventType::WriteRows => 30,
            EventType::UpdateRows => 31,
            EventType::DeleteRows => 32,
            EventType::Gtid => 33,
            EventType::AnonymousGtid => 34,
            EventType::PreviousGtids => 35,
            EventType::MariadbAnnotateRows => 160,
            EventType::MariadbBinlogCheckpoint => 161,
            EventType::MariadbGtid => 162,
            EventType::MariadbGtidList => 163,
            EventType::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    /// Size of the whole frame, header and checksum included.
    pub event_size: u32,
    /// End offset of this event within its binlog file.
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn decode(buf: &[u8]) -> Result<EventHeader, DecodeError> {
        if buf.len() < EVENT_HEADER_LEN {
            return Err(DecodeError::Incomplete {
                have: buf.len(),
                need: EVENT_HEADER_LEN,
            });
        }
        Ok(EventHeader {
            timestamp: LittleEndian::read_u32(&buf[0..4]),
            event_type: EventType::from_code(buf[4]),
            server_id: LittleEndian::read_u32(&buf[5..9]),
            event_size: LittleEndian::read_u32(&buf[9..13]),
            log_pos: LittleEndian::read_u32(&buf[13..17]),
            flags: LittleEndian::read_u16(&buf[17..19]),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; EVENT_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.timestamp);
        buf[4] = self.event_type.code();
        LittleEndian::write_u32(&mut buf[5..9], self.server_id);
        LittleEndian::write_u32(&mut buf[9..13], self.event_size);
        LittleEndian::write_u32(&mut buf[13..17], self.log_pos);
        LittleEndian::write_u16(&mut buf[17..19], self.flags);
        out.extend_from_slice(&buf);
    }
}

/// A committed-transaction marker preceding the transaction's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidEvent {
    MySql { sid: Uuid, gno: u64 },
    MariaDb(MariadbGtid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    FormatDescription {
        checksum_alg: ChecksumAlg,
    },
    PreviousGtids {
        set: GtidSet,
    },
    MariadbGtidList {
        set: GtidSet,
    },
    Rotate {
        position: u64,
        next_binlog: String,
    },
    Gtid(GtidEvent),
    Query {
        schema: String,
        query: String,
        /// Committed GTID set annotation, filled by the upstream reader.
        /// Events decoded from disk leave it empty.
        gset: Option<GtidSet>,
    },
    Xid {
        xid: u64,
        gset: Option<GtidSet>,
    },
    Heartbeat,
    /// Any event type the relay does not need to look inside of.
    Raw,
}

/// One framed binlog event. `raw` keeps the full frame verbatim so writers
/// can persist exactly what arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub header: EventHeader,
    pub raw: Bytes,
    pub payload: EventPayload,
}

impl Event {
    /// Attach a committed GTID set annotation, as an upstream reader does
    /// for transaction-closing events. No-op for other payloads.
    pub fn with_gset(mut self, set: GtidSet) -> Event {
        match &mut self.payload {
            EventPayload::Query { gset, .. } | EventPayload::Xid { gset, .. } => {
                *gset = Some(set);
            }
            _ => {}
        }
        self
    }
}

/// Decodes framed events from a byte stream. Stateful: the checksum
/// algorithm announced by the format-description event applies to every
/// later event in the same stream.
pub struct EventDecoder {
    flavor: Flavor,
    checksum_alg: ChecksumAlg,
}

impl EventDecoder {
    pub fn new(flavor: Flavor) -> EventDecoder {
        EventDecoder {
            flavor,
            checksum_alg: ChecksumAlg::Off,
        }
    }

    pub fn checksum_alg(&self) -> ChecksumAlg {
        self.checksum_alg
    }

    /// Decode one event from the front of `buf`; returns the event and the
    /// number of bytes consumed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<(Event, usize), DecodeError> {
        let header = EventHeader::decode(buf)?;
        let size = header.event_size as usize;
        if size < EVENT_HEADER_LEN {
            return Err(DecodeError::Corrupt(format!(
                "event size {size} smaller than header"
            )));
        }
        if buf.len() < size {
            return Err(DecodeError::Incomplete {
                have: buf.len(),
                need: size,
            });
        }
        let frame = &buf[..size];

        // The format-description event announces the checksum algorithm for
        // the rest of the stream, including for its own trailer.
        if header.event_type == EventType::FormatDescription {
            self.checksum_alg = parse_fde_checksum_alg(frame)?;
        }

        if self.checksum_alg == ChecksumAlg::Crc32 {
            if size < EVENT_HEADER_LEN + CHECKSUM_LEN {
                return Err(DecodeError::Corrupt("event too small for checksum".into()));
            }
            let expected = LittleEndian::read_u32(&frame[size - CHECKSUM_LEN..]);
            let actual = crc32fast::hash(&frame[..size - CHECKSUM_LEN]);
            if expected != actual {
                return Err(DecodeError::Corrupt(format!(
                    "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
                )));
            }
        }

        let body = &frame[EVENT_HEADER_LEN..size - self.checksum_alg.trailer_len()];
        let payload = self.parse_payload(&header, body)?;
        Ok((
            Event {
                header,
                raw: Bytes::copy_from_slice(frame),
                payload,
            },
            size,
        ))
    }

    fn parse_payload(
        &self,
        header: &EventHeader,
        body: &[u8],
    ) -> Result<EventPayload, DecodeError> {
        let corrupt = |what: &str| DecodeError::Corrupt(format!("malformed {what} event"));
        match header.event_type {
            EventType::FormatDescription => Ok(EventPayload::FormatDescription {
                checksum_alg: self.checksum_alg,
            }),
            EventType::Rotate => {
                if body.len() < 8 {
                    return Err(corrupt("rotate"));
                }
                let position = LittleEndian::read_u64(&body[..8]);
                let next_binlog = String::from_utf8(body[8..].to_vec())
                    .map_err(|_| corrupt("rotate"))?;
                Ok(EventPayload::Rotate {
                    position,
                    next_binlog,
                })
            }
            EventType::Query => {
                // thread id (4), exec time (4), schema len (1), error code
                // (2), status vars len (2), status vars, schema, NUL, query
                if body.len() < 13 {
                    return Err(corrupt("query"));
                }
                let schema_len = body[8] as usize;
                let status_len = LittleEndian::read_u16(&body[11..13]) as usize;
                let schema_start = 13 + status_len;
                let query_start = schema_start + schema_len + 1;
                if body.len() < query_start {
                    return Err(corrupt("query"));
                }
                let schema = String::from_utf8(body[schema_start..schema_start + schema_len].to_vec())
                    .map_err(|_| corrupt("query"))?;
                let query = String::from_utf8(body[query_start..].to_vec())
                    .map_err(|_| corrupt("query"))?;
                Ok(EventPayload::Query {
                    schema,
                    query,
                    gset: None,
                })
            }
            EventType::Xid => {
                if body.len() < 8 {
                    return Err(corrupt("xid"));
                }
                Ok(EventPayload::Xid {
                    xid: LittleEndian::read_u64(&body[..8]),
                    gset: None,
                })
            }
            EventType::Gtid if self.flavor == Flavor::MySql => {
                // flags (1), sid (16), gno (8); trailing logical timestamps
                // are ignored
                if body.len() < 25 {
                    return Err(corrupt("gtid"));
                }
                let sid = Uuid::from_slice(&body[1..17]).map_err(|_| corrupt("gtid"))?;
                let gno = LittleEndian::read_u64(&body[17..25]);
                if gno == 0 {
                    return Err(corrupt("gtid"));
                }
                Ok(EventPayload::Gtid(GtidEvent::MySql { sid, gno }))
            }
            EventType::MariadbGtid if self.flavor == Flavor::MariaDb => {
                // seq (8), domain (4); server id comes from the header
                if body.len() < 12 {
                    return Err(corrupt("mariadb gtid"));
                }
                Ok(EventPayload::Gtid(GtidEvent::MariaDb(MariadbGtid {
                    domain: LittleEndian::read_u32(&body[8..12]),
                    server_id: header.server_id,
                    seq: LittleEndian::read_u64(&body[..8]),
                })))
            }
            EventType::PreviousGtids if self.flavor == Flavor::MySql => {
                let set = MysqlGtidSet::decode(body)
                    .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                Ok(EventPayload::PreviousGtids {
                    set: GtidSet::MySql(set),
                })
            }
            EventType::MariadbGtidList if self.flavor == Flavor::MariaDb => {
                if body.len() < 4 {
                    return Err(corrupt("gtid list"));
                }
                let count = (LittleEndian::read_u32(&body[..4]) & 0x0fff_ffff) as usize;
                if body.len() < 4 + count * 16 {
                    return Err(corrupt("gtid list"));
                }
                let mut set = MariadbGtidSet::default();
                for i in 0..count {
                    let at = 4 + i * 16;
                    set.insert(MariadbGtid {
                        domain: LittleEndian::read_u32(&body[at..at + 4]),
                        server_id: LittleEndian::read_u32(&body[at + 4..at + 8]),
                        seq: LittleEndian::read_u64(&body[at + 8..at + 16]),
                    });
                }
                Ok(EventPayload::MariadbGtidList {
                    set: GtidSet::MariaDb(set),
                })
            }
            EventType::Heartbeat => Ok(EventPayload::Heartbeat),
            _ => Ok(EventPayload::Raw),
        }
    }
}

fn parse_fde_checksum_alg(frame: &[u8]) -> Result<ChecksumAlg, DecodeError> {
    let body = &frame[EVENT_HEADER_LEN..];
    if body.len() < FDE_FIXED_LEN + 1 + CHECKSUM_LEN {
        return Err(DecodeError::Corrupt(
            "format description event too small".into(),
        ));
    }
    let binlog_version = LittleEndian::read_u16(&body[..2]);
    if binlog_version != 4 {
        return Err(DecodeError::Corrupt(format!(
            "unsupported binlog version {binlog_version}"
        )));
    }
    // The algorithm byte sits right before the 4-byte checksum field that
    // ends the event, whether or not checksums are enabled.
    let alg_byte = frame[frame.len() - CHECKSUM_LEN - 1];
    ChecksumAlg::from_u8(alg_byte).ok_or_else(|| {
        DecodeError::Corrupt(format!("unknown checksum algorithm {alg_byte}"))
    })
}
