use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, PageId, Rid, TxnId, INVALID_LSN};

/// Fixed log record header: size (4), lsn (4), txn_id (4), prev_lsn (4),
/// type (4), little-endian. `size` includes the header.
pub const LOG_HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogRecordKind {
    Invalid = 0,
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    NewPage = 6,
    Begin = 7,
    Commit = 8,
    Abort = 9,
}

impl LogRecordKind {
    fn from_u32(tag: u32) -> LogRecordKind {
        match tag {
            1 => LogRecordKind::Insert,
            2 => LogRecordKind::MarkDelete,
            3 => LogRecordKind::ApplyDelete,
            4 => LogRecordKind::RollbackDelete,
            5 => LogRecordKind::Update,
            6 => LogRecordKind::NewPage,
            7 => LogRecordKind::Begin,
            8 => LogRecordKind::Commit,
            9 => LogRecordKind::Abort,
            _ => LogRecordKind::Invalid,
        }
    }
}

/// Type-specific log record content. Tuples are serialized as an i32 length
/// prefix followed by the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert { rid: Rid, tuple: Vec<u8> },
    MarkDelete { rid: Rid },
    ApplyDelete { rid: Rid, tuple: Vec<u8> },
    RollbackDelete { rid: Rid },
    Update { rid: Rid, old_tuple: Vec<u8>, new_tuple: Vec<u8> },
    NewPage { prev_page_id: PageId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Assigned inside `LogManager::append_log_record`; immutable afterwards.
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

/// Result of decoding one record out of a log buffer window.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete record and the number of bytes it occupied.
    Record(LogRecord, usize),
    /// The window ends mid-record; refill from this record's offset.
    Incomplete,
    /// A zero size or INVALID type: end of the log.
    End,
}

const RID_SIZE: usize = 8;

fn write_rid(buf: &mut [u8], rid: Rid) {
    LittleEndian::write_u32(&mut buf[0..4], rid.page_id);
    LittleEndian::write_u32(&mut buf[4..8], rid.slot);
}

fn read_rid(buf: &[u8]) -> Rid {
    Rid::new(
        LittleEndian::read_u32(&buf[0..4]),
        LittleEndian::read_u32(&buf[4..8]),
    )
}

fn tuple_size(tuple: &[u8]) -> usize {
    4 + tuple.len()
}

fn write_tuple(buf: &mut [u8], tuple: &[u8]) -> usize {
    LittleEndian::write_i32(&mut buf[0..4], tuple.len() as i32);
    buf[4..4 + tuple.len()].copy_from_slice(tuple);
    4 + tuple.len()
}

fn read_tuple(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let len = LittleEndian::read_i32(&buf[0..4]);
    if len < 0 || buf.len() < 4 + len as usize {
        return None;
    }
    Some((buf[4..4 + len as usize].to_vec(), 4 + len as usize))
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    pub fn kind(&self) -> LogRecordKind {
        match self.payload {
            LogPayload::Begin => LogRecordKind::Begin,
            LogPayload::Commit => LogRecordKind::Commit,
            LogPayload::Abort => LogRecordKind::Abort,
            LogPayload::Insert { .. } => LogRecordKind::Insert,
            LogPayload::MarkDelete { .. } => LogRecordKind::MarkDelete,
            LogPayload::ApplyDelete { .. } => LogRecordKind::ApplyDelete,
            LogPayload::RollbackDelete { .. } => LogRecordKind::RollbackDelete,
            LogPayload::Update { .. } => LogRecordKind::Update,
            LogPayload::NewPage { .. } => LogRecordKind::NewPage,
        }
    }

    pub fn serialized_size(&self) -> usize {
        let payload = match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
            LogPayload::Insert { tuple, .. } => RID_SIZE + tuple_size(tuple),
            LogPayload::ApplyDelete { tuple, .. } => RID_SIZE + tuple_size(tuple),
            LogPayload::MarkDelete { .. } | LogPayload::RollbackDelete { .. } => RID_SIZE,
            LogPayload::Update {
                old_tuple,
                new_tuple,
                ..
            } => RID_SIZE + tuple_size(old_tuple) + tuple_size(new_tuple),
            LogPayload::NewPage { .. } => 4,
        };
        LOG_HEADER_SIZE + payload
    }

    /// Serialize into `buf`, which must be at least `serialized_size` long.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let size = self.serialized_size();
        LittleEndian::write_u32(&mut buf[0..4], size as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.lsn);
        LittleEndian::write_u32(&mut buf[8..12], self.txn_id);
        LittleEndian::write_u32(&mut buf[12..16], self.prev_lsn);
        LittleEndian::write_u32(&mut buf[16..20], self.kind() as u32);

        let mut pos = LOG_HEADER_SIZE;
        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { rid, tuple } | LogPayload::ApplyDelete { rid, tuple } => {
                write_rid(&mut buf[pos..], *rid);
                pos += RID_SIZE;
                write_tuple(&mut buf[pos..], tuple);
            }
            LogPayload::MarkDelete { rid } | LogPayload::RollbackDelete { rid } => {
                write_rid(&mut buf[pos..], *rid);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                write_rid(&mut buf[pos..], *rid);
                pos += RID_SIZE;
                pos += write_tuple(&mut buf[pos..], old_tuple);
                write_tuple(&mut buf[pos..], new_tuple);
            }
            LogPayload::NewPage { prev_page_id } => {
                LittleEndian::write_u32(&mut buf[pos..pos + 4], *prev_page_id);
            }
        }
    }

    /// Decode the record starting at `buf[0]`.
    pub fn decode(buf: &[u8]) -> DecodeOutcome {
        if buf.len() < LOG_HEADER_SIZE {
            return DecodeOutcome::Incomplete;
        }

        let size = LittleEndian::read_u32(&buf[0..4]) as usize;
        if size == 0 {
            return DecodeOutcome::End;
        }
        let kind = LogRecordKind::from_u32(LittleEndian::read_u32(&buf[16..20]));
        if kind == LogRecordKind::Invalid {
            return DecodeOutcome::End;
        }
        if size < LOG_HEADER_SIZE || buf.len() < size {
            return DecodeOutcome::Incomplete;
        }

        let lsn = LittleEndian::read_u32(&buf[4..8]);
        let txn_id = LittleEndian::read_u32(&buf[8..12]);
        let prev_lsn = LittleEndian::read_u32(&buf[12..16]);

        let body = &buf[LOG_HEADER_SIZE..size];
        let payload = match kind {
            LogRecordKind::Begin => LogPayload::Begin,
            LogRecordKind::Commit => LogPayload::Commit,
            LogRecordKind::Abort => LogPayload::Abort,
            LogRecordKind::Insert => {
                if body.len() < RID_SIZE {
                    return DecodeOutcome::Incomplete;
                }
                match read_tuple(&body[RID_SIZE..]) {
                    Some((tuple, _)) => LogPayload::Insert {
                        rid: read_rid(body),
                        tuple,
                    },
                    None => return DecodeOutcome::Incomplete,
                }
            }
            LogRecordKind::ApplyDelete => {
                if body.len() < RID_SIZE {
                    return DecodeOutcome::Incomplete;
                }
                match read_tuple(&body[RID_SIZE..]) {
                    Some((tuple, _)) => LogPayload::ApplyDelete {
                        rid: read_rid(body),
                        tuple,
                    },
                    None => return DecodeOutcome::Incomplete,
                }
            }
            LogRecordKind::MarkDelete => {
                if body.len() < RID_SIZE {
                    return DecodeOutcome::Incomplete;
                }
                LogPayload::MarkDelete { rid: read_rid(body) }
            }
            LogRecordKind::RollbackDelete => {
                if body.len() < RID_SIZE {
                    return DecodeOutcome::Incomplete;
                }
                LogPayload::RollbackDelete { rid: read_rid(body) }
            }
            LogRecordKind::Update => {
                if body.len() < RID_SIZE {
                    return DecodeOutcome::Incomplete;
                }
                let rid = read_rid(body);
                let rest = &body[RID_SIZE..];
                let Some((old_tuple, old_len)) = read_tuple(rest) else {
                    return DecodeOutcome::Incomplete;
                };
                let Some((new_tuple, _)) = read_tuple(&rest[old_len..]) else {
                    return DecodeOutcome::Incomplete;
                };
                LogPayload::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordKind::NewPage => {
                if body.len() < 4 {
                    return DecodeOutcome::Incomplete;
                }
                LogPayload::NewPage {
                    prev_page_id: LittleEndian::read_u32(&body[0..4]),
                }
            }
            LogRecordKind::Invalid => unreachable!(),
        };

        DecodeOutcome::Record(
            LogRecord {
                lsn,
                txn_id,
                prev_lsn,
                payload,
            },
            size,
        )
    }
}
