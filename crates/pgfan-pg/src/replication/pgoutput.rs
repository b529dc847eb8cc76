//! Decoder for the PostgreSQL pgoutput logical replication protocol,
//! protocol version 2 (streamed large transactions included).
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html
//!
//! The decoder is pure: it takes one WAL payload slice and returns a typed
//! message. Column values come back as raw bytes plus a format marker;
//! mapping them to typed values is the normalizer's job.

use byteorder::{BigEndian, ByteOrder};

use super::lsn::Lsn;
use crate::error::{DecodeError, DecodeErrorKind};

/// A decoded pgoutput message.
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Origin(OriginMessage),
    Relation(RelationMessage),
    Type(TypeMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Truncate(TruncateMessage),
    Message(LogicalMessage),
    StreamStart(StreamStartMessage),
    StreamStop,
    StreamCommit(StreamCommitMessage),
    StreamAbort(StreamAbortMessage),
}

/// A message plus the transaction id it was streamed under, when the payload
/// arrived inside a `StreamStart`/`StreamStop` segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub xid: Option<u32>,
    pub message: PgOutputMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginMessage {
    pub final_lsn: Lsn,
    /// Commit timestamp, microseconds since the PostgreSQL epoch (2000-01-01).
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitMessage {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginMessage {
    pub origin_lsn: Lsn,
    pub origin_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default, // 'd' - primary key or unique index
    Nothing, // 'n'
    Full,    // 'f' - all columns
    Index,   // 'i'
}

impl From<u8> for ReplicaIdentity {
    fn from(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub flags: u8, // 1 = part of key
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl ColumnInfo {
    pub fn is_key(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMessage {
    pub type_id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub relation_id: u32,
    pub tuple: TupleData,
}

/// Which image the optional old tuple of an update carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    /// `'K'`: replica-identity key columns only.
    Key,
    /// `'O'`: the full old row (replica identity FULL).
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub relation_id: u32,
    pub old_tuple: Option<(OldTupleKind, TupleData)>,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub relation_id: u32,
    pub old_kind: OldTupleKind,
    pub old_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateMessage {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    pub flags: u8,
    pub lsn: Lsn,
    pub prefix: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStartMessage {
    pub xid: u32,
    /// 1 when this is the first segment of the transaction.
    pub first_segment: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamCommitMessage {
    pub xid: u32,
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamAbortMessage {
    pub xid: u32,
    pub subxid: u32,
}

/// One column of a row image: raw bytes plus the wire format marker.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// TOASTed value unchanged; carry from the previous row image.
    Unchanged,
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

/// Decoder for pgoutput binary protocol messages.
///
/// `in_stream` tells the decoder whether the payload arrived inside a
/// streamed-transaction segment, in which case data messages carry a leading
/// xid after the tag byte. The caller tracks segment state via
/// `StreamStart`/`StreamStop`.
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, data: &[u8], in_stream: bool) -> Result<Decoded, DecodeError> {
        let mut r = Reader::new(data);
        let tag = r.u8()?;

        // Inside a stream segment, data messages are prefixed with the
        // transaction id they belong to.
        let xid = match tag {
            b'R' | b'Y' | b'I' | b'U' | b'D' | b'T' | b'M' if in_stream => Some(r.u32()?),
            _ => None,
        };

        let message = match tag {
            b'B' => self.decode_begin(&mut r)?,
            b'C' => self.decode_commit(&mut r)?,
            b'O' => self.decode_origin(&mut r)?,
            b'R' => self.decode_relation(&mut r)?,
            b'Y' => self.decode_type(&mut r)?,
            b'I' => self.decode_insert(&mut r)?,
            b'U' => self.decode_update(&mut r)?,
            b'D' => self.decode_delete(&mut r)?,
            b'T' => self.decode_truncate(&mut r)?,
            b'M' => self.decode_message(&mut r)?,
            b'S' => self.decode_stream_start(&mut r)?,
            b'E' => PgOutputMessage::StreamStop,
            b'c' => self.decode_stream_commit(&mut r)?,
            b'A' => self.decode_stream_abort(&mut r)?,
            other => return Err(DecodeError::new(DecodeErrorKind::UnknownTag(other), 0)),
        };

        Ok(Decoded { xid, message })
    }

    fn decode_begin(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::Begin(BeginMessage {
            final_lsn: r.lsn()?,
            timestamp: r.i64()?,
            xid: r.u32()?,
        }))
    }

    fn decode_commit(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::Commit(CommitMessage {
            flags: r.u8()?,
            commit_lsn: r.lsn()?,
            end_lsn: r.lsn()?,
            timestamp: r.i64()?,
        }))
    }

    fn decode_origin(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::Origin(OriginMessage {
            origin_lsn: r.lsn()?,
            origin_name: r.cstr()?,
        }))
    }

    fn decode_relation(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        let relation_id = r.u32()?;
        let namespace = r.cstr()?;
        let name = r.cstr()?;
        let replica_identity = r.u8()?.into();
        let num_columns = r.i16()? as usize;

        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            columns.push(ColumnInfo {
                flags: r.u8()?,
                name: r.cstr()?,
                type_oid: r.u32()?,
                type_modifier: r.i32()?,
            });
        }

        Ok(PgOutputMessage::Relation(RelationMessage {
            relation_id,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn decode_type(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::Type(TypeMessage {
            type_id: r.u32()?,
            namespace: r.cstr()?,
            name: r.cstr()?,
        }))
    }

    fn decode_insert(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        let relation_id = r.u32()?;
        let marker = r.u8()?;
        if marker != b'N' {
            return Err(r.error_at_prev(DecodeErrorKind::UnknownTupleMarker(marker)));
        }
        let tuple = self.decode_tuple(r)?;

        Ok(PgOutputMessage::Insert(InsertMessage {
            relation_id,
            tuple,
        }))
    }

    fn decode_update(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        let relation_id = r.u32()?;

        let marker = r.u8()?;
        let (old_tuple, new_tuple) = match marker {
            b'K' | b'O' => {
                let kind = if marker == b'K' {
                    OldTupleKind::Key
                } else {
                    OldTupleKind::Full
                };
                let old = self.decode_tuple(r)?;
                let new_marker = r.u8()?;
                if new_marker != b'N' {
                    return Err(r.error_at_prev(DecodeErrorKind::UnknownTupleMarker(new_marker)));
                }
                (Some((kind, old)), self.decode_tuple(r)?)
            }
            b'N' => (None, self.decode_tuple(r)?),
            other => return Err(r.error_at_prev(DecodeErrorKind::UnknownTupleMarker(other))),
        };

        Ok(PgOutputMessage::Update(UpdateMessage {
            relation_id,
            old_tuple,
            new_tuple,
        }))
    }

    fn decode_delete(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        let relation_id = r.u32()?;
        let marker = r.u8()?;
        let old_kind = match marker {
            b'K' => OldTupleKind::Key,
            b'O' => OldTupleKind::Full,
            other => return Err(r.error_at_prev(DecodeErrorKind::UnknownTupleMarker(other))),
        };
        let old_tuple = self.decode_tuple(r)?;

        Ok(PgOutputMessage::Delete(DeleteMessage {
            relation_id,
            old_kind,
            old_tuple,
        }))
    }

    fn decode_truncate(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        let num_relations = r.u32()? as usize;
        let options = r.u8()?;

        let mut relation_ids = Vec::with_capacity(num_relations);
        for _ in 0..num_relations {
            relation_ids.push(r.u32()?);
        }

        Ok(PgOutputMessage::Truncate(TruncateMessage {
            options,
            relation_ids,
        }))
    }

    fn decode_message(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        let flags = r.u8()?;
        let lsn = r.lsn()?;
        let prefix = r.cstr()?;
        let len = r.u32()? as usize;
        let content = r.take(len)?.to_vec();

        Ok(PgOutputMessage::Message(LogicalMessage {
            flags,
            lsn,
            prefix,
            content,
        }))
    }

    fn decode_stream_start(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::StreamStart(StreamStartMessage {
            xid: r.u32()?,
            first_segment: r.u8()?,
        }))
    }

    fn decode_stream_commit(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::StreamCommit(StreamCommitMessage {
            xid: r.u32()?,
            flags: r.u8()?,
            commit_lsn: r.lsn()?,
            end_lsn: r.lsn()?,
            timestamp: r.i64()?,
        }))
    }

    fn decode_stream_abort(&self, r: &mut Reader<'_>) -> Result<PgOutputMessage, DecodeError> {
        Ok(PgOutputMessage::StreamAbort(StreamAbortMessage {
            xid: r.u32()?,
            subxid: r.u32()?,
        }))
    }

    fn decode_tuple(&self, r: &mut Reader<'_>) -> Result<TupleData, DecodeError> {
        let num_columns = r.i16()? as usize;
        let mut columns = Vec::with_capacity(num_columns);

        for _ in 0..num_columns {
            let marker = r.u8()?;
            let value = match marker {
                b'n' => ColumnValue::Null,
                b'u' => ColumnValue::Unchanged,
                b't' => {
                    let len = r.i32()? as usize;
                    ColumnValue::Text(r.take(len)?.to_vec())
                }
                b'b' => {
                    let len = r.i32()? as usize;
                    ColumnValue::Binary(r.take(len)?.to_vec())
                }
                other => return Err(r.error_at_prev(DecodeErrorKind::UnknownTupleMarker(other))),
            };
            columns.push(value);
        }

        Ok(TupleData { columns })
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Position-tracking big-endian reader over a message payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < len {
            return Err(DecodeError::new(
                DecodeErrorKind::Truncated {
                    needed: len - (self.buf.len() - self.pos),
                },
                self.pos,
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn lsn(&mut self) -> Result<Lsn, DecodeError> {
        Ok(Lsn::from(self.u64()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    /// Read a NUL-terminated identifier; invalid UTF-8 is a decode error at
    /// the string's start offset.
    fn cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            DecodeError::new(DecodeErrorKind::Truncated { needed: 1 }, self.buf.len())
        })?;

        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| DecodeError::new(DecodeErrorKind::InvalidUtf8, start))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Error anchored at the byte just consumed.
    fn error_at_prev(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError::new(kind, self.pos.saturating_sub(1))
    }
}
