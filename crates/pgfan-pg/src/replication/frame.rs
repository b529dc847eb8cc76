//! Copy-both stream frames exchanged during `START_REPLICATION`.
//!
//! The server multiplexes two frame kinds: XLogData (`'w'`) carrying a WAL
//! payload, and PrimaryKeepalive (`'k'`). The client answers with
//! StandbyStatusUpdate (`'r'`) messages reporting its write/flush/apply LSNs.
//!
//! Format reference: https://www.postgresql.org/docs/current/protocol-replication.html

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

use super::lsn::Lsn;
use crate::error::{DecodeError, DecodeErrorKind};

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01 UTC).
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const XLOG_DATA_HEADER: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;

/// One frame received on the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    XLogData {
        /// WAL position of the start of this payload.
        wal_start: Lsn,
        /// Current end of WAL on the server.
        wal_end: Lsn,
        /// Server send time, microseconds since the PostgreSQL epoch.
        timestamp: i64,
        /// The pgoutput payload.
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: Lsn,
        timestamp: i64,
        /// Server asks for an immediate standby status reply.
        reply_requested: bool,
    },
}

/// Parse one copy-both frame. The payload of an XLogData frame is a
/// zero-copy slice of the input.
pub fn parse_frame(buf: &Bytes) -> Result<ReplicationFrame, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::new(
            DecodeErrorKind::Truncated { needed: 1 },
            0,
        ));
    }

    match buf[0] {
        b'w' => {
            if buf.len() < XLOG_DATA_HEADER {
                return Err(DecodeError::new(
                    DecodeErrorKind::Truncated {
                        needed: XLOG_DATA_HEADER - buf.len(),
                    },
                    buf.len(),
                ));
            }
            Ok(ReplicationFrame::XLogData {
                wal_start: Lsn::from(BigEndian::read_u64(&buf[1..9])),
                wal_end: Lsn::from(BigEndian::read_u64(&buf[9..17])),
                timestamp: BigEndian::read_i64(&buf[17..25]),
                data: buf.slice(XLOG_DATA_HEADER..),
            })
        }
        b'k' => {
            if buf.len() < KEEPALIVE_LEN {
                return Err(DecodeError::new(
                    DecodeErrorKind::Truncated {
                        needed: KEEPALIVE_LEN - buf.len(),
                    },
                    buf.len(),
                ));
            }
            Ok(ReplicationFrame::PrimaryKeepalive {
                wal_end: Lsn::from(BigEndian::read_u64(&buf[1..9])),
                timestamp: BigEndian::read_i64(&buf[9..17]),
                reply_requested: buf[17] == 1,
            })
        }
        other => Err(DecodeError::new(DecodeErrorKind::UnknownTag(other), 0)),
    }
}

/// Encode a StandbyStatusUpdate message.
///
/// `write_lsn` is the latest byte received, `flush_lsn`/`apply_lsn` the
/// latest durably handled position the client vouches for. The server may
/// discard WAL up to `flush_lsn`.
pub fn standby_status_update(
    write_lsn: Lsn,
    flush_lsn: Lsn,
    apply_lsn: Lsn,
    reply_requested: bool,
) -> Bytes {
    let mut buf = Vec::with_capacity(1 + 8 * 4 + 1);
    buf.push(b'r');
    buf.extend_from_slice(&u64::from(write_lsn).to_be_bytes());
    buf.extend_from_slice(&u64::from(flush_lsn).to_be_bytes());
    buf.extend_from_slice(&u64::from(apply_lsn).to_be_bytes());
    buf.extend_from_slice(&pg_epoch_micros_now().to_be_bytes());
    buf.push(u8::from(reply_requested));
    Bytes::from(buf)
}

/// Current wall clock as microseconds since the PostgreSQL epoch.
pub fn pg_epoch_micros_now() -> i64 {
    let unix_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Convert a PostgreSQL-epoch microsecond timestamp to absolute time.
pub fn pg_epoch_to_utc(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros + PG_EPOCH_OFFSET_SECS * 1_000_000;
    Utc.timestamp_micros(unix_micros)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
