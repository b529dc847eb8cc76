use thiserror::Error;

/// What went wrong while decoding a wire message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("payload truncated: needed {needed} more byte(s)")]
    Truncated { needed: usize },

    #[error("unknown message tag 0x{0:02X}")]
    UnknownTag(u8),

    #[error("unknown tuple marker 0x{0:02X}")]
    UnknownTupleMarker(u8),

    #[error("invalid UTF-8 in identifier")]
    InvalidUtf8,

    #[error("tuple has {actual} columns, relation declares {expected}")]
    ColumnCountMismatch { expected: usize, actual: usize },
}

/// A positional wire decode failure. Fatal for the session: the stream is
/// positional, so a malformed message cannot be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error at offset {offset}: {kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: usize,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("replication slot '{0}' does not exist")]
    SlotNotFound(String),

    #[error("failed to create replication slot: {0}")]
    SlotCreationFailed(String),

    #[error("replication slot '{slot}' uses plugin '{plugin}', expected pgoutput")]
    SlotPluginMismatch { slot: String, plugin: String },

    #[error("publication '{0}' does not exist")]
    PublicationNotFound(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("no cached relation for id {0}")]
    RelationNotFound(u32),

    #[error("invalid connection string: {0}")]
    InvalidDsn(String),

    #[error("server is not configured for logical replication: {0}")]
    Unsupported(String),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
