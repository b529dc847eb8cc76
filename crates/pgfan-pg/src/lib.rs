pub mod dsn;
mod error;
pub mod replication;
pub mod validation;

pub use error::{DecodeError, DecodeErrorKind, PgError, PgResult};
pub use replication::{
    AckHandle, AckPolicy, Lsn, Normalizer, ReplicationSession, SessionConfig, SlotInfo,
};
pub use validation::check_replication_setup;
