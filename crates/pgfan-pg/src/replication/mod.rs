//! Logical replication over the PostgreSQL streaming protocol.
//!
//! Byte-level pgoutput decoding, copy-both frame handling, slot and
//! publication lifecycle, and the session loop that turns WAL into
//! [`pgfan_core::CdcEvent`]s.

pub mod frame;
pub mod lsn;
pub mod normalizer;
pub mod pgoutput;
pub mod publication;
pub mod relation_cache;
pub mod session;
pub mod slot;

pub use frame::{parse_frame, standby_status_update, ReplicationFrame};
pub use lsn::Lsn;
pub use normalizer::Normalizer;
pub use pgoutput::{PgOutputDecoder, PgOutputMessage};
pub use publication::{ensure_publication, quote_ident, quote_table_name, TablePattern};
pub use relation_cache::RelationCache;
pub use session::{AckHandle, AckPolicy, ReplicationSession, SessionConfig};
pub use slot::{ensure_slot, get_confirmed_flush_lsn, slot_exists, SlotInfo};
