//! Turns decoded pgoutput messages into normalized [`CdcEvent`]s.
//!
//! The normalizer owns all per-session mutable state: the relation cache,
//! the current transaction, and the set of in-progress streamed
//! transactions. It is single-threaded by construction so events leave in
//! WAL order.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use pgfan_core::{CdcEvent, Op, RowMap, Source, Value};

use super::frame::pg_epoch_to_utc;
use super::lsn::Lsn;
use super::pgoutput::{
    ColumnInfo, ColumnValue, Decoded, DeleteMessage, InsertMessage, LogicalMessage,
    PgOutputDecoder, PgOutputMessage, TruncateMessage, TupleData, UpdateMessage,
};
use super::relation_cache::{RelationCache, RelationInfo};
use crate::error::{DecodeError, DecodeErrorKind, PgError, PgResult};

/// Stateful message-to-event normalizer for one replication session.
pub struct Normalizer {
    decoder: PgOutputDecoder,
    relations: RelationCache,
    current_xid: Option<u32>,
    current_commit_time: Option<DateTime<Utc>>,
    in_stream_xids: HashSet<u32>,
    /// xid of the stream segment we are currently inside, if any.
    segment_xid: Option<u32>,
    last_lsn: Lsn,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            decoder: PgOutputDecoder::new(),
            relations: RelationCache::new(),
            current_xid: None,
            current_commit_time: None,
            in_stream_xids: HashSet::new(),
            segment_xid: None,
            last_lsn: Lsn::ZERO,
        }
    }

    /// The highest LSN stamped on an emitted event so far.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Decode one XLogData payload and normalize it. Most messages produce
    /// zero or one event; Truncate produces one per affected relation.
    pub fn handle_payload(&mut self, lsn: Lsn, payload: &[u8]) -> PgResult<Vec<CdcEvent>> {
        let decoded = self
            .decoder
            .decode(payload, self.segment_xid.is_some())?;
        self.handle_message(lsn, decoded)
    }

    fn handle_message(&mut self, lsn: Lsn, decoded: Decoded) -> PgResult<Vec<CdcEvent>> {
        let stream_xid = decoded.xid;

        match decoded.message {
            PgOutputMessage::Relation(rel) => {
                debug!(
                    relation_id = rel.relation_id,
                    schema = %rel.namespace,
                    table = %rel.name,
                    "Caching relation metadata"
                );
                self.relations.update(&rel);
                Ok(vec![])
            }
            PgOutputMessage::Begin(begin) => {
                self.current_xid = Some(begin.xid);
                self.current_commit_time = Some(pg_epoch_to_utc(begin.timestamp));
                Ok(vec![])
            }
            PgOutputMessage::Commit(commit) => {
                self.current_xid = None;
                self.current_commit_time = None;
                // The commit's end LSN is the replay point for everything in
                // this transaction; stamp it as seen.
                self.last_lsn = self.last_lsn.max(commit.end_lsn);
                Ok(vec![])
            }
            PgOutputMessage::Origin(_) | PgOutputMessage::Type(_) => Ok(vec![]),
            PgOutputMessage::Insert(insert) => {
                Ok(vec![self.insert_event(insert, lsn, stream_xid)?])
            }
            PgOutputMessage::Update(update) => {
                Ok(vec![self.update_event(update, lsn, stream_xid)?])
            }
            PgOutputMessage::Delete(delete) => {
                Ok(vec![self.delete_event(delete, lsn, stream_xid)?])
            }
            PgOutputMessage::Truncate(truncate) => {
                self.truncate_events(truncate, lsn, stream_xid)
            }
            PgOutputMessage::Message(message) => {
                Ok(vec![self.logical_message_event(message, lsn, stream_xid)])
            }
            PgOutputMessage::StreamStart(start) => {
                debug!(xid = start.xid, first_segment = start.first_segment, "Stream segment start");
                self.in_stream_xids.insert(start.xid);
                self.segment_xid = Some(start.xid);
                Ok(vec![])
            }
            PgOutputMessage::StreamStop => {
                // The xid stays in-stream; segments of other xids may follow.
                self.segment_xid = None;
                Ok(vec![])
            }
            PgOutputMessage::StreamCommit(commit) => {
                debug!(xid = commit.xid, "Streamed transaction committed");
                self.in_stream_xids.remove(&commit.xid);
                self.last_lsn = self.last_lsn.max(commit.end_lsn);
                Ok(vec![])
            }
            PgOutputMessage::StreamAbort(abort) => {
                warn!(
                    xid = abort.xid,
                    "Streamed transaction aborted; its prior events are void"
                );
                self.in_stream_xids.remove(&abort.xid);
                Ok(vec![])
            }
        }
    }

    fn insert_event(
        &mut self,
        insert: InsertMessage,
        lsn: Lsn,
        stream_xid: Option<u32>,
    ) -> PgResult<CdcEvent> {
        let relation = self.resolve(insert.relation_id)?;
        let after = tuple_to_row_map(&insert.tuple, &relation.columns)?;
        let source = self.make_source(&relation, lsn, stream_xid);
        Ok(self.emit(Op::Create, source, None, Some(after)))
    }

    fn update_event(
        &mut self,
        update: UpdateMessage,
        lsn: Lsn,
        stream_xid: Option<u32>,
    ) -> PgResult<CdcEvent> {
        let relation = self.resolve(update.relation_id)?;
        let after = tuple_to_row_map(&update.new_tuple, &relation.columns)?;
        // The old image is only on the wire when the replica identity allows
        // it (FULL, or key columns when the key changed).
        let before = update
            .old_tuple
            .as_ref()
            .map(|(_, tuple)| tuple_to_row_map(tuple, &relation.columns))
            .transpose()?;
        let source = self.make_source(&relation, lsn, stream_xid);
        Ok(self.emit(Op::Update, source, before, Some(after)))
    }

    fn delete_event(
        &mut self,
        delete: DeleteMessage,
        lsn: Lsn,
        stream_xid: Option<u32>,
    ) -> PgResult<CdcEvent> {
        let relation = self.resolve(delete.relation_id)?;
        let before = tuple_to_row_map(&delete.old_tuple, &relation.columns)?;
        let source = self.make_source(&relation, lsn, stream_xid);
        Ok(self.emit(Op::Delete, source, Some(before), None))
    }

    /// One truncate event per affected relation.
    fn truncate_events(
        &mut self,
        truncate: TruncateMessage,
        lsn: Lsn,
        stream_xid: Option<u32>,
    ) -> PgResult<Vec<CdcEvent>> {
        let mut events = Vec::with_capacity(truncate.relation_ids.len());
        for relation_id in &truncate.relation_ids {
            let relation = self.resolve(*relation_id)?;
            let source = self.make_source(&relation, lsn, stream_xid);
            events.push(self.emit(Op::Truncate, source, None, None));
        }
        Ok(events)
    }

    fn logical_message_event(
        &mut self,
        message: LogicalMessage,
        lsn: Lsn,
        stream_xid: Option<u32>,
    ) -> CdcEvent {
        let content = match String::from_utf8(message.content.clone()) {
            Ok(s) => Value::String(s),
            Err(_) => Value::Bytes(message.content),
        };
        let after: RowMap = [
            ("prefix".to_string(), Value::String(message.prefix)),
            ("content".to_string(), content),
        ]
        .into_iter()
        .collect();

        let xid = stream_xid.or(self.current_xid);
        let source = Source {
            schema: String::new(),
            table: String::new(),
            lsn: lsn.max(message.lsn).into(),
            xid,
            commit_time: self.current_commit_time,
            in_stream: stream_xid.is_some(),
        };
        self.emit(Op::Message, source, None, Some(after))
    }

    fn resolve(&self, relation_id: u32) -> PgResult<RelationInfo> {
        self.relations
            .get(relation_id)
            .cloned()
            .ok_or(PgError::RelationNotFound(relation_id))
    }

    fn make_source(&self, relation: &RelationInfo, lsn: Lsn, stream_xid: Option<u32>) -> Source {
        let in_stream = stream_xid.is_some();
        Source {
            schema: relation.namespace.clone(),
            table: relation.name.clone(),
            lsn: lsn.into(),
            xid: stream_xid.or(self.current_xid),
            // Streamed transactions have no commit time until StreamCommit.
            commit_time: if in_stream {
                None
            } else {
                self.current_commit_time
            },
            in_stream,
        }
    }

    /// Stamp the monotonic LSN floor and receive time, then build the event.
    fn emit(
        &mut self,
        op: Op,
        mut source: Source,
        before: Option<RowMap>,
        after: Option<RowMap>,
    ) -> CdcEvent {
        let lsn = Lsn::from(source.lsn).max(self.last_lsn);
        self.last_lsn = lsn;
        source.lsn = lsn.into();

        CdcEvent {
            op,
            source,
            before,
            after,
            ts_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one row image against the cached column metadata.
fn tuple_to_row_map(tuple: &TupleData, columns: &[ColumnInfo]) -> PgResult<RowMap> {
    if tuple.columns.len() != columns.len() {
        return Err(PgError::Decode(DecodeError::new(
            DecodeErrorKind::ColumnCountMismatch {
                expected: columns.len(),
                actual: tuple.columns.len(),
            },
            0,
        )));
    }

    let mut row = RowMap::with_capacity(columns.len());
    for (value, info) in tuple.columns.iter().zip(columns.iter()) {
        let decoded = match value {
            ColumnValue::Null => Value::Null,
            ColumnValue::Unchanged => Value::unchanged_toast(),
            ColumnValue::Text(bytes) => {
                parse_text_value(&String::from_utf8_lossy(bytes), info.type_oid)
            }
            ColumnValue::Binary(bytes) => Value::Bytes(bytes.clone()),
        };
        row.insert(info.name.clone(), decoded);
    }

    Ok(row)
}

/// Parse a text-format value based on its PostgreSQL type OID.
fn parse_text_value(s: &str, type_oid: u32) -> Value {
    match type_oid {
        16 => Value::Bool(s == "t" || s == "true"), // bool
        20 | 21 | 23 => s
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::String(s.to_string())), // int8, int2, int4
        700 | 701 | 1700 => s
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::String(s.to_string())), // float4, float8, numeric
        114 | 3802 => serde_json::from_str::<serde_json::Value>(s)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(s.to_string())), // json, jsonb
        // text, varchar, uuid, date/time types, arrays: keep the text form
        _ => Value::String(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeErrorKind;

    // Wire payload builders mirroring the pgoutput message formats.

    fn begin(xid: u32, final_lsn: u64) -> Vec<u8> {
        let mut data = vec![b'B'];
        data.extend_from_slice(&final_lsn.to_be_bytes());
        data.extend_from_slice(&1_000_000i64.to_be_bytes());
        data.extend_from_slice(&xid.to_be_bytes());
        data
    }

    fn commit(end_lsn: u64) -> Vec<u8> {
        let mut data = vec![b'C', 0];
        data.extend_from_slice(&(end_lsn - 8).to_be_bytes());
        data.extend_from_slice(&end_lsn.to_be_bytes());
        data.extend_from_slice(&1_000_000i64.to_be_bytes());
        data
    }

    fn relation(relation_id: u32, replica_identity: u8) -> Vec<u8> {
        let mut data = vec![b'R'];
        data.extend_from_slice(&relation_id.to_be_bytes());
        data.extend_from_slice(b"public\0");
        data.extend_from_slice(b"users\0");
        data.push(replica_identity);
        data.extend_from_slice(&2i16.to_be_bytes());
        data.push(1);
        data.extend_from_slice(b"id\0");
        data.extend_from_slice(&23u32.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());
        data.push(0);
        data.extend_from_slice(b"name\0");
        data.extend_from_slice(&25u32.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());
        data
    }

    fn text_tuple(values: &[&[u8]]) -> Vec<u8> {
        let mut data = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            data.push(b't');
            data.extend_from_slice(&(value.len() as i32).to_be_bytes());
            data.extend_from_slice(value);
        }
        data
    }

    fn insert(relation_id: u32, values: &[&[u8]]) -> Vec<u8> {
        let mut data = vec![b'I'];
        data.extend_from_slice(&relation_id.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&text_tuple(values));
        data
    }

    fn delete_full(relation_id: u32, values: &[&[u8]]) -> Vec<u8> {
        let mut data = vec![b'D'];
        data.extend_from_slice(&relation_id.to_be_bytes());
        data.push(b'O');
        data.extend_from_slice(&text_tuple(values));
        data
    }

    fn update_no_old(relation_id: u32, values: &[&[u8]]) -> Vec<u8> {
        let mut data = vec![b'U'];
        data.extend_from_slice(&relation_id.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&text_tuple(values));
        data
    }

    fn feed(normalizer: &mut Normalizer, lsn: u64, payload: Vec<u8>) -> Vec<CdcEvent> {
        normalizer.handle_payload(Lsn::from(lsn), &payload).unwrap()
    }

    #[test]
    fn test_insert_produces_create_event() {
        let mut n = Normalizer::new();
        assert!(feed(&mut n, 10, begin(42, 100)).is_empty());
        assert!(feed(&mut n, 10, relation(16384, b'd')).is_empty());

        let events = feed(&mut n, 20, insert(16384, &[b"7", b"Ada"]));
        assert_eq!(events.len(), 1);
        let event = &events[0];

        assert_eq!(event.op, Op::Create);
        assert_eq!(event.source.schema, "public");
        assert_eq!(event.source.table, "users");
        assert_eq!(event.source.xid, Some(42));
        assert!(!event.source.in_stream);
        assert!(event.source.commit_time.is_some());
        assert!(event.before.is_none());

        let after = event.after.as_ref().unwrap();
        assert_eq!(after.get("id"), Some(&Value::Int(7)));
        assert_eq!(after.get("name"), Some(&Value::String("Ada".into())));
    }

    #[test]
    fn test_update_default_identity_omits_before() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, begin(42, 100));
        feed(&mut n, 10, relation(16384, b'd'));

        let events = feed(&mut n, 20, update_no_old(16384, &[b"7", b"Ada L."]));
        let event = &events[0];
        assert_eq!(event.op, Op::Update);
        assert!(event.before.is_none());
        assert_eq!(
            event.after.as_ref().unwrap().get("name"),
            Some(&Value::String("Ada L.".into()))
        );
    }

    #[test]
    fn test_update_with_key_only_old_tuple() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, begin(42, 100));
        feed(&mut n, 10, relation(16384, b'd'));

        // The key changed, so the server ships the old key columns.
        let mut payload = vec![b'U'];
        payload.extend_from_slice(&16384u32.to_be_bytes());
        payload.push(b'K');
        payload.extend_from_slice(&2i16.to_be_bytes());
        payload.push(b't');
        payload.extend_from_slice(&1i32.to_be_bytes());
        payload.push(b'7');
        payload.push(b'n'); // non-key column absent from the key image
        payload.push(b'N');
        payload.extend_from_slice(&text_tuple(&[b"8", b"Ada L."]));

        let events = feed(&mut n, 20, payload);
        let event = &events[0];
        assert_eq!(event.op, Op::Update);

        let before = event.before.as_ref().unwrap();
        assert_eq!(before.get("id"), Some(&Value::Int(7)));
        assert_eq!(before.get("name"), Some(&Value::Null));
        assert_eq!(
            event.after.as_ref().unwrap().get("id"),
            Some(&Value::Int(8))
        );
    }

    #[test]
    fn test_delete_full_identity_has_before() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, begin(42, 100));
        feed(&mut n, 10, relation(16384, b'f'));

        let events = feed(&mut n, 20, delete_full(16384, &[b"7", b"Ada L."]));
        let event = &events[0];
        assert_eq!(event.op, Op::Delete);
        assert!(event.after.is_none());

        let before = event.before.as_ref().unwrap();
        assert_eq!(before.get("id"), Some(&Value::Int(7)));
        assert_eq!(before.get("name"), Some(&Value::String("Ada L.".into())));
    }

    #[test]
    fn test_truncate_one_event_per_relation() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, relation(16384, b'd'));

        let mut orders = relation(16385, b'd');
        // Patch the table name: replace "users" with "order" (same length).
        let pos = orders.windows(5).position(|w| w == b"users".as_slice()).unwrap();
        orders[pos..pos + 5].copy_from_slice(b"order");
        feed(&mut n, 10, orders);

        let mut payload = vec![b'T'];
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.push(0);
        payload.extend_from_slice(&16384u32.to_be_bytes());
        payload.extend_from_slice(&16385u32.to_be_bytes());

        let events = feed(&mut n, 30, payload);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.op == Op::Truncate));
        let tables: Vec<_> = events.iter().map(|e| e.source.table.as_str()).collect();
        assert_eq!(tables, vec!["users", "order"]);
    }

    #[test]
    fn test_schema_change_decodes_under_new_relation() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, relation(16384, b'd'));

        // Same relation id arrives again with a different column name.
        let mut changed = relation(16384, b'd');
        let pos = changed.windows(4).position(|w| w == b"name".as_slice()).unwrap();
        changed[pos..pos + 4].copy_from_slice(b"nick");
        feed(&mut n, 15, changed);

        let events = feed(&mut n, 20, insert(16384, &[b"7", b"Ada"]));
        let after = events[0].after.as_ref().unwrap();
        assert!(after.contains_key("nick"));
        assert!(!after.contains_key("name"));
    }

    #[test]
    fn test_streamed_transaction_tagging() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, relation(16384, b'd'));

        let mut start = vec![b'S'];
        start.extend_from_slice(&77u32.to_be_bytes());
        start.push(1);
        feed(&mut n, 15, start);

        // Inside the segment the insert carries a leading xid.
        let mut streamed = vec![b'I'];
        streamed.extend_from_slice(&77u32.to_be_bytes());
        streamed.extend_from_slice(&16384u32.to_be_bytes());
        streamed.push(b'N');
        streamed.extend_from_slice(&text_tuple(&[b"7", b"Ada"]));

        let events = feed(&mut n, 20, streamed);
        assert_eq!(events[0].source.xid, Some(77));
        assert!(events[0].source.in_stream);
        assert!(events[0].source.commit_time.is_none());

        feed(&mut n, 25, vec![b'E']); // StreamStop

        // A plain transaction interleaves while xid 77 is still open.
        feed(&mut n, 30, begin(90, 200));
        let events = feed(&mut n, 35, insert(16384, &[b"8", b"Grace"]));
        assert!(!events[0].source.in_stream);
        assert_eq!(events[0].source.xid, Some(90));

        // StreamCommit closes xid 77.
        let mut sc = vec![b'c'];
        sc.extend_from_slice(&77u32.to_be_bytes());
        sc.push(0);
        sc.extend_from_slice(&300u64.to_be_bytes());
        sc.extend_from_slice(&400u64.to_be_bytes());
        sc.extend_from_slice(&0i64.to_be_bytes());
        assert!(feed(&mut n, 40, sc).is_empty());
        assert_eq!(n.last_lsn(), Lsn::from(400));
    }

    #[test]
    fn test_lsn_monotonically_non_decreasing() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, begin(42, 100));
        feed(&mut n, 10, relation(16384, b'd'));

        let mut last = 0;
        for lsn in [20u64, 25, 0, 30] {
            // A zero wal_start (as some servers send for in-transaction
            // messages) must not move the event LSN backwards.
            let events = feed(&mut n, lsn, insert(16384, &[b"1", b"x"]));
            assert!(events[0].source.lsn >= last);
            last = events[0].source.lsn;
        }
    }

    #[test]
    fn test_unknown_relation_is_an_error() {
        let mut n = Normalizer::new();
        let err = n
            .handle_payload(Lsn::from(10), &insert(99999, &[b"1", b"x"]))
            .unwrap_err();
        assert!(matches!(err, PgError::RelationNotFound(99999)));
    }

    #[test]
    fn test_column_count_mismatch() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, relation(16384, b'd'));

        let err = n
            .handle_payload(Lsn::from(20), &insert(16384, &[b"7"]))
            .unwrap_err();
        match err {
            PgError::Decode(e) => assert_eq!(
                e.kind,
                DecodeErrorKind::ColumnCountMismatch {
                    expected: 2,
                    actual: 1
                }
            ),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_unchanged_toast_sentinel() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, begin(42, 100));
        feed(&mut n, 10, relation(16384, b'd'));

        let mut payload = vec![b'U'];
        payload.extend_from_slice(&16384u32.to_be_bytes());
        payload.push(b'N');
        payload.extend_from_slice(&2i16.to_be_bytes());
        payload.push(b't');
        payload.extend_from_slice(&1i32.to_be_bytes());
        payload.push(b'7');
        payload.push(b'u'); // unchanged TOAST column

        let events = feed(&mut n, 20, payload);
        let after = events[0].after.as_ref().unwrap();
        assert!(after.get("name").unwrap().is_unchanged_toast());
    }

    #[test]
    fn test_commit_clears_transaction_state() {
        let mut n = Normalizer::new();
        feed(&mut n, 10, begin(42, 100));
        feed(&mut n, 10, relation(16384, b'd'));
        feed(&mut n, 20, insert(16384, &[b"7", b"Ada"]));
        feed(&mut n, 30, commit(100));

        // After commit the next event has no xid until the next Begin.
        let events = feed(&mut n, 110, insert(16384, &[b"8", b"Grace"]));
        assert_eq!(events[0].source.xid, None);
        assert!(events[0].source.commit_time.is_none());
        assert_eq!(n.last_lsn(), Lsn::from(110));
    }

    #[test]
    fn test_logical_message_event() {
        let mut n = Normalizer::new();
        let mut payload = vec![b'M', 1];
        payload.extend_from_slice(&0x50u64.to_be_bytes());
        payload.extend_from_slice(b"audit\0");
        payload.extend_from_slice(&5u32.to_be_bytes());
        payload.extend_from_slice(b"hello");

        let events = feed(&mut n, 0, payload);
        assert_eq!(events[0].op, Op::Message);
        let after = events[0].after.as_ref().unwrap();
        assert_eq!(after.get("prefix"), Some(&Value::String("audit".into())));
        assert_eq!(after.get("content"), Some(&Value::String("hello".into())));
        assert_eq!(events[0].source.lsn, 0x50);
    }
}
