use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;

/// Sentinel emitted for TOAST columns whose value was unchanged and therefore
/// not present in the WAL row image. Downstream stages strip it before
/// publishing.
pub const UNCHANGED_TOAST: &str = "__pgfan_unchanged_toast__";

/// A decoded column value from a replicated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Binary-format payload passed through untouched.
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    /// The unchanged-TOAST sentinel value.
    pub fn unchanged_toast() -> Self {
        Value::String(UNCHANGED_TOAST.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unchanged_toast(&self) -> bool {
        matches!(self, Value::String(s) if s == UNCHANGED_TOAST)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.into_iter().map(|x| x.into()).collect())
            }
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// The kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Create,
    Update,
    Delete,
    Truncate,
    Read,
    Message,
}

impl Op {
    /// Single-character code used in operation filters.
    pub fn code(&self) -> char {
        match self {
            Op::Create => 'c',
            Op::Update => 'u',
            Op::Delete => 'd',
            Op::Truncate => 't',
            Op::Read => 'r',
            Op::Message => 'm',
        }
    }

    /// Parse an operation filter code. Accepts the single-character form
    /// (`c`, `u`, `d`, `r`) and the spelled-out name.
    pub fn from_code(code: &str) -> Result<Self, Error> {
        match code {
            "c" | "create" | "insert" => Ok(Op::Create),
            "u" | "update" => Ok(Op::Update),
            "d" | "delete" => Ok(Op::Delete),
            "t" | "truncate" => Ok(Op::Truncate),
            "r" | "read" => Ok(Op::Read),
            "m" | "message" => Ok(Op::Message),
            other => Err(Error::InvalidOpCode(other.to_string())),
        }
    }
}

/// A row map containing column name to value mappings.
pub type RowMap = HashMap<String, Value>;

/// Provenance of a change event within the replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// The schema name (e.g., "public").
    pub schema: String,
    /// The table name.
    pub table: String,
    /// WAL position of the change (monotonically non-decreasing per session).
    pub lsn: u64,
    /// Transaction ID, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    /// Commit timestamp of the surrounding transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<DateTime<Utc>>,
    /// True when the event belongs to a streamed in-progress transaction
    /// (protocol v2) that has not committed yet.
    #[serde(default)]
    pub in_stream: bool,
}

/// A normalized, transport-neutral change event derived from the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcEvent {
    /// The kind of change.
    pub op: Op,
    /// Where the change came from.
    pub source: Source,
    /// Row image before the change (delete, and update where the replica
    /// identity permits it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RowMap>,
    /// Row image after the change (create, update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<RowMap>,
    /// Wall-clock receive time, nanoseconds since the Unix epoch.
    pub ts_ns: i64,
}

impl CdcEvent {
    /// `schema.table` of the source relation.
    pub fn table_ref(&self) -> String {
        format!("{}.{}", self.source.schema, self.source.table)
    }

    /// The row image most relevant to this event: `after` for create/update,
    /// `before` for delete.
    pub fn row(&self) -> Option<&RowMap> {
        match self.op {
            Op::Create | Op::Update | Op::Read | Op::Message => self.after.as_ref(),
            Op::Delete => self.before.as_ref(),
            Op::Truncate => None,
        }
    }

    /// Remove unchanged-TOAST sentinel entries from both row images.
    pub fn strip_unchanged_toast(&mut self) {
        if let Some(row) = self.before.as_mut() {
            row.retain(|_, v| !v.is_unchanged_toast());
        }
        if let Some(row) = self.after.as_mut() {
            row.retain(|_, v| !v.is_unchanged_toast());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(op: Op, before: Option<RowMap>, after: Option<RowMap>) -> CdcEvent {
        CdcEvent {
            op,
            source: Source {
                schema: "public".into(),
                table: "users".into(),
                lsn: 100,
                xid: Some(42),
                commit_time: None,
                in_stream: false,
            },
            before,
            after,
            ts_ns: 0,
        }
    }

    #[test]
    fn test_op_codes() {
        assert_eq!(Op::Create.code(), 'c');
        assert_eq!(Op::from_code("u").unwrap(), Op::Update);
        assert_eq!(Op::from_code("delete").unwrap(), Op::Delete);
        assert!(Op::from_code("x").is_err());
    }

    #[test]
    fn test_row_selects_correct_image() {
        let create = make_event(
            Op::Create,
            None,
            Some([("id".into(), Value::Int(7))].into_iter().collect()),
        );
        assert_eq!(create.row().unwrap().get("id"), Some(&Value::Int(7)));

        let delete = make_event(
            Op::Delete,
            Some([("id".into(), Value::Int(7))].into_iter().collect()),
            None,
        );
        assert_eq!(delete.row().unwrap().get("id"), Some(&Value::Int(7)));

        let truncate = make_event(Op::Truncate, None, None);
        assert!(truncate.row().is_none());
    }

    #[test]
    fn test_strip_unchanged_toast() {
        let mut event = make_event(
            Op::Update,
            None,
            Some(
                [
                    ("id".into(), Value::Int(7)),
                    ("blob".into(), Value::unchanged_toast()),
                ]
                .into_iter()
                .collect(),
            ),
        );

        event.strip_unchanged_toast();
        let after = event.after.unwrap();
        assert_eq!(after.len(), 1);
        assert!(after.contains_key("id"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = make_event(
            Op::Create,
            None,
            Some(
                [
                    ("id".into(), Value::Int(7)),
                    ("name".into(), Value::String("Ada".into())),
                ]
                .into_iter()
                .collect(),
            ),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "create");
        assert_eq!(json["source"]["schema"], "public");
        assert_eq!(json["source"]["table"], "users");
        assert_eq!(json["after"]["id"], 7);
        assert!(json.get("before").is_none());
    }

    #[test]
    fn test_value_json_roundtrip() {
        let original = Value::Object(
            [
                ("name".to_string(), Value::String("test".into())),
                ("count".to_string(), Value::Int(42)),
                ("active".to_string(), Value::Bool(true)),
            ]
            .into_iter()
            .collect(),
        );

        let json: serde_json::Value = original.clone().into();
        let back: Value = json.into();
        assert_eq!(original, back);
    }
}
