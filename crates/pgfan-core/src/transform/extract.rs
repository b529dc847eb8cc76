use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::event::CdcEvent;

/// Restrict `before`/`after` row images to the named fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractSpec {
    pub fields: Vec<String>,
}

/// Compiled extract transformation.
#[derive(Debug, Clone)]
pub struct Extract {
    fields: HashSet<String>,
}

impl Extract {
    pub fn new(spec: &ExtractSpec) -> Self {
        Self {
            fields: spec.fields.iter().cloned().collect(),
        }
    }

    pub fn apply(&self, mut event: CdcEvent) -> CdcEvent {
        if let Some(row) = event.before.as_mut() {
            row.retain(|k, _| self.fields.contains(k));
        }
        if let Some(row) = event.after.as_mut() {
            row.retain(|k, _| self.fields.contains(k));
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Op, RowMap, Source, Value};

    #[test]
    fn test_extract_restricts_both_images() {
        let row: RowMap = [
            ("id".into(), Value::Int(7)),
            ("name".into(), Value::String("Ada".into())),
            ("email".into(), Value::String("ada@example.com".into())),
        ]
        .into_iter()
        .collect();

        let event = CdcEvent {
            op: Op::Update,
            source: Source {
                schema: "public".into(),
                table: "users".into(),
                lsn: 0,
                xid: None,
                commit_time: None,
                in_stream: false,
            },
            before: Some(row.clone()),
            after: Some(row),
            ts_ns: 0,
        };

        let extract = Extract::new(&ExtractSpec {
            fields: vec!["id".into(), "name".into()],
        });
        let out = extract.apply(event);

        let after = out.after.unwrap();
        assert_eq!(after.len(), 2);
        assert!(!after.contains_key("email"));
        assert_eq!(out.before.unwrap().len(), 2);
    }
}
