use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{CdcEvent, RowMap};

/// Rewrite schema, table, and column names via literal and regex maps.
/// Literal maps apply first, then each regex in declared order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub schemas: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub columns: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub schemas_regex: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tables_regex: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub columns_regex: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Rename {
    literals: HashMap<String, String>,
    regexes: Vec<(Regex, String)>,
}

impl Rename {
    fn compile(
        literals: &HashMap<String, String>,
        regexes: &HashMap<String, String>,
    ) -> Result<Self> {
        let regexes = regexes
            .iter()
            .map(|(p, r)| Ok((Regex::new(p)?, r.clone())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            literals: literals.clone(),
            regexes,
        })
    }

    fn apply(&self, name: &str) -> String {
        let mut out = match self.literals.get(name) {
            Some(renamed) => renamed.clone(),
            None => name.to_string(),
        };
        for (re, replacement) in &self.regexes {
            out = re.replace_all(&out, replacement.as_str()).into_owned();
        }
        out
    }

    fn is_identity(&self) -> bool {
        self.literals.is_empty() && self.regexes.is_empty()
    }
}

/// Compiled replace transformation.
#[derive(Debug, Clone)]
pub struct Replace {
    schemas: Rename,
    tables: Rename,
    columns: Rename,
}

impl Replace {
    pub fn compile(spec: &ReplaceSpec) -> Result<Self> {
        Ok(Self {
            schemas: Rename::compile(&spec.schemas, &spec.schemas_regex)?,
            tables: Rename::compile(&spec.tables, &spec.tables_regex)?,
            columns: Rename::compile(&spec.columns, &spec.columns_regex)?,
        })
    }

    pub fn apply(&self, mut event: CdcEvent) -> CdcEvent {
        event.source.schema = self.schemas.apply(&event.source.schema);
        event.source.table = self.tables.apply(&event.source.table);

        if !self.columns.is_identity() {
            if let Some(row) = event.before.take() {
                event.before = Some(self.rename_columns(row));
            }
            if let Some(row) = event.after.take() {
                event.after = Some(self.rename_columns(row));
            }
        }

        event
    }

    fn rename_columns(&self, row: RowMap) -> RowMap {
        row.into_iter()
            .map(|(k, v)| (self.columns.apply(&k), v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Op, Source, Value};

    fn make_event() -> CdcEvent {
        CdcEvent {
            op: Op::Create,
            source: Source {
                schema: "legacy".into(),
                table: "users".into(),
                lsn: 0,
                xid: None,
                commit_time: None,
                in_stream: false,
            },
            before: None,
            after: Some(
                [
                    ("user_id".into(), Value::Int(7)),
                    ("user_name".into(), Value::String("Ada".into())),
                ]
                .into_iter()
                .collect(),
            ),
            ts_ns: 0,
        }
    }

    #[test]
    fn test_literal_renames() {
        let replace = Replace::compile(&ReplaceSpec {
            schemas: [("legacy".into(), "public".into())].into_iter().collect(),
            tables: [("users".into(), "accounts".into())].into_iter().collect(),
            ..Default::default()
        })
        .unwrap();

        let out = replace.apply(make_event());
        assert_eq!(out.source.schema, "public");
        assert_eq!(out.source.table, "accounts");
    }

    #[test]
    fn test_regex_column_rename() {
        let replace = Replace::compile(&ReplaceSpec {
            columns_regex: [("^user_".into(), "".into())].into_iter().collect(),
            ..Default::default()
        })
        .unwrap();

        let out = replace.apply(make_event());
        let after = out.after.unwrap();
        assert!(after.contains_key("id"));
        assert!(after.contains_key("name"));
        assert!(!after.contains_key("user_id"));
    }

    #[test]
    fn test_literal_then_regex_order() {
        let replace = Replace::compile(&ReplaceSpec {
            tables: [("users".into(), "raw_users".into())].into_iter().collect(),
            tables_regex: [("^raw_".into(), "v2_".into())].into_iter().collect(),
            ..Default::default()
        })
        .unwrap();

        let out = replace.apply(make_event());
        assert_eq!(out.source.table, "v2_users");
    }
}
