use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{CdcEvent, Op};
use crate::glob::Glob;

/// Declarative filter: keep events matching a conjunction of table globs,
/// exclusion globs, and an operation set. Empty lists impose no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tables: Vec<String>,
    /// Operation codes: subset of `c`, `u`, `d`, `r` (spelled-out names are
    /// accepted too).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<String>,
}

/// Compiled filter transformation.
#[derive(Debug, Clone)]
pub struct Filter {
    tables: Vec<Glob>,
    exclude_tables: Vec<Glob>,
    operations: Option<HashSet<Op>>,
}

impl Filter {
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        let tables = spec
            .tables
            .iter()
            .map(|p| Glob::compile(p))
            .collect::<Result<Vec<_>>>()?;
        let exclude_tables = spec
            .exclude_tables
            .iter()
            .map(|p| Glob::compile(p))
            .collect::<Result<Vec<_>>>()?;

        let operations = if spec.operations.is_empty() {
            None
        } else {
            Some(
                spec.operations
                    .iter()
                    .map(|c| Op::from_code(c))
                    .collect::<Result<HashSet<_>>>()?,
            )
        };

        Ok(Self {
            tables,
            exclude_tables,
            operations,
        })
    }

    pub fn apply(&self, event: CdcEvent) -> Option<CdcEvent> {
        let table_ref = event.table_ref();

        if !self.tables.is_empty() && !self.tables.iter().any(|g| g.matches(&table_ref)) {
            return None;
        }
        if self.exclude_tables.iter().any(|g| g.matches(&table_ref)) {
            return None;
        }
        if let Some(ops) = &self.operations {
            if !ops.contains(&event.op) {
                return None;
            }
        }

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Source;

    fn make_event(schema: &str, table: &str, op: Op) -> CdcEvent {
        CdcEvent {
            op,
            source: Source {
                schema: schema.into(),
                table: table.into(),
                lsn: 0,
                xid: None,
                commit_time: None,
                in_stream: false,
            },
            before: None,
            after: None,
            ts_ns: 0,
        }
    }

    fn compile(spec: FilterSpec) -> Filter {
        Filter::compile(&spec).unwrap()
    }

    #[test]
    fn test_table_glob_filter() {
        let f = compile(FilterSpec {
            tables: vec!["public.users".into()],
            ..Default::default()
        });

        assert!(f.apply(make_event("public", "users", Op::Create)).is_some());
        assert!(f.apply(make_event("public", "temp_log", Op::Create)).is_none());
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let f = compile(FilterSpec {
            tables: vec!["public.*".into()],
            exclude_tables: vec!["public.temp_*".into()],
            ..Default::default()
        });

        assert!(f.apply(make_event("public", "users", Op::Create)).is_some());
        assert!(f.apply(make_event("public", "temp_log", Op::Create)).is_none());
    }

    #[test]
    fn test_operation_filter() {
        let f = compile(FilterSpec {
            operations: vec!["c".into(), "u".into()],
            ..Default::default()
        });

        assert!(f.apply(make_event("public", "users", Op::Create)).is_some());
        assert!(f.apply(make_event("public", "users", Op::Update)).is_some());
        assert!(f.apply(make_event("public", "users", Op::Delete)).is_none());
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let f = compile(FilterSpec::default());
        assert!(f.apply(make_event("audit", "anything", Op::Truncate)).is_some());
    }
}
