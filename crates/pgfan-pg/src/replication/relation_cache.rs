//! Cache for PostgreSQL relation metadata.
//!
//! The server sends a Relation message before the first DML on each table in
//! a replication session, and again whenever the table's schema changes. The
//! cache resolves the relation_id carried by Insert/Update/Delete/Truncate
//! messages; ids are only meaningful within the originating session.

use std::collections::HashMap;

use super::pgoutput::{ColumnInfo, RelationMessage, ReplicaIdentity};

/// Cached information about a PostgreSQL relation (table).
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub replica_identity: ReplicaIdentity,
}

impl RelationInfo {
    /// Names of the replica-identity key columns.
    pub fn key_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| c.name.as_str())
    }
}

impl From<&RelationMessage> for RelationInfo {
    fn from(msg: &RelationMessage) -> Self {
        Self {
            namespace: msg.namespace.clone(),
            name: msg.name.clone(),
            columns: msg.columns.clone(),
            replica_identity: msg.replica_identity,
        }
    }
}

/// Cache of relation id to table metadata mappings.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert from a Relation message. A repeated message for the same id
    /// replaces the cached schema.
    pub fn update(&mut self, msg: &RelationMessage) {
        self.relations.insert(msg.relation_id, msg.into());
    }

    pub fn get(&self, relation_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    /// Clear the cache (e.g., on reconnect).
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(columns: Vec<ColumnInfo>) -> RelationMessage {
        RelationMessage {
            relation_id: 16384,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns,
        }
    }

    fn column(name: &str, type_oid: u32, key: bool) -> ColumnInfo {
        ColumnInfo {
            flags: u8::from(key),
            name: name.to_string(),
            type_oid,
            type_modifier: -1,
        }
    }

    #[test]
    fn test_cache_update_and_get() {
        let mut cache = RelationCache::new();
        cache.update(&relation(vec![column("id", 23, true)]));

        let info = cache.get(16384).unwrap();
        assert_eq!(info.namespace, "public");
        assert_eq!(info.name, "users");
        assert_eq!(info.columns.len(), 1);
        assert_eq!(info.key_columns().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_schema_change_replaces_cached_relation() {
        let mut cache = RelationCache::new();
        cache.update(&relation(vec![column("id", 23, true)]));

        // The table gained a column; a fresh Relation message arrives.
        cache.update(&relation(vec![
            column("id", 23, true),
            column("name", 25, false),
        ]));

        let info = cache.get(16384).unwrap();
        assert_eq!(info.columns.len(), 2);
        assert_eq!(info.columns[1].name, "name");
    }

    #[test]
    fn test_cache_miss() {
        let cache = RelationCache::new();
        assert!(cache.get(12345).is_none());
    }

    #[test]
    fn test_cache_clear() {
        let mut cache = RelationCache::new();
        cache.update(&relation(vec![]));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
