//! Versioned, copy-on-write schema cache.
//!
//! An [`InfoSchema`] is built from a committed metadata snapshot and never
//! changes afterwards. Readers grab the latest one through [`InfoCache`]
//! and keep using it while the owner publishes newer versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::DdlError;
use crate::meta::{MetaSnapshot, MetaStore};
use crate::model::{ReferredForeignKey, SchemaInfo, SchemaState, SimpleTableInfo, TableInfo};

struct SchemaEntry {
    info: SchemaInfo,
    tables: BTreeMap<String, Arc<TableInfo>>,
}

/// Point-in-time view of public schemas and tables.
pub struct InfoSchema {
    schema_version: i64,
    schemas: BTreeMap<String, SchemaEntry>,
    referred: HashMap<(String, String), Vec<ReferredForeignKey>>,
}

impl InfoSchema {
    pub fn from_snapshot(snapshot: &MetaSnapshot) -> Self {
        let mut schemas = BTreeMap::new();
        for schema in snapshot.schemas.values() {
            if schema.state != SchemaState::Public {
                continue;
            }
            let tables = snapshot
                .tables
                .get(&schema.id)
                .map(|tables| {
                    tables
                        .values()
                        .filter(|table| table.state == SchemaState::Public)
                        .map(|table| (table.name.to_ascii_lowercase(), Arc::new(table.clone())))
                        .collect()
                })
                .unwrap_or_default();
            schemas.insert(
                schema.name.to_ascii_lowercase(),
                SchemaEntry {
                    info: schema.clone(),
                    tables,
                },
            );
        }

        let mut referred: HashMap<(String, String), Vec<ReferredForeignKey>> = HashMap::new();
        for entry in schemas.values() {
            for table in entry.tables.values() {
                for fk in table.foreign_keys.iter().filter(|fk| fk.is_enforced()) {
                    referred
                        .entry((fk.ref_schema.to_ascii_lowercase(), fk.ref_table.to_ascii_lowercase()))
                        .or_default()
                        .push(ReferredForeignKey {
                            cols: fk.ref_cols.clone(),
                            child_schema: entry.info.name.clone(),
                            child_table: table.name.clone(),
                            child_fk_name: fk.name.clone(),
                        });
                }
            }
        }

        Self {
            schema_version: snapshot.schema_version,
            schemas,
            referred,
        }
    }

    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    pub fn schema_by_name(&self, schema: &str) -> Option<&SchemaInfo> {
        self.schemas
            .get(&schema.to_ascii_lowercase())
            .map(|entry| &entry.info)
    }

    pub fn table_by_name(&self, schema: &str, table: &str) -> Result<Arc<TableInfo>, DdlError> {
        self.schemas
            .get(&schema.to_ascii_lowercase())
            .and_then(|entry| entry.tables.get(&table.to_ascii_lowercase()))
            .cloned()
            .ok_or_else(|| DdlError::NoSuchTable(schema.to_string(), table.to_string()))
    }

    pub fn table_exists(&self, schema: &str, table: &str) -> bool {
        self.table_by_name(schema, table).is_ok()
    }

    pub fn schema_simple_table_infos(&self, schema: &str) -> Vec<SimpleTableInfo> {
        self.schemas
            .get(&schema.to_ascii_lowercase())
            .map(|entry| {
                entry
                    .tables
                    .values()
                    .map(|table| SimpleTableInfo {
                        id: table.id,
                        name: table.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Enforced constraints of other tables (or the table itself) that
    /// reference `schema.table`.
    pub fn table_referred_foreign_keys(&self, schema: &str, table: &str) -> &[ReferredForeignKey] {
        self.referred
            .get(&(schema.to_ascii_lowercase(), table.to_ascii_lowercase()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Holder of the latest [`InfoSchema`].
pub struct InfoCache {
    latest: RwLock<Arc<InfoSchema>>,
}

impl InfoCache {
    pub fn new(store: &MetaStore) -> Self {
        Self {
            latest: RwLock::new(Arc::new(InfoSchema::from_snapshot(&store.snapshot()))),
        }
    }

    pub fn get_latest(&self) -> Arc<InfoSchema> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Rebuilds from the store's latest commit; older versions are ignored.
    pub fn reload(&self, store: &MetaStore) -> i64 {
        let next = InfoSchema::from_snapshot(&store.snapshot());
        let mut latest = self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if next.schema_version >= latest.schema_version {
            *latest = Arc::new(next);
        }
        latest.schema_version
    }
}
