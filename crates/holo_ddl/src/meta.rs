//! Transactional metadata store.
//!
//! The store keeps one immutable [`MetaSnapshot`] behind an `Arc`. A
//! [`MetaTxn`] works on a private copy and installs it on commit, so a
//! schema-change step is either fully visible or not at all. Dropping a
//! transaction discards it.
//!
//! When other transactions committed in between, the commit is replayed on
//! top of the newer snapshot only if the two sides touched disjoint job
//! records and at most one of them changed the catalog or allocated ids.
//! Anything else is a write conflict.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DdlError;
use crate::job::{Job, JobState};
use crate::model::{SchemaInfo, SchemaState, TableInfo};

/// Full metadata state at one committed revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaSnapshot {
    pub revision: u64,
    pub schema_version: i64,
    pub ddl_table_version: i64,
    pub next_global_id: i64,
    pub schemas: BTreeMap<i64, SchemaInfo>,
    pub tables: BTreeMap<i64, BTreeMap<i64, TableInfo>>,
    /// Queued and running jobs ordered by id.
    pub jobs: BTreeMap<i64, Job>,
    pub history: BTreeMap<i64, Job>,
}

struct MetaStoreInner {
    snapshot: RwLock<Arc<MetaSnapshot>>,
    path: Option<PathBuf>,
}

/// Shared handle; clones observe the same committed state.
#[derive(Clone)]
pub struct MetaStore {
    inner: Arc<MetaStoreInner>,
}

impl MetaStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MetaStoreInner {
                snapshot: RwLock::new(Arc::new(MetaSnapshot::default())),
                path: None,
            }),
        }
    }

    /// Loads the JSON snapshot at `path`, or initialises an empty one.
    /// Every commit rewrites the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<MetaSnapshot>(&data)
                .with_context(|| format!("decode metadata snapshot {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MetaSnapshot::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("read metadata snapshot {}", path.display()))
            }
        };
        let store = Self {
            inner: Arc::new(MetaStoreInner {
                snapshot: RwLock::new(Arc::new(snapshot)),
                path: Some(path),
            }),
        };
        store.persist(&store.snapshot())?;
        Ok(store)
    }

    /// Latest committed snapshot.
    pub fn snapshot(&self) -> Arc<MetaSnapshot> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn begin(&self) -> MetaTxn {
        let base = self.snapshot();
        MetaTxn {
            store: self.clone(),
            working: (*base).clone(),
            base,
        }
    }

    /// Creates a database outside the job queue, used at bootstrap.
    pub fn create_schema(&self, name: &str) -> Result<i64> {
        let mut txn = self.begin();
        if txn
            .list_schemas()
            .iter()
            .any(|schema| schema.name.eq_ignore_ascii_case(name))
        {
            return Err(DdlError::DatabaseExists(name.to_string()).into());
        }
        let id = txn.gen_global_id();
        txn.create_schema(SchemaInfo {
            id,
            name: name.to_string(),
            state: SchemaState::Public,
        })?;
        txn.gen_schema_version();
        txn.commit()?;
        Ok(id)
    }

    fn install(&self, base: &MetaSnapshot, next: MetaSnapshot) -> Result<u64> {
        let mut current = self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = if current.revision == base.revision {
            next
        } else {
            let rebased = rebase(base, &current, next).ok_or(DdlError::WriteConflict {
                base: base.revision,
                current: current.revision,
            })?;
            debug!(base = base.revision, current = current.revision, "metadata commit rebased");
            rebased
        };
        next.revision = current.revision + 1;
        // Decision: write the file before publishing so a failed write
        // leaves readers on the previous revision.
        self.persist(&next)?;
        let revision = next.revision;
        *current = Arc::new(next);
        Ok(revision)
    }

    fn persist(&self, snapshot: &MetaSnapshot) -> Result<()> {
        let Some(path) = self.inner.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create metadata dir")?;
        }
        let data = serde_json::to_vec_pretty(snapshot).context("serialize metadata snapshot")?;
        fs::write(path, data).context("write metadata snapshot")?;
        Ok(())
    }
}

fn catalog_changed(from: &MetaSnapshot, to: &MetaSnapshot) -> bool {
    from.schema_version != to.schema_version
        || from.ddl_table_version != to.ddl_table_version
        || from.schemas != to.schemas
        || from.tables != to.tables
}

fn job_record(snapshot: &MetaSnapshot, job_id: i64) -> (Option<&Job>, Option<&Job>) {
    (snapshot.jobs.get(&job_id), snapshot.history.get(&job_id))
}

/// Job ids whose queue or history entry differs between `from` and `to`.
/// History only grows, so only new history entries are compared.
fn changed_job_ids(from: &MetaSnapshot, to: &MetaSnapshot) -> BTreeSet<i64> {
    from.jobs
        .keys()
        .chain(to.jobs.keys())
        .chain(to.history.keys().filter(|id| !from.history.contains_key(id)))
        .copied()
        .filter(|id| job_record(from, *id) != job_record(to, *id))
        .collect()
}

/// Replays the changes `ours` made since `base` on top of `current`.
fn rebase(base: &MetaSnapshot, current: &MetaSnapshot, ours: MetaSnapshot) -> Option<MetaSnapshot> {
    let ours_catalog = catalog_changed(base, &ours);
    if ours_catalog && catalog_changed(base, current) {
        return None;
    }
    if ours.next_global_id != base.next_global_id && current.next_global_id != base.next_global_id {
        return None;
    }
    let ours_jobs = changed_job_ids(base, &ours);
    if ours_jobs
        .iter()
        .any(|id| job_record(current, *id) != job_record(base, *id))
    {
        return None;
    }

    let mut merged = current.clone();
    merged.next_global_id = current.next_global_id.max(ours.next_global_id);
    for id in ours_jobs {
        match ours.jobs.get(&id) {
            Some(job) => merged.jobs.insert(id, job.clone()),
            None => merged.jobs.remove(&id),
        };
        match ours.history.get(&id) {
            Some(job) => merged.history.insert(id, job.clone()),
            None => merged.history.remove(&id),
        };
    }
    if ours_catalog {
        merged.schema_version = ours.schema_version;
        merged.ddl_table_version = ours.ddl_table_version;
        merged.schemas = ours.schemas;
        merged.tables = ours.tables;
    }
    Some(merged)
}

/// Metadata mutator bound to one optimistic transaction.
pub struct MetaTxn {
    store: MetaStore,
    base: Arc<MetaSnapshot>,
    working: MetaSnapshot,
}

impl MetaTxn {
    pub fn get_schema(&self, schema_id: i64) -> Option<&SchemaInfo> {
        self.working.schemas.get(&schema_id)
    }

    pub fn list_schemas(&self) -> Vec<SchemaInfo> {
        self.working.schemas.values().cloned().collect()
    }

    pub fn create_schema(&mut self, schema: SchemaInfo) -> Result<()> {
        if self.working.schemas.contains_key(&schema.id) {
            return Err(DdlError::DatabaseExists(schema.name).into());
        }
        self.working.tables.entry(schema.id).or_default();
        self.working.schemas.insert(schema.id, schema);
        Ok(())
    }

    pub fn list_tables(&self, schema_id: i64) -> Result<Vec<TableInfo>> {
        let tables = self.schema_tables(schema_id)?;
        Ok(tables.values().cloned().collect())
    }

    pub fn get_table(&self, schema_id: i64, table_id: i64) -> Option<TableInfo> {
        self.working
            .tables
            .get(&schema_id)
            .and_then(|tables| tables.get(&table_id))
            .cloned()
    }

    pub fn create_table(&mut self, schema_id: i64, table: TableInfo) -> Result<()> {
        let tables = self.schema_tables_mut(schema_id)?;
        if tables.contains_key(&table.id) {
            return Err(DdlError::TableExists(table.name).into());
        }
        tables.insert(table.id, table);
        Ok(())
    }

    pub fn update_table(&mut self, schema_id: i64, table: TableInfo) -> Result<()> {
        let tables = self.schema_tables_mut(schema_id)?;
        match tables.get_mut(&table.id) {
            Some(slot) => {
                *slot = table;
                Ok(())
            }
            None => Err(anyhow!("table id {} not found in schema {schema_id}", table.id)),
        }
    }

    pub fn drop_table(&mut self, schema_id: i64, table_id: i64) -> Result<()> {
        let tables = self.schema_tables_mut(schema_id)?;
        tables
            .remove(&table_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("table id {table_id} not found in schema {schema_id}"))
    }

    pub fn gen_global_id(&mut self) -> i64 {
        self.working.next_global_id += 1;
        self.working.next_global_id
    }

    pub fn gen_schema_version(&mut self) -> i64 {
        self.working.schema_version += 1;
        self.working.schema_version
    }

    pub fn schema_version(&self) -> i64 {
        self.working.schema_version
    }

    pub fn ddl_table_version(&self) -> i64 {
        self.working.ddl_table_version
    }

    pub fn set_ddl_table_version(&mut self, version: i64) {
        self.working.ddl_table_version = version;
    }

    /// Assigns an id and appends the job to the queue.
    pub fn enqueue_job(&mut self, mut job: Job) -> i64 {
        job.id = self.gen_global_id();
        job.state = JobState::Queued;
        let id = job.id;
        self.working.jobs.insert(id, job);
        id
    }

    pub fn update_job(&mut self, job: &Job) -> Result<()> {
        match self.working.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(anyhow!("job {} is not queued", job.id)),
        }
    }

    /// Removes the job from the queue and archives it.
    pub fn finish_job(&mut self, job: &Job) -> Result<()> {
        if self.working.jobs.remove(&job.id).is_none() {
            return Err(anyhow!("job {} is not queued", job.id));
        }
        self.working.history.insert(job.id, job.clone());
        Ok(())
    }

    pub fn queued_jobs(&self) -> Vec<Job> {
        self.working.jobs.values().cloned().collect()
    }

    pub fn first_queued_job(&self) -> Option<Job> {
        self.working.jobs.values().next().cloned()
    }

    pub fn history_job(&self, job_id: i64) -> Option<&Job> {
        self.working.history.get(&job_id)
    }

    /// Installs the working copy; fails with a write conflict when a
    /// transaction committed since `begin` touched the same records.
    pub fn commit(self) -> Result<u64> {
        let revision = self.store.install(&self.base, self.working)?;
        debug!(revision, "metadata committed");
        Ok(revision)
    }

    fn schema_tables(&self, schema_id: i64) -> Result<&BTreeMap<i64, TableInfo>> {
        self.working
            .tables
            .get(&schema_id)
            .ok_or_else(|| DdlError::DatabaseNotExists(schema_id.to_string()).into())
    }

    fn schema_tables_mut(&mut self, schema_id: i64) -> Result<&mut BTreeMap<i64, TableInfo>> {
        if !self.working.schemas.contains_key(&schema_id) {
            return Err(DdlError::DatabaseNotExists(schema_id.to_string()).into());
        }
        Ok(self.working.tables.entry(schema_id).or_default())
    }
}

/// Loads the job's table, cancelling the job when the schema or table is gone.
/// Only public tables qualify.
pub fn get_table_info_and_cancel_fault_job(txn: &MetaTxn, job: &mut Job) -> Result<TableInfo> {
    let table = check_table_exist_and_cancel_non_exist_job(txn, job)?;
    if table.state != SchemaState::Public {
        job.state = JobState::Cancelled;
        return Err(DdlError::InvalidDdlState(format!("table {}", table.name), table.state).into());
    }
    Ok(table)
}

/// Loads the job's table in any state, cancelling the job when it is gone.
pub fn check_table_exist_and_cancel_non_exist_job(txn: &MetaTxn, job: &mut Job) -> Result<TableInfo> {
    if txn.get_schema(job.schema_id).is_none() {
        job.state = JobState::Cancelled;
        return Err(DdlError::DatabaseNotExists(job.schema_name.clone()).into());
    }
    match txn.get_table(job.schema_id, job.table_id) {
        Some(table) => Ok(table),
        None => {
            job.state = JobState::Cancelled;
            Err(DdlError::NoSuchTable(job.schema_name.clone(), job.table_name.clone()).into())
        }
    }
}

/// Writes `table` and, when asked, bumps the schema version. Returns the
/// version readers must reach to see the change.
pub fn update_version_and_table_info(
    txn: &mut MetaTxn,
    job: &Job,
    table: &mut TableInfo,
    should_update_version: bool,
) -> Result<i64> {
    let version = if should_update_version {
        txn.gen_schema_version()
    } else {
        txn.schema_version()
    };
    table.update_ts = now_millis();
    txn.update_table(job.schema_id, table.clone())
        .with_context(|| format!("update table {} for job {}", table.name, job.id))?;
    Ok(version)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
