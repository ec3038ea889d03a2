//! End-to-end schema-change jobs.
//!
//! Statement tests go through `Ddl` with a live worker. Owner tests drive
//! `run_one_step` by hand so each committed step can be inspected.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use common::{
    child_table, init_tracing, parent_table, unindexed_parent_table, StepHarness, SCHEMA,
};
use holo_ddl::scheduler::run_one_step;
use holo_ddl::{
    as_ddl_error, ColumnInfo, Ddl, DdlConfig, DdlError, FieldType, ForeignKeyInfo, HandlerRegistry,
    IndexInfo, Job, JobArgs, JobContext, JobHandler, JobState, JobType, MetaStore, SchemaState,
    StaticOwner,
};
use holo_session::scripted::ScriptedPool;
use holo_session::{Row, SqlResult, SqlValue};

async fn start_ddl(config: DdlConfig, is_owner: bool) -> Result<(Ddl, ScriptedPool, Arc<StaticOwner>)> {
    init_tracing();
    let store = MetaStore::in_memory();
    store.create_schema(SCHEMA)?;
    let pool = ScriptedPool::empty();
    let owner = Arc::new(StaticOwner::new(is_owner));
    let ddl = Ddl::start(store, Arc::new(config), Arc::new(pool.clone()), owner.clone())?;
    Ok((ddl, pool, owner))
}

fn fk1() -> ForeignKeyInfo {
    ForeignKeyInfo::new("fk1", &["a"], SCHEMA, "parent", &["b"])
}

fn last_job(ddl: &Ddl) -> Result<Job> {
    ddl.context()
        .store
        .snapshot()
        .history
        .values()
        .last()
        .cloned()
        .context("history is empty")
}

fn expect_ddl_error(result: Result<Job>) -> Result<DdlError> {
    match result {
        Ok(job) => Err(anyhow!("expected failure, job finished as {job}")),
        Err(err) => as_ddl_error(&err)
            .cloned()
            .with_context(|| format!("untyped error: {err:#}")),
    }
}

#[tokio::test]
async fn add_foreign_key_becomes_public_in_three_steps() -> Result<()> {
    let (ddl, pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    ddl.create_table(SCHEMA, parent_table(), true).await?;
    ddl.create_table(SCHEMA, child_table(), true).await?;
    let before = ddl.context().store.snapshot().schema_version;

    let job = ddl.add_foreign_key(SCHEMA, "child", fk1(), true).await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.schema_state, SchemaState::Public);
    assert_eq!(job.error, None);
    assert_eq!(ddl.context().store.snapshot().schema_version, before + 3);

    let child = ddl.context().info_cache.get_latest().table_by_name(SCHEMA, "child")?;
    let fk = child.find_foreign_key("FK1").context("fk1 present")?;
    assert_eq!(fk.state, SchemaState::Public);
    assert_eq!(fk.id, 1);
    assert_eq!(child.max_foreign_key_id, 1);
    assert_eq!(pool.statements_containing("NOT EXISTS").len(), 1);
    assert_eq!(pool.outstanding_sessions(), 0);

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_parent_index_cancels_job_in_owner() -> Result<()> {
    let h = StepHarness::new(DdlConfig::default())?;
    h.install_table(unindexed_parent_table())?;
    let child_id = h.install_table(child_table())?;
    let version = h.schema_version();
    let job_id = h.enqueue(
        child_id,
        "child",
        JobArgs::AddForeignKey {
            fk: fk1(),
            fk_check: true,
        },
    )?;

    assert!(run_one_step(&h.ctx, &HandlerRegistry::with_defaults()).await?);

    let job = h.history(job_id).context("job archived")?;
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(
        job.error,
        Some(DdlError::ForeignKeyNoIndexInParent("fk1".into(), "parent".into()))
    );
    assert_eq!(h.schema_version(), version);
    assert!(h.table(child_id).context("child")?.foreign_keys.is_empty());
    Ok(())
}

#[tokio::test]
async fn dropping_referenced_parent_is_rejected() -> Result<()> {
    let (ddl, _pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    ddl.create_table(SCHEMA, parent_table(), true).await?;
    ddl.create_table(SCHEMA, child_table().with_foreign_key(fk1()), true)
        .await?;

    let err = expect_ddl_error(ddl.drop_table(SCHEMA, "parent", true).await)?;
    assert_eq!(
        err,
        DdlError::TruncateIllegalForeignKey("`test`.`child` CONSTRAINT `fk1`".into())
    );
    let message = err.to_string();
    assert!(message.contains("child") && message.contains("fk1"), "{message}");
    assert_eq!(last_job(&ddl)?.state, JobState::Cancelled);
    assert!(ddl.context().info_cache.get_latest().table_exists(SCHEMA, "parent"));

    let job = ddl.drop_table(SCHEMA, "parent", false).await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.schema_state, SchemaState::None);
    assert!(!ddl.context().info_cache.get_latest().table_exists(SCHEMA, "parent"));

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn orphan_rows_roll_the_constraint_back() -> Result<()> {
    let (ddl, pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    ddl.create_table(SCHEMA, parent_table(), true).await?;
    ddl.create_table(SCHEMA, child_table(), true).await?;
    pool.set_responder(|sql, _| {
        if sql.contains("NOT EXISTS") {
            Ok(SqlResult::with_rows(vec![Row::new(vec![SqlValue::Int(1)])]))
        } else {
            Ok(SqlResult::default())
        }
    });
    let before = ddl.context().store.snapshot().schema_version;

    let err = expect_ddl_error(ddl.add_foreign_key(SCHEMA, "child", fk1(), true).await)?;
    assert_eq!(
        err,
        DdlError::NoReferencedRow(
            "`test`.`child`, CONSTRAINT `fk1` FOREIGN KEY (`a`) REFERENCES `test`.`parent` (`b`)".into()
        )
    );

    let job = last_job(&ddl)?;
    assert_eq!(job.state, JobState::RollbackDone);
    assert_eq!(job.schema_state, SchemaState::None);
    // One bump to stage the constraint, one to remove it.
    assert_eq!(ddl.context().store.snapshot().schema_version, before + 2);
    let child = ddl.context().info_cache.get_latest().table_by_name(SCHEMA, "child")?;
    assert!(child.foreign_keys.is_empty());

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn retried_first_step_does_not_allocate_twice() -> Result<()> {
    let h = StepHarness::new(DdlConfig::default())?;
    let handlers = HandlerRegistry::with_defaults();
    h.install_table(parent_table())?;
    let child_id = h.install_table(child_table())?;
    let job_id = h.enqueue(
        child_id,
        "child",
        JobArgs::AddForeignKey {
            fk: fk1(),
            fk_check: true,
        },
    )?;

    run_one_step(&h.ctx, &handlers).await?;
    let mut job = h.queued(job_id).context("job queued")?;
    assert_eq!(job.schema_state, SchemaState::WriteOnly);

    // Replay the first step against a stale job record.
    job.schema_state = SchemaState::None;
    let mut txn = h.ctx.store.begin();
    txn.update_job(&job)?;
    txn.commit()?;
    let version = h.schema_version();

    run_one_step(&h.ctx, &handlers).await?;
    let job = h.queued(job_id).context("job still queued")?;
    assert_eq!(job.schema_state, SchemaState::WriteOnly);
    assert_eq!(h.schema_version(), version);
    let child = h.table(child_id).context("child")?;
    assert_eq!(child.max_foreign_key_id, 1);
    assert_eq!(child.foreign_keys.len(), 1);

    run_one_step(&h.ctx, &handlers).await?;
    run_one_step(&h.ctx, &handlers).await?;
    let job = h.history(job_id).context("job archived")?;
    assert_eq!(job.state, JobState::Done);
    Ok(())
}

#[tokio::test]
async fn virtual_generated_parent_column_is_rejected() -> Result<()> {
    let (ddl, _pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    let parent = parent_table()
        .with_column(ColumnInfo::new("v", FieldType::int()).generated("b * 2", false))
        .with_column(ColumnInfo::new("s", FieldType::int()).generated("b * 3", true))
        .with_index(IndexInfo::new("idx_v", &["v"]))
        .with_index(IndexInfo::new("idx_s", &["s"]));
    ddl.create_table(SCHEMA, parent, true).await?;
    ddl.create_table(SCHEMA, child_table(), true).await?;

    let virtual_fk = ForeignKeyInfo::new("fk_v", &["a"], SCHEMA, "parent", &["v"]);
    let err = expect_ddl_error(ddl.add_foreign_key(SCHEMA, "child", virtual_fk, true).await)?;
    assert_eq!(
        err,
        DdlError::ForeignKeyCannotUseVirtualColumn("fk_v".into(), "v".into())
    );

    let stored_fk = ForeignKeyInfo::new("fk_s", &["a"], SCHEMA, "parent", &["s"]);
    let job = ddl.add_foreign_key(SCHEMA, "child", stored_fk, true).await?;
    assert_eq!(job.state, JobState::Done);

    ddl.shutdown().await;
    Ok(())
}

struct Recording {
    inner: Arc<dyn JobHandler>,
    seen: Arc<Mutex<Vec<(SchemaState, i64)>>>,
}

#[async_trait]
impl JobHandler for Recording {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let version = self.inner.run_step(ctx, job).await?;
        self.seen.lock().unwrap().push((job.schema_state, version));
        Ok(version)
    }
}

#[tokio::test]
async fn each_step_advances_one_state_and_one_version() -> Result<()> {
    let h = StepHarness::new(DdlConfig::default())?;
    h.install_table(parent_table())?;
    let child_id = h.install_table(child_table())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::with_defaults();
    let inner = handlers.get(JobType::AddForeignKey)?;
    handlers.register(
        JobType::AddForeignKey,
        Arc::new(Recording {
            inner,
            seen: seen.clone(),
        }),
    );
    let start = h.schema_version();
    let job_id = h.enqueue(
        child_id,
        "child",
        JobArgs::AddForeignKey {
            fk: fk1(),
            fk_check: true,
        },
    )?;

    while h.history(job_id).is_none() {
        assert!(run_one_step(&h.ctx, &handlers).await?);
    }

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (SchemaState::WriteOnly, start + 1),
            (SchemaState::WriteReorganization, start + 2),
            (SchemaState::Public, start + 3),
        ]
    );
    assert!(!run_one_step(&h.ctx, &handlers).await?);
    Ok(())
}

struct AlwaysFails;

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn run_step(&self, _ctx: &mut JobContext<'_>, _job: &mut Job) -> Result<i64> {
        Err(anyhow!("storage unavailable"))
    }
}

#[tokio::test]
async fn retry_budget_exhaustion_cancels_untouched_job() -> Result<()> {
    let h = StepHarness::new(DdlConfig::default().with_error_count_limit(2))?;
    let child_id = h.install_table(child_table())?;
    let mut handlers = HandlerRegistry::with_defaults();
    handlers.register(JobType::DropColumn, Arc::new(AlwaysFails));
    let job_id = h.enqueue(
        child_id,
        "child",
        JobArgs::DropColumn {
            column_name: "note".into(),
        },
    )?;

    for expected in 1..=2 {
        run_one_step(&h.ctx, &handlers).await?;
        let job = h.queued(job_id).context("job still queued")?;
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.error_count, expected);
    }
    run_one_step(&h.ctx, &handlers).await?;
    let job = h.history(job_id).context("job archived")?;
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.error, Some(DdlError::Internal("storage unavailable".into())));
    Ok(())
}

#[tokio::test]
async fn lost_ownership_abandons_row_check() -> Result<()> {
    let h = StepHarness::new(DdlConfig::default())?;
    h.install_table(parent_table())?;
    let child_id = h.install_table(child_table())?;
    let job_id = h.enqueue(
        child_id,
        "child",
        JobArgs::AddForeignKey {
            fk: fk1(),
            fk_check: true,
        },
    )?;
    let handlers = HandlerRegistry::with_defaults();
    run_one_step(&h.ctx, &handlers).await?;
    let version = h.schema_version();

    h.owner.set_owner(false);
    run_one_step(&h.ctx, &handlers).await?;

    let job = h.queued(job_id).context("job still queued")?;
    assert_eq!(job.schema_state, SchemaState::WriteOnly);
    assert_eq!(job.error_count, 0);
    assert_eq!(h.schema_version(), version);
    assert_eq!(h.pool.outstanding_sessions(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn enqueue_during_row_check_does_not_abandon_the_step() -> Result<()> {
    let h = StepHarness::new(DdlConfig::default())?;
    h.install_table(parent_table())?;
    let child_id = h.install_table(child_table())?;
    let job_id = h.enqueue(
        child_id,
        "child",
        JobArgs::AddForeignKey {
            fk: fk1(),
            fk_check: true,
        },
    )?;
    let handlers = HandlerRegistry::with_defaults();
    run_one_step(&h.ctx, &handlers).await?;
    let version = h.schema_version();
    h.pool.delay_statements("NOT EXISTS", Duration::from_secs(5));

    let submit = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.enqueue(999, "other", JobArgs::DropTable { fk_check: true })
    };
    let (stepped, other_id) = tokio::join!(run_one_step(&h.ctx, &handlers), submit);
    assert!(stepped?);
    let other_id = other_id?;

    let job = h.queued(job_id).context("job still queued")?;
    assert_eq!(job.schema_state, SchemaState::WriteReorganization);
    assert_eq!(h.schema_version(), version + 1);
    assert_eq!(h.queued(other_id).context("new job queued")?.state, JobState::Queued);
    assert_eq!(h.pool.statements_containing("NOT EXISTS").len(), 1);
    Ok(())
}

#[tokio::test]
async fn worker_waits_for_ownership() -> Result<()> {
    let (ddl, _pool, owner) = start_ddl(DdlConfig::default(), false).await?;
    let pending = tokio::time::timeout(
        Duration::from_millis(200),
        ddl.create_table(SCHEMA, parent_table(), true),
    )
    .await;
    assert!(pending.is_err(), "job must not run without ownership");
    let job_id = *ddl
        .context()
        .store
        .snapshot()
        .jobs
        .keys()
        .next()
        .context("job queued")?;

    owner.set_owner(true);
    let job = tokio::time::timeout(Duration::from_secs(5), ddl.context().wait_job_done(job_id))
        .await
        .context("job finished after ownership was granted")?;
    assert_eq!(job.state, JobState::Done);

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn indexes_and_columns_used_by_constraints_are_protected() -> Result<()> {
    let (ddl, _pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    ddl.create_table(SCHEMA, parent_table(), true).await?;
    ddl.create_table(SCHEMA, child_table().with_foreign_key(fk1()), true)
        .await?;

    assert_eq!(
        expect_ddl_error(ddl.drop_index(SCHEMA, "child", "idx_a").await)?,
        DdlError::DropIndexNeededInForeignKey("idx_a".into())
    );
    assert_eq!(
        expect_ddl_error(ddl.drop_index(SCHEMA, "parent", "idx_b").await)?,
        DdlError::DropIndexNeededInForeignKey("idx_b".into())
    );
    assert_eq!(
        expect_ddl_error(ddl.drop_column(SCHEMA, "child", "a").await)?,
        DdlError::ForeignKeyColumnCannotDrop("a".into(), "fk1".into())
    );
    assert_eq!(
        expect_ddl_error(ddl.drop_column(SCHEMA, "parent", "b").await)?,
        DdlError::ForeignKeyColumnCannotDropChild("b".into(), "fk1".into(), "child".into())
    );

    let before = ddl.context().store.snapshot().schema_version;
    let job = ddl.drop_column(SCHEMA, "child", "note").await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(ddl.context().store.snapshot().schema_version, before + 3);

    ddl.drop_foreign_key(SCHEMA, "child", "fk1").await?;
    let job = ddl.drop_index(SCHEMA, "child", "idx_a").await?;
    assert_eq!(job.state, JobState::Done);
    let child = ddl.context().info_cache.get_latest().table_by_name(SCHEMA, "child")?;
    assert!(child.find_index("idx_a").is_none());
    assert!(child.find_column("note").is_none());

    assert_eq!(
        expect_ddl_error(ddl.drop_foreign_key(SCHEMA, "child", "fk1").await)?,
        DdlError::CantDropFieldOrKey("fk1".into())
    );

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn truncate_keeps_self_references_and_blocks_parents() -> Result<()> {
    let (ddl, _pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    ddl.create_table(SCHEMA, parent_table(), true).await?;
    let child = child_table()
        .with_column(ColumnInfo::new("up", FieldType::bigint()))
        .with_index(IndexInfo::new("idx_up", &["up"]))
        .with_foreign_key(fk1())
        .with_foreign_key(ForeignKeyInfo::new("fk_self", &["up"], SCHEMA, "child", &["id"]));
    ddl.create_table(SCHEMA, child, true).await?;

    assert!(matches!(
        expect_ddl_error(ddl.truncate_table(SCHEMA, "parent", true).await)?,
        DdlError::TruncateIllegalForeignKey(_)
    ));

    let old_id = ddl.context().info_cache.get_latest().table_by_name(SCHEMA, "child")?.id;
    ddl.truncate_table(SCHEMA, "child", true).await?;
    let child = ddl.context().info_cache.get_latest().table_by_name(SCHEMA, "child")?;
    assert_ne!(child.id, old_id);
    assert_eq!(child.foreign_keys.len(), 2);

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn create_table_checks_declared_constraints() -> Result<()> {
    let (ddl, _pool, _owner) = start_ddl(DdlConfig::default(), true).await?;

    assert_eq!(
        expect_ddl_error(
            ddl.create_table(SCHEMA, child_table().with_foreign_key(fk1()), true)
                .await
        )?,
        DdlError::ForeignKeyCannotOpenParent("parent".into())
    );
    assert_eq!(last_job(&ddl)?.state, JobState::Cancelled);

    let job = ddl
        .create_table(SCHEMA, child_table().with_foreign_key(fk1()), false)
        .await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(
        expect_ddl_error(ddl.create_table(SCHEMA, child_table(), true).await)?,
        DdlError::TableExists("child".into())
    );

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disabled_foreign_keys_skip_validation() -> Result<()> {
    let (ddl, pool, _owner) = start_ddl(DdlConfig::default(), true).await?;
    ddl.context().config.set_foreign_key_enabled(false);
    ddl.create_table(SCHEMA, unindexed_parent_table(), true).await?;
    ddl.create_table(SCHEMA, child_table(), true).await?;

    let job = ddl.add_foreign_key(SCHEMA, "child", fk1(), true).await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(pool.statements_containing("NOT EXISTS").len(), 1);

    ddl.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn file_backed_history_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("meta.json");
    let job_id = {
        let store = MetaStore::open(&path)?;
        store.create_schema(SCHEMA)?;
        let ddl = Ddl::start(
            store,
            Arc::new(DdlConfig::default()),
            Arc::new(ScriptedPool::empty()),
            Arc::new(StaticOwner::new(true)),
        )?;
        let job = ddl.create_table(SCHEMA, parent_table(), true).await?;
        ddl.shutdown().await;
        job.id
    };

    let reopened = MetaStore::open(&path)?;
    let snapshot = reopened.snapshot();
    assert_eq!(
        snapshot.history.get(&job_id).map(|job| job.state),
        Some(JobState::Done)
    );
    assert_eq!(snapshot.ddl_table_version, 1);
    Ok(())
}
