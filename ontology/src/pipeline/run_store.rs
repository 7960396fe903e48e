//! Persisted `pipeline_run` / `run_stage` records.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use uuid::Uuid;

use super::StageKind;
use crate::entity::{pipeline_run, run_stage};
use crate::error::{OntologyError, is_unique_violation};
use crate::model::{RunStatus, StageStatus};

const ACTIVE_SLOT: &str = "running";

/// A run and its stages in execution order.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run: pipeline_run::Model,
    pub stages: Vec<run_stage::Model>,
}

/// Claim the single running slot for (project, data source) and create the
/// run with one pending row per stage. A second concurrent start fails with
/// `Conflict`.
pub async fn start_run<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    project_id: Uuid,
    data_source_id: Uuid,
    stages: &[StageKind],
) -> Result<RunView, OntologyError> {
    let txn = db.begin().await?;
    let now = Utc::now().naive_utc();

    let inserted = pipeline_run::ActiveModel {
        id: Set(Uuid::now_v7()),
        project_id: Set(project_id),
        data_source_id: Set(data_source_id),
        status: Set(RunStatus::Running.as_str().to_string()),
        current_stage: Set(None),
        degraded: Set(false),
        active_slot: Set(Some(ACTIVE_SLOT.to_string())),
        failed_stage: Set(None),
        error: Set(None),
        started_at: Set(now),
        completed_at: Set(None),
    }
    .insert(&txn)
    .await;

    let run = match inserted {
        Ok(run) => run,
        Err(e) if is_unique_violation(&e) => {
            return Err(OntologyError::Conflict(format!(
                "a build is already running for data source {data_source_id}"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let mut rows = Vec::with_capacity(stages.len());
    for (ordinal, stage) in stages.iter().enumerate() {
        rows.push(
            run_stage::ActiveModel {
                id: Set(Uuid::now_v7()),
                run_id: Set(run.id),
                stage: Set(stage.as_str().to_string()),
                ordinal: Set(ordinal as i32),
                status: Set(StageStatus::Pending.as_str().to_string()),
                done: Set(0),
                total: Set(0),
                message: Set(None),
                error: Set(None),
                started_at: Set(None),
                completed_at: Set(None),
            }
            .insert(&txn)
            .await?,
        );
    }

    txn.commit().await?;
    Ok(RunView { run, stages: rows })
}

async fn find_stage<C: ConnectionTrait>(db: &C, stage_id: Uuid) -> Result<run_stage::Model, OntologyError> {
    run_stage::Entity::find_by_id(stage_id)
        .one(db)
        .await?
        .ok_or_else(|| OntologyError::NotFound(format!("run stage {stage_id}")))
}

async fn find_run<C: ConnectionTrait>(db: &C, run_id: Uuid) -> Result<pipeline_run::Model, OntologyError> {
    pipeline_run::Entity::find_by_id(run_id)
        .one(db)
        .await?
        .ok_or_else(|| OntologyError::NotFound(format!("pipeline run {run_id}")))
}

pub async fn begin_stage<C: ConnectionTrait>(
    db: &C,
    run_id: Uuid,
    stage_id: Uuid,
    stage: StageKind,
) -> Result<(), OntologyError> {
    let now = Utc::now().naive_utc();
    let mut active: run_stage::ActiveModel = find_stage(db, stage_id).await?.into();
    active.status = Set(StageStatus::Running.as_str().to_string());
    active.started_at = Set(Some(now));
    active.update(db).await?;

    let mut run: pipeline_run::ActiveModel = find_run(db, run_id).await?.into();
    run.current_stage = Set(Some(stage.as_str().to_string()));
    run.update(db).await?;
    Ok(())
}

/// Store already-clamped progress.
pub async fn update_progress<C: ConnectionTrait>(
    db: &C,
    stage_id: Uuid,
    done: i64,
    total: i64,
    message: Option<String>,
) -> Result<(), OntologyError> {
    let mut active: run_stage::ActiveModel = find_stage(db, stage_id).await?.into();
    active.done = Set(done);
    active.total = Set(total);
    if message.is_some() {
        active.message = Set(message);
    }
    active.update(db).await?;
    Ok(())
}

pub async fn finish_stage<C: ConnectionTrait>(
    db: &C,
    stage_id: Uuid,
    status: StageStatus,
    message: Option<String>,
    error: Option<String>,
) -> Result<(), OntologyError> {
    let mut active: run_stage::ActiveModel = find_stage(db, stage_id).await?.into();
    active.status = Set(status.as_str().to_string());
    if message.is_some() {
        active.message = Set(message);
    }
    active.error = Set(error);
    active.completed_at = Set(Some(Utc::now().naive_utc()));
    active.update(db).await?;
    Ok(())
}

/// Mark every still-pending stage of a run skipped.
pub async fn skip_pending<C: ConnectionTrait>(db: &C, run_id: Uuid) -> Result<usize, OntologyError> {
    let pending = run_stage::Entity::find()
        .filter(run_stage::Column::RunId.eq(run_id))
        .filter(run_stage::Column::Status.eq(StageStatus::Pending.as_str()))
        .all(db)
        .await?;
    let count = pending.len();
    for stage in pending {
        let mut active: run_stage::ActiveModel = stage.into();
        active.status = Set(StageStatus::Skipped.as_str().to_string());
        active.update(db).await?;
    }
    Ok(count)
}

/// Close a run and release its running slot.
pub async fn finish_run<C: ConnectionTrait>(
    db: &C,
    run_id: Uuid,
    status: RunStatus,
    degraded: bool,
    failed_stage: Option<StageKind>,
    error: Option<String>,
) -> Result<pipeline_run::Model, OntologyError> {
    let mut active: pipeline_run::ActiveModel = find_run(db, run_id).await?.into();
    active.status = Set(status.as_str().to_string());
    active.degraded = Set(degraded);
    active.active_slot = Set(None);
    active.current_stage = Set(None);
    active.failed_stage = Set(failed_stage.map(|s| s.as_str().to_string()));
    active.error = Set(error);
    active.completed_at = Set(Some(Utc::now().naive_utc()));
    Ok(active.update(db).await?)
}

pub async fn load_run<C: ConnectionTrait>(db: &C, run_id: Uuid) -> Result<Option<RunView>, OntologyError> {
    let Some(run) = pipeline_run::Entity::find_by_id(run_id).one(db).await? else {
        return Ok(None);
    };
    let stages = run_stage::Entity::find()
        .filter(run_stage::Column::RunId.eq(run.id))
        .order_by_asc(run_stage::Column::Ordinal)
        .all(db)
        .await?;
    Ok(Some(RunView { run, stages }))
}

/// Most recently started run for a data source.
pub async fn latest_run<C: ConnectionTrait>(
    db: &C,
    data_source_id: Uuid,
) -> Result<Option<RunView>, OntologyError> {
    let latest = pipeline_run::Entity::find()
        .filter(pipeline_run::Column::DataSourceId.eq(data_source_id))
        .order_by_desc(pipeline_run::Column::StartedAt)
        .order_by_desc(pipeline_run::Column::Id)
        .one(db)
        .await?;
    match latest {
        Some(run) => load_run(db, run.id).await,
        None => Ok(None),
    }
}
