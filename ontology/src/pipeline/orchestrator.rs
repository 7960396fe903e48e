use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::RunRegistry;
use super::run_store;
use super::{FailurePolicy, Progress, ProgressUpdate, RunContext, RunEvent, Services, Stage, StageKind};
use crate::datasource::QueryExecutor;
use crate::entity::data_source;
use crate::error::OntologyError;
use crate::model::{RunStatus, StageStatus};
use crate::precedence::Writer;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub degraded: bool,
    pub failed_stage: Option<StageKind>,
    pub error: Option<String>,
}

/// Runs stages strictly in order. Stage order is checked against declared
/// dependencies at construction.
pub struct Orchestrator {
    stages: Vec<Box<dyn Stage>>,
    registry: Arc<RunRegistry>,
}

impl Orchestrator {
    pub fn new(stages: Vec<Box<dyn Stage>>, registry: Arc<RunRegistry>) -> Result<Self, OntologyError> {
        let mut seen = HashSet::new();
        for stage in &stages {
            let kind = stage.kind();
            for dep in stage.depends_on() {
                if !seen.contains(dep) {
                    return Err(OntologyError::Configuration(format!(
                        "stage {kind} depends on {dep}, which does not run before it"
                    )));
                }
            }
            if !seen.insert(kind) {
                return Err(OntologyError::Configuration(format!("stage {kind} is listed twice")));
            }
        }
        Ok(Self { stages, registry })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Execute a full build for one data source.
    ///
    /// Returns `Conflict` if a run is already active for the same project and
    /// data source. Any other failure is reported in the [`RunOutcome`] and
    /// persisted on the run.
    pub async fn run(
        &self,
        services: Services,
        executor: Arc<dyn QueryExecutor>,
        project_id: Uuid,
        data_source: data_source::Model,
        writer: Writer,
    ) -> Result<RunOutcome, OntologyError> {
        let kinds = self.stage_kinds();
        let view = run_store::start_run(&services.db, project_id, data_source.id, &kinds).await?;
        let run_id = view.run.id;
        let stage_rows: HashMap<String, Uuid> =
            view.stages.iter().map(|s| (s.stage.clone(), s.id)).collect();

        let handle = self.registry.register(run_id, data_source.id);
        tracing::info!(
            run_id = %run_id,
            project_id = %project_id,
            data_source_id = %data_source.id,
            stages = kinds.len(),
            "build started"
        );

        let ctx = RunContext {
            services,
            executor,
            run_id,
            project_id,
            data_source,
            writer,
            cancel: handle.cancel.clone(),
        };

        let result = self.execute_stages(&ctx, &stage_rows, &handle.tx).await;
        self.registry.remove(run_id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                // The metadata store itself failed; try to release the slot.
                tracing::error!(run_id = %run_id, error = %e, "build aborted");
                let _ = run_store::skip_pending(ctx.db(), run_id).await;
                let _ = run_store::finish_run(ctx.db(), run_id, RunStatus::Failed, false, None, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let _ = handle.tx.send(RunEvent::Finished {
            status: outcome.status.as_str().to_string(),
            degraded: outcome.degraded,
            error: outcome.error.clone(),
        });
        tracing::info!(
            run_id = %run_id,
            status = outcome.status.as_str(),
            degraded = outcome.degraded,
            "build finished"
        );
        Ok(outcome)
    }

    async fn execute_stages(
        &self,
        ctx: &RunContext,
        stage_rows: &HashMap<String, Uuid>,
        events: &tokio::sync::broadcast::Sender<RunEvent>,
    ) -> Result<RunOutcome, OntologyError> {
        let db = ctx.db();
        let run_id = ctx.run_id;
        let mut finished: HashMap<StageKind, StageStatus> = HashMap::new();
        let mut degraded = false;
        let mut failure: Option<(StageKind, String)> = None;

        for stage in &self.stages {
            let kind = stage.kind();
            let stage_id = stage_rows
                .get(kind.as_str())
                .copied()
                .ok_or_else(|| OntologyError::NotFound(format!("stage row {kind} for run {run_id}")))?;

            if ctx.cancel.is_cancelled() {
                failure = Some((kind, "cancelled".to_string()));
                run_store::finish_stage(db, stage_id, StageStatus::Failed, None, Some("cancelled".into())).await?;
                break;
            }

            let blocked = stage
                .depends_on()
                .iter()
                .find(|dep| !finished.get(*dep).is_some_and(|s| s.satisfies_dependency()));
            if let Some(dep) = blocked {
                tracing::warn!(run_id = %run_id, stage = %kind, dependency = %dep, "dependency not satisfied, skipping");
                run_store::finish_stage(
                    db,
                    stage_id,
                    StageStatus::Skipped,
                    Some(format!("dependency {dep} did not complete")),
                    None,
                )
                .await?;
                finished.insert(kind, StageStatus::Skipped);
                continue;
            }

            run_store::begin_stage(db, run_id, stage_id, kind).await?;
            let _ = events.send(RunEvent::StageStarted { stage: kind });
            tracing::info!(run_id = %run_id, stage = %kind, "stage started");

            let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<ProgressUpdate>();
            let persist_db = db.clone();
            let persister = tokio::spawn(async move {
                while let Some(update) = persist_rx.recv().await {
                    if let Err(e) =
                        run_store::update_progress(&persist_db, stage_id, update.done, update.total, update.message)
                            .await
                    {
                        tracing::warn!(stage = %kind, error = %e, "failed to persist progress");
                    }
                }
            });

            let progress = Progress::new(kind, events.clone(), Some(persist_tx));
            let result = stage.execute(ctx, &progress).await;
            drop(progress);
            let _ = persister.await;

            let (status, message, error) = match result {
                Ok(report) => {
                    let status = if report.failed_items > 0 {
                        degraded = true;
                        tracing::warn!(
                            run_id = %run_id,
                            stage = %kind,
                            failed_items = report.failed_items,
                            "stage completed with failed items"
                        );
                        StageStatus::Degraded
                    } else {
                        StageStatus::Completed
                    };
                    tracing::info!(run_id = %run_id, stage = %kind, summary = %report.summary, "stage finished");
                    (status, Some(report.summary), None)
                }
                Err(e) if e.is_cancelled() => {
                    tracing::info!(run_id = %run_id, stage = %kind, "stage cancelled");
                    failure = Some((kind, "cancelled".to_string()));
                    (StageStatus::Failed, None, Some("cancelled".to_string()))
                }
                Err(e) if !e.is_fatal() && stage.failure_policy() == FailurePolicy::DegradeOnNonFatal => {
                    degraded = true;
                    tracing::warn!(run_id = %run_id, stage = %kind, error = %e, "stage degraded");
                    (StageStatus::Degraded, None, Some(e.to_string()))
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, stage = %kind, error = %e, "stage failed");
                    failure = Some((kind, e.to_string()));
                    (StageStatus::Failed, None, Some(e.to_string()))
                }
            };

            run_store::finish_stage(db, stage_id, status, message, error.clone()).await?;
            let _ = events.send(RunEvent::StageFinished {
                stage: kind,
                status: status.as_str().to_string(),
                error,
            });
            finished.insert(kind, status);

            if failure.is_some() {
                break;
            }
        }

        let outcome = match failure {
            Some((stage, error)) => {
                let skipped = run_store::skip_pending(db, run_id).await?;
                tracing::info!(run_id = %run_id, skipped, "remaining stages skipped");
                RunOutcome {
                    run_id,
                    status: RunStatus::Failed,
                    degraded,
                    failed_stage: Some(stage),
                    error: Some(error),
                }
            }
            None => RunOutcome {
                run_id,
                status: RunStatus::Completed,
                degraded,
                failed_stage: None,
                error: None,
            },
        };

        run_store::finish_run(
            db,
            run_id,
            outcome.status,
            outcome.degraded,
            outcome.failed_stage,
            outcome.error.clone(),
        )
        .await?;
        Ok(outcome)
    }
}
