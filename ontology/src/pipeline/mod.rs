//! Full ontology build: an ordered list of stages with declared
//! dependencies and a failure policy per stage.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::datasource::QueryExecutor;
use crate::entity::data_source;
use crate::error::OntologyError;
use crate::precedence::Writer;
use crate::semantic::SemanticClient;

pub mod orchestrator;
pub mod registry;
pub mod run_store;
pub mod stages;

pub use orchestrator::{Orchestrator, RunOutcome};
pub use registry::RunRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    SchemaSnapshot,
    KnowledgeSeed,
    ColumnFeatures,
    ConstraintRelationships,
    TableFeatures,
    InferredRelationships,
    ColumnEnrichment,
    TableEnrichment,
    Finalization,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::SchemaSnapshot => "schema_snapshot",
            StageKind::KnowledgeSeed => "knowledge_seed",
            StageKind::ColumnFeatures => "column_features",
            StageKind::ConstraintRelationships => "constraint_relationships",
            StageKind::TableFeatures => "table_features",
            StageKind::InferredRelationships => "inferred_relationships",
            StageKind::ColumnEnrichment => "column_enrichment",
            StageKind::TableEnrichment => "table_enrichment",
            StageKind::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Any error aborts the run.
    FailFast,
    /// Non-fatal errors mark the stage degraded and the run continues.
    DegradeOnNonFatal,
}

/// What a stage reports on success.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub summary: String,
    /// Items that failed individually; non-zero completes the stage degraded.
    pub failed_items: usize,
}

impl StageReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            failed_items: 0,
        }
    }

    pub fn with_failures(mut self, failed_items: usize) -> Self {
        self.failed_items = failed_items;
        self
    }
}

/// Long-lived collaborators shared by every run.
#[derive(Clone)]
pub struct Services {
    pub db: DatabaseConnection,
    pub semantic: Arc<dyn SemanticClient>,
    pub analysis: AnalysisConfig,
    pub knowledge_seed_path: Option<PathBuf>,
}

/// Everything a stage may touch during one run.
pub struct RunContext {
    pub services: Services,
    pub executor: Arc<dyn QueryExecutor>,
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub data_source: data_source::Model,
    /// Provenance for facts the pipeline infers.
    pub writer: Writer,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn db(&self) -> &DatabaseConnection {
        &self.services.db
    }

    pub fn analysis(&self) -> &AnalysisConfig {
        &self.services.analysis
    }

    pub fn data_source_id(&self) -> Uuid {
        self.data_source.id
    }

    pub fn check_cancelled(&self) -> Result<(), OntologyError> {
        if self.cancel.is_cancelled() {
            Err(OntologyError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Stages that must have completed (or completed degraded) first.
    fn depends_on(&self) -> &'static [StageKind];

    fn failure_policy(&self) -> FailurePolicy;

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError>;
}

// ---------- progress ----------

/// Events broadcast to in-process subscribers of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StageStarted {
        stage: StageKind,
    },
    Progress {
        stage: StageKind,
        done: i64,
        total: i64,
        message: Option<String>,
    },
    StageFinished {
        stage: StageKind,
        status: String,
        error: Option<String>,
    },
    Finished {
        status: String,
        degraded: bool,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub done: i64,
    pub total: i64,
    pub message: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    done: i64,
    total: i64,
}

/// Stage progress reporter. Values never go backwards: `done` and `total`
/// are clamped to at least their previous values and `total >= done`.
pub struct Progress {
    stage: StageKind,
    counters: Mutex<Counters>,
    events: broadcast::Sender<RunEvent>,
    persist: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl Progress {
    pub fn new(
        stage: StageKind,
        events: broadcast::Sender<RunEvent>,
        persist: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Self {
        Self {
            stage,
            counters: Mutex::new(Counters::default()),
            events,
            persist,
        }
    }

    /// Progress that goes nowhere; for stages run outside an orchestrator.
    pub fn detached(stage: StageKind) -> Self {
        let (events, _) = broadcast::channel(1);
        Self::new(stage, events, None)
    }

    pub fn report(&self, done: usize, total: usize, message: Option<&str>) -> ProgressUpdate {
        let update = {
            let mut c = self.counters.lock().unwrap_or_else(|p| p.into_inner());
            c.done = c.done.max(done as i64);
            c.total = c.total.max(total as i64).max(c.done);
            ProgressUpdate {
                done: c.done,
                total: c.total,
                message: message.map(str::to_string),
            }
        };
        if let Some(tx) = &self.persist {
            let _ = tx.send(update.clone());
        }
        let _ = self.events.send(RunEvent::Progress {
            stage: self.stage,
            done: update.done,
            total: update.total,
            message: update.message.clone(),
        });
        update
    }

    pub fn current(&self) -> (i64, i64) {
        let c = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        (c.done, c.total)
    }
}
