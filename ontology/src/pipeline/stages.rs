//! The stages of a full build, in execution order.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, Set};

use super::{FailurePolicy, Progress, RunContext, Stage, StageKind, StageReport};
use crate::catalog::{self, Catalog};
use crate::datasource::DatasourceError;
use crate::enrichment;
use crate::error::OntologyError;
use crate::features;
use crate::model::Source;
use crate::precedence::Writer;
use crate::relationships;
use crate::seed;

/// Every stage in dependency order.
pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(SchemaSnapshot),
        Box::new(KnowledgeSeed),
        Box::new(ColumnFeatures),
        Box::new(ConstraintRelationships),
        Box::new(TableFeatures),
        Box::new(InferredRelationships),
        Box::new(ColumnEnrichment),
        Box::new(TableEnrichment),
        Box::new(Finalization),
    ]
}

fn reporter(progress: &Progress) -> impl Fn(usize, usize) + Send + Sync + '_ {
    move |done, total| {
        progress.report(done, total, None);
    }
}

// ---------- schema_snapshot ----------

pub struct SchemaSnapshot;

#[async_trait::async_trait]
impl Stage for SchemaSnapshot {
    fn kind(&self) -> StageKind {
        StageKind::SchemaSnapshot
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailFast
    }

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError> {
        let sample_limit = ctx.analysis().sample_limit;
        let tables = ctx.executor.list_tables(&ctx.cancel).await?;
        let total = tables.len();
        progress.report(0, total, Some("profiling tables"));

        let mut live = Vec::with_capacity(total);
        let mut unprofiled = 0;
        for (i, table) in tables.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let names: Vec<String> = table.columns.iter().map(|c| c.column_name.clone()).collect();
            let profile = match ctx
                .executor
                .table_profile(&table.table, &names, sample_limit, &ctx.cancel)
                .await
            {
                Ok(p) => Some(p),
                Err(DatasourceError::Query(msg)) => {
                    tracing::warn!(
                        table = %table.table.qualified_name(),
                        error = %msg,
                        "Table profile failed, keeping shape only"
                    );
                    unprofiled += 1;
                    None
                }
                Err(e) => return Err(e.into()),
            };
            live.push((table, profile));
            progress.report(i + 1, total, None);
        }

        let summary =
            catalog::persist_snapshot(ctx.db(), ctx.project_id, ctx.data_source_id(), &live, sample_limit).await?;
        Ok(StageReport::new(format!(
            "{} tables, {} columns, {} tables removed",
            summary.tables, summary.columns, summary.removed_tables
        ))
        .with_failures(unprofiled))
    }
}

// ---------- knowledge_seed ----------

pub struct KnowledgeSeed;

#[async_trait::async_trait]
impl Stage for KnowledgeSeed {
    fn kind(&self) -> StageKind {
        StageKind::KnowledgeSeed
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::SchemaSnapshot]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::DegradeOnNonFatal
    }

    async fn execute(&self, ctx: &RunContext, _progress: &Progress) -> Result<StageReport, OntologyError> {
        let Some(path) = &ctx.services.knowledge_seed_path else {
            return Ok(StageReport::new("no knowledge seed configured"));
        };
        let knowledge = seed::load(path).await?;
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let writer = Writer::new(Source::Manual, "knowledge_seed");
        let summary = seed::apply(ctx.db(), &catalog, ctx.project_id, ctx.data_source_id(), &knowledge, &writer).await?;
        for name in &summary.unresolved {
            tracing::warn!(object = %name, "Knowledge seed names an object missing from the snapshot");
        }
        Ok(StageReport::new(format!(
            "{} facts written, {} skipped, {} unresolved",
            summary.written,
            summary.skipped,
            summary.unresolved.len()
        ))
        .with_failures(summary.unresolved.len()))
    }
}

// ---------- column_features ----------

pub struct ColumnFeatures;

#[async_trait::async_trait]
impl Stage for ColumnFeatures {
    fn kind(&self) -> StageKind {
        StageKind::ColumnFeatures
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::SchemaSnapshot, StageKind::KnowledgeSeed]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::DegradeOnNonFatal
    }

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError> {
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let total = catalog.tables.len();
        let mut written = 0;
        for (i, table) in catalog.tables.iter().enumerate() {
            ctx.check_cancelled()?;
            written += features::write_column_features(ctx.db(), table, None, ctx.analysis(), &ctx.writer).await?;
            progress.report(i + 1, total, None);
        }
        Ok(StageReport::new(format!(
            "{written} of {} column roles written",
            catalog.column_count()
        )))
    }
}

// ---------- constraint_relationships ----------

pub struct ConstraintRelationships;

#[async_trait::async_trait]
impl Stage for ConstraintRelationships {
    fn kind(&self) -> StageKind {
        StageKind::ConstraintRelationships
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::ColumnFeatures]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailFast
    }

    async fn execute(&self, ctx: &RunContext, _progress: &Progress) -> Result<StageReport, OntologyError> {
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let summary = relationships::record_constraint_relationships(
            ctx.db(),
            ctx.executor.as_ref(),
            &catalog,
            ctx.project_id,
            ctx.data_source_id(),
            ctx.analysis().trusted_link_confidence,
            &ctx.writer,
            &ctx.cancel,
        )
        .await?;
        Ok(StageReport::new(format!(
            "{} constraint relationships, {} left to higher-precedence owners",
            summary.accepted, summary.skipped
        )))
    }
}

// ---------- table_features ----------

pub struct TableFeatures;

#[async_trait::async_trait]
impl Stage for TableFeatures {
    fn kind(&self) -> StageKind {
        StageKind::TableFeatures
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::ColumnFeatures, StageKind::ConstraintRelationships]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::DegradeOnNonFatal
    }

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError> {
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let total = catalog.tables.len();
        let mut written = 0;
        for (i, table) in catalog.tables.iter().enumerate() {
            ctx.check_cancelled()?;
            if features::write_table_features(ctx.db(), table, &ctx.writer).await?.is_written() {
                written += 1;
            }
            progress.report(i + 1, total, None);
        }
        Ok(StageReport::new(format!("{written} of {total} table roles written")))
    }
}

// ---------- inferred_relationships ----------

pub struct InferredRelationships;

#[async_trait::async_trait]
impl Stage for InferredRelationships {
    fn kind(&self) -> StageKind {
        StageKind::InferredRelationships
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::ConstraintRelationships, StageKind::ColumnFeatures]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::DegradeOnNonFatal
    }

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError> {
        let cfg = ctx.analysis();
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let roles = relationships::column_roles(ctx.db(), &catalog).await?;
        let settled = relationships::settled_pairs(ctx.db(), ctx.data_source_id()).await?;

        progress.report(0, 0, Some("measuring candidate pairs"));
        let candidates = relationships::collect_candidates(
            ctx.executor.as_ref(),
            &catalog,
            &roles,
            &settled,
            cfg.sample_limit,
            &ctx.cancel,
            &reporter(progress),
        )
        .await?;

        // Validation continues the same counter after the measured pairs.
        let (offset, _) = progress.current();
        let offset = offset as usize;
        progress.report(offset, offset + candidates.len(), Some("validating candidates"));
        let on_validated = move |done: usize, total: usize| {
            progress.report(offset + done, offset + total, None);
        };
        let batch = relationships::validate_all(
            ctx.services.semantic.as_ref(),
            candidates,
            cfg.validation_workers,
            cfg.min_confidence,
            &ctx.cancel,
            &on_validated,
        )
        .await?;

        let summary = relationships::persist_validated(
            ctx.db(),
            ctx.project_id,
            ctx.data_source_id(),
            &batch.results,
            &ctx.writer,
        )
        .await?;
        if batch.cancelled {
            tracing::info!(persisted = batch.results.len(), "Validation cancelled after partial results");
            return Err(OntologyError::Cancelled);
        }

        Ok(StageReport::new(format!(
            "{} accepted, {} rejected, {} left to higher-precedence owners",
            summary.accepted, summary.rejected, summary.skipped
        ))
        .with_failures(batch.errored))
    }
}

// ---------- column_enrichment ----------

pub struct ColumnEnrichment;

#[async_trait::async_trait]
impl Stage for ColumnEnrichment {
    fn kind(&self) -> StageKind {
        StageKind::ColumnEnrichment
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::InferredRelationships]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::DegradeOnNonFatal
    }

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError> {
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let summary = enrichment::enrich_columns(
            ctx.db(),
            ctx.services.semantic.as_ref(),
            &catalog,
            &ctx.writer,
            ctx.analysis().sample_limit,
            &ctx.cancel,
            &reporter(progress),
        )
        .await?;
        Ok(StageReport::new(format!(
            "{} columns annotated, {} kept, {} failed",
            summary.written, summary.skipped, summary.failed
        ))
        .with_failures(summary.failed))
    }
}

// ---------- table_enrichment ----------

pub struct TableEnrichment;

#[async_trait::async_trait]
impl Stage for TableEnrichment {
    fn kind(&self) -> StageKind {
        StageKind::TableEnrichment
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::TableFeatures, StageKind::InferredRelationships]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::DegradeOnNonFatal
    }

    async fn execute(&self, ctx: &RunContext, progress: &Progress) -> Result<StageReport, OntologyError> {
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let summary = enrichment::enrich_tables(
            ctx.db(),
            ctx.services.semantic.as_ref(),
            &catalog,
            None,
            &ctx.writer,
            ctx.analysis().sample_limit,
            &ctx.cancel,
            &reporter(progress),
        )
        .await?;
        Ok(StageReport::new(format!(
            "{} tables described, {} kept, {} failed",
            summary.written, summary.skipped, summary.failed
        ))
        .with_failures(summary.failed))
    }
}

// ---------- finalization ----------

pub struct Finalization;

#[async_trait::async_trait]
impl Stage for Finalization {
    fn kind(&self) -> StageKind {
        StageKind::Finalization
    }

    fn depends_on(&self) -> &'static [StageKind] {
        &[StageKind::ColumnEnrichment, StageKind::TableEnrichment]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailFast
    }

    async fn execute(&self, ctx: &RunContext, _progress: &Progress) -> Result<StageReport, OntologyError> {
        let catalog = Catalog::load(ctx.db(), ctx.data_source_id()).await?;
        let rels = relationships::load_relationships(ctx.db(), ctx.data_source_id()).await?;
        let accepted = rels.iter().filter(|r| r.is_accepted()).count();

        let now = Utc::now().naive_utc();
        let mut active: crate::entity::data_source::ActiveModel = ctx.data_source.clone().into();
        active.last_build_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(ctx.db()).await?;

        Ok(StageReport::new(format!(
            "{} tables, {} columns, {} relationships ({} rejected candidates)",
            catalog.tables.len(),
            catalog.column_count(),
            accepted,
            rels.len() - accepted
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AnalysisConfig;
    use crate::datasource::{ColumnRef, DeclaredForeignKey, TableRef};
    use crate::entity::{data_source, table_metadata};
    use crate::model::RunStatus;
    use crate::pipeline::{Orchestrator, RunOutcome, RunRegistry, Services, run_store};
    use crate::testing::{FakeExecutor, FakeSemantic, create_data_source, setup_db, shop_executor};
    use sea_orm::{DatabaseConnection, EntityTrait};

    async fn build(
        db: &DatabaseConnection,
        ds: &data_source::Model,
        exec: FakeExecutor,
        semantic: Arc<FakeSemantic>,
        seed_path: Option<std::path::PathBuf>,
    ) -> RunOutcome {
        let orchestrator = Orchestrator::new(default_stages(), Arc::new(RunRegistry::new())).unwrap();
        let services = Services {
            db: db.clone(),
            semantic,
            analysis: AnalysisConfig::default(),
            knowledge_seed_path: seed_path,
        };
        orchestrator
            .run(services, Arc::new(exec), ds.project_id, ds.clone(), Writer::inferred("pipeline"))
            .await
            .unwrap()
    }

    #[test]
    fn default_stages_are_correctly_ordered() {
        let orchestrator = Orchestrator::new(default_stages(), Arc::new(RunRegistry::new())).unwrap();
        assert_eq!(orchestrator.stage_kinds().len(), 9);
        assert_eq!(orchestrator.stage_kinds()[8], StageKind::Finalization);
    }

    #[tokio::test]
    async fn shop_builds_end_to_end() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let outcome = build(&db, &ds, shop_executor(), Arc::new(FakeSemantic::default()), None).await;

        assert_eq!(outcome.status, RunStatus::Completed, "{outcome:?}");
        assert!(!outcome.degraded);

        let view = run_store::load_run(&db, outcome.run_id).await.unwrap().unwrap();
        assert!(view.stages.iter().all(|s| s.status == "completed"), "{:?}", view.stages);
        let inferred = view.stages.iter().find(|s| s.stage == "inferred_relationships").unwrap();
        assert!(inferred.done > 0 && inferred.done == inferred.total);

        let rels = relationships::load_relationships(&db, ds.id).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].detection_method, "inferred");
        assert_eq!(rels[0].cardinality, "N:1");

        let tables = table_metadata::Entity::find().all(&db).await.unwrap();
        assert!(tables.iter().any(|t| t.entity_name.as_deref() == Some("Order")));

        let stored = data_source::Entity::find_by_id(ds.id).one(&db).await.unwrap().unwrap();
        assert!(stored.last_build_at.is_some());
    }

    #[tokio::test]
    async fn profile_failure_degrades_the_snapshot() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let mut exec = shop_executor();
        exec.failing_profiles.insert(TableRef::new("public", "customers"));

        let outcome = build(&db, &ds, exec, Arc::new(FakeSemantic::default()), None).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.degraded);

        let view = run_store::load_run(&db, outcome.run_id).await.unwrap().unwrap();
        assert_eq!(view.stages[0].status, "degraded");
        assert_eq!(view.stages[8].status, "completed");
    }

    #[tokio::test]
    async fn unreachable_datasource_fails_the_snapshot() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let exec = FakeExecutor {
            unreachable: true,
            ..Default::default()
        };

        let outcome = build(&db, &ds, exec, Arc::new(FakeSemantic::default()), None).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_stage, Some(StageKind::SchemaSnapshot));
        let view = run_store::load_run(&db, outcome.run_id).await.unwrap().unwrap();
        assert!(view.stages[1..].iter().all(|s| s.status == "skipped"));
    }

    #[tokio::test]
    async fn missing_seed_file_is_fatal() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let outcome = build(
            &db,
            &ds,
            shop_executor(),
            Arc::new(FakeSemantic::default()),
            Some("/nonexistent/seed.json".into()),
        )
        .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_stage, Some(StageKind::KnowledgeSeed));
    }

    #[tokio::test]
    async fn transport_failure_during_validation_degrades_the_run() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let semantic =
            FakeSemantic::default().with_outcome("public.orders.customer_id", crate::testing::FakeOutcome::Transport);

        let outcome = build(&db, &ds, shop_executor(), Arc::new(semantic), None).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.degraded);

        let rels = relationships::load_relationships(&db, ds.id).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert!(rels[0].rejection_reason.is_some());
    }

    #[tokio::test]
    async fn rebuilding_keeps_inferred_relationships_inferred() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        for _ in 0..2 {
            let outcome = build(&db, &ds, shop_executor(), Arc::new(FakeSemantic::default()), None).await;
            assert_eq!(outcome.status, RunStatus::Completed, "{outcome:?}");

            let rels = relationships::load_relationships(&db, ds.id).await.unwrap();
            assert_eq!(rels.len(), 1);
            assert_eq!(rels[0].detection_method, "inferred");
            assert_eq!(rels[0].confidence, 0.9);
            assert_eq!(rels[0].reasoning.as_deref(), Some("values line up"));
        }
    }

    #[tokio::test]
    async fn declared_constraints_need_no_validation_calls() {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let mut exec = shop_executor();
        exec.foreign_keys.push(DeclaredForeignKey {
            source: ColumnRef::new("public", "orders", "customer_id"),
            target: ColumnRef::new("public", "customers", "id"),
        });
        let semantic = Arc::new(FakeSemantic::default());

        let outcome = build(&db, &ds, exec, semantic.clone(), None).await;
        assert_eq!(outcome.status, RunStatus::Completed, "{outcome:?}");
        assert_eq!(semantic.validation_calls(), 0);
        // enrichment still ran
        assert!(semantic.calls() > 0);

        let rels = relationships::load_relationships(&db, ds.id).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].detection_method, "constraint");
        assert_eq!(rels[0].confidence, 1.0);
    }
}
