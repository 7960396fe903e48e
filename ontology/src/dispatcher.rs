//! Applies approved pending changes with the smallest re-analysis scope
//! that covers them.
//!
//! Changes are grouped by type and groups run in a fixed order (tables
//! before their columns, shape before values). Inside a group every item is
//! evaluated and written on its own: a failing item gets its error recorded
//! on the change and the rest carry on. A configuration failure, a metadata
//! store failure or cancellation stops the whole dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{self, Catalog, TableSnapshot};
use crate::changes::{ChangePayload, PendingChangeStore};
use crate::config::AnalysisConfig;
use crate::datasource::{ColumnRef, LiveTable, QueryExecutor, TableRef};
use crate::enrichment::{self, EnrichmentSummary};
use crate::entity::{column_metadata, pending_change};
use crate::error::OntologyError;
use crate::features;
use crate::model::{ChangeType, ColumnRole};
use crate::precedence::{self, ColumnPatch, Writer};
use crate::relationships;
use crate::semantic::SemanticClient;

const GROUP_ORDER: [ChangeType; 9] = [
    ChangeType::DroppedTable,
    ChangeType::DroppedColumn,
    ChangeType::NewTable,
    ChangeType::NewColumn,
    ChangeType::ModifiedColumn,
    ChangeType::NewEnumValues,
    ChangeType::PotentialEnum,
    ChangeType::NewFkPattern,
    ChangeType::CardinalityChange,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub applied: usize,
    pub failed: usize,
}

type Item = (pending_change::Model, ChangePayload);

pub struct Dispatcher {
    db: DatabaseConnection,
    executor: Arc<dyn QueryExecutor>,
    semantic: Arc<dyn SemanticClient>,
    store: Arc<dyn PendingChangeStore>,
    cfg: AnalysisConfig,
    writer: Writer,
}

/// Errors that end the dispatch instead of being recorded on one change.
fn aborts_dispatch(e: &OntologyError) -> bool {
    matches!(
        e,
        OntologyError::Configuration(_) | OntologyError::Database(_) | OntologyError::Cancelled
    )
}

fn enrichment_result(summary: EnrichmentSummary, what: &str) -> Result<(), OntologyError> {
    if summary.failed > 0 {
        Err(OntologyError::Validation(format!(
            "{} {what} enrichment call(s) failed",
            summary.failed
        )))
    } else {
        Ok(())
    }
}

impl Dispatcher {
    pub fn new(
        db: DatabaseConnection,
        executor: Arc<dyn QueryExecutor>,
        semantic: Arc<dyn SemanticClient>,
        store: Arc<dyn PendingChangeStore>,
        cfg: AnalysisConfig,
        writer: Writer,
    ) -> Self {
        Self {
            db,
            executor,
            semantic,
            store,
            cfg,
            writer,
        }
    }

    /// Apply every approved, unresolved change for a data source.
    pub async fn apply_approved(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary, OntologyError> {
        let approved = self.store.list_approved(project_id, data_source_id).await?;
        let mut summary = DispatchSummary::default();
        if approved.is_empty() {
            return Ok(summary);
        }

        let mut groups: HashMap<ChangeType, Vec<Item>> = HashMap::new();
        for change in approved {
            match ChangePayload::from_model(&change) {
                Ok(payload) => groups.entry(payload.change_type()).or_default().push((change, payload)),
                Err(e) => self.fail(&change, e, &mut summary).await?,
            }
        }

        // Live shape, fetched once and only if a group needs it.
        let mut live: Option<Vec<LiveTable>> = None;

        for change_type in GROUP_ORDER {
            let Some(items) = groups.remove(&change_type) else {
                continue;
            };
            tracing::info!(change_type = %change_type, count = items.len(), "Applying approved changes");

            if change_type == ChangeType::NewFkPattern {
                self.apply_fk_patterns(project_id, data_source_id, items, cancel, &mut summary)
                    .await?;
                continue;
            }
            for (change, payload) in items {
                if cancel.is_cancelled() {
                    return Err(OntologyError::Cancelled);
                }
                let result = self
                    .apply_one(project_id, data_source_id, &payload, &mut live, cancel)
                    .await;
                self.settle(&change, result, &mut summary).await?;
            }
        }

        tracing::info!(
            project_id = %project_id,
            data_source_id = %data_source_id,
            applied = summary.applied,
            failed = summary.failed,
            "Dispatch finished"
        );
        Ok(summary)
    }

    async fn settle(
        &self,
        change: &pending_change::Model,
        result: Result<(), OntologyError>,
        summary: &mut DispatchSummary,
    ) -> Result<(), OntologyError> {
        match result {
            Ok(()) => {
                self.store.mark_resolved(change.id).await?;
                summary.applied += 1;
                Ok(())
            }
            Err(e) => self.fail(change, e, summary).await,
        }
    }

    async fn fail(
        &self,
        change: &pending_change::Model,
        e: OntologyError,
        summary: &mut DispatchSummary,
    ) -> Result<(), OntologyError> {
        if aborts_dispatch(&e) {
            tracing::error!(change_id = %change.id, target = %change.target, error = %e, "Dispatch aborted");
            if matches!(e, OntologyError::Configuration(_)) {
                self.store.record_error(change.id, &e.to_string()).await?;
            }
            return Err(e);
        }
        tracing::warn!(
            change_id = %change.id,
            change_type = %change.change_type,
            target = %change.target,
            error = %e,
            "Change could not be applied"
        );
        self.store.record_error(change.id, &e.to_string()).await?;
        summary.failed += 1;
        Ok(())
    }

    async fn live_table<'a>(
        &self,
        live: &'a mut Option<Vec<LiveTable>>,
        table: &TableRef,
        cancel: &CancellationToken,
    ) -> Result<&'a LiveTable, OntologyError> {
        if live.is_none() {
            *live = Some(self.executor.list_tables(cancel).await?);
        }
        live.as_ref()
            .and_then(|tables| tables.iter().find(|t| &t.table == table))
            .ok_or_else(|| OntologyError::NotFound(format!("live table {}", table.qualified_name())))
    }

    async fn apply_one(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        payload: &ChangePayload,
        live: &mut Option<Vec<LiveTable>>,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        match payload {
            // Soft-deleted when detected.
            ChangePayload::DroppedTable { .. } | ChangePayload::DroppedColumn { .. } => Ok(()),
            ChangePayload::NewTable { table, .. } => {
                let shape = self.live_table(live, table, cancel).await?.clone();
                self.apply_new_table(project_id, data_source_id, &shape, cancel).await
            }
            ChangePayload::NewColumn { column, .. } => {
                let shape = self.live_table(live, &column.table, cancel).await?.clone();
                self.apply_new_column(data_source_id, &shape, column, cancel).await
            }
            ChangePayload::ModifiedColumn { column_id, new_type, .. } => {
                self.apply_modified_column(data_source_id, *column_id, new_type).await
            }
            ChangePayload::NewEnumValues { column_id, values } => {
                self.apply_new_enum_values(*column_id, values).await
            }
            ChangePayload::PotentialEnum { column_id, .. } => {
                self.apply_potential_enum(data_source_id, *column_id, cancel).await
            }
            ChangePayload::CardinalityChange { relationship_id, new, .. } => {
                precedence::write_cardinality(&self.db, *relationship_id, *new, &self.writer).await?;
                Ok(())
            }
            ChangePayload::NewFkPattern { .. } => Err(OntologyError::Validation(
                "foreign-key patterns are applied as a group".to_string(),
            )),
        }
    }

    async fn load_table(&self, data_source_id: Uuid, table: &TableRef) -> Result<(Catalog, Uuid), OntologyError> {
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let id = catalog
            .find_table(table)
            .map(|t| t.table.id)
            .ok_or_else(|| OntologyError::NotFound(format!("table {} in snapshot", table.qualified_name())))?;
        Ok((catalog, id))
    }

    fn snapshot<'a>(catalog: &'a Catalog, table_id: Uuid) -> Result<&'a TableSnapshot, OntologyError> {
        catalog
            .tables
            .iter()
            .find(|t| t.table.id == table_id)
            .ok_or_else(|| OntologyError::NotFound(format!("table {table_id}")))
    }

    async fn apply_new_table(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        shape: &LiveTable,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        let names: Vec<String> = shape.columns.iter().map(|c| c.column_name.clone()).collect();
        let profile = self
            .executor
            .table_profile(&shape.table, &names, self.cfg.sample_limit, cancel)
            .await?;
        catalog::upsert_table(&self.db, project_id, data_source_id, shape, Some(&profile), self.cfg.sample_limit)
            .await?;

        let (catalog, table_id) = self.load_table(data_source_id, &shape.table).await?;
        let table = Self::snapshot(&catalog, table_id)?;
        features::write_column_features(&self.db, table, None, &self.cfg, &self.writer).await?;
        features::write_table_features(&self.db, table, &self.writer).await?;

        let columns = enrichment::enrich_table_columns(
            &self.db,
            self.semantic.as_ref(),
            table,
            None,
            &self.writer,
            self.cfg.sample_limit,
            cancel,
        )
        .await?;
        let described = enrichment::enrich_tables(
            &self.db,
            self.semantic.as_ref(),
            &catalog,
            Some(table_id),
            &self.writer,
            self.cfg.sample_limit,
            cancel,
            &|_, _| {},
        )
        .await?;
        enrichment_result(columns, "column")?;
        enrichment_result(described, "table")
    }

    async fn apply_new_column(
        &self,
        data_source_id: Uuid,
        shape: &LiveTable,
        column: &ColumnRef,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        let live_column = shape
            .columns
            .iter()
            .find(|c| c.column_name == column.column_name)
            .ok_or_else(|| OntologyError::NotFound(format!("live column {}", column.qualified_name())))?;
        let (_, table_id) = self.load_table(data_source_id, &column.table).await?;

        let profile = self
            .executor
            .table_profile(
                &column.table,
                std::slice::from_ref(&column.column_name),
                self.cfg.sample_limit,
                cancel,
            )
            .await?;
        catalog::add_column(
            &self.db,
            table_id,
            live_column,
            Some(profile.row_count),
            profile.columns.first(),
            self.cfg.sample_limit,
        )
        .await?;

        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let table = Self::snapshot(&catalog, table_id)?;
        let name = Some(column.column_name.as_str());
        features::write_column_features(&self.db, table, name, &self.cfg, &self.writer).await?;
        let annotated = enrichment::enrich_table_columns(
            &self.db,
            self.semantic.as_ref(),
            table,
            name,
            &self.writer,
            self.cfg.sample_limit,
            cancel,
        )
        .await?;
        enrichment_result(annotated, "column")
    }

    async fn apply_modified_column(
        &self,
        data_source_id: Uuid,
        column_id: Uuid,
        new_type: &str,
    ) -> Result<(), OntologyError> {
        let column = catalog::update_column_type(&self.db, column_id, new_type).await?;
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let table = Self::snapshot(&catalog, column.schema_table_id)?;
        features::write_column_features(&self.db, table, Some(&column.column_name), &self.cfg, &self.writer)
            .await?;
        Ok(())
    }

    async fn apply_new_enum_values(&self, column_id: Uuid, values: &[String]) -> Result<(), OntologyError> {
        let existing = column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.eq(column_id))
            .one(&self.db)
            .await?
            .map(|m| m.enum_value_list())
            .unwrap_or_default();
        let patch = ColumnPatch {
            enum_values: Some(features::union_enum_values(&existing, values)),
            ..Default::default()
        };
        precedence::write_column_metadata(&self.db, column_id, &patch, &self.writer).await?;
        Ok(())
    }

    async fn apply_potential_enum(
        &self,
        data_source_id: Uuid,
        column_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let column = catalog
            .column_ref(column_id)
            .ok_or_else(|| OntologyError::NotFound(format!("column {column_id}")))?;
        let limit = self.cfg.enum_max_distinct.max(0) as usize + 1;
        let values = self.executor.distinct_values(&column, limit, cancel).await?;
        if !features::enum_shaped(values.len() as i64, &values, &self.cfg) {
            return Err(OntologyError::Validation(format!(
                "{} no longer looks like an enumeration ({} distinct values)",
                column.qualified_name(),
                values.len()
            )));
        }
        let patch = ColumnPatch {
            role: Some(ColumnRole::Enumeration),
            enum_values: Some(features::union_enum_values(&[], &values)),
            ..Default::default()
        };
        precedence::write_column_metadata(&self.db, column_id, &patch, &self.writer).await?;
        Ok(())
    }

    /// Measure each approved pair, validate the survivors over one shared
    /// pool, then persist and settle each change on its own.
    async fn apply_fk_patterns(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        items: Vec<Item>,
        cancel: &CancellationToken,
        summary: &mut DispatchSummary,
    ) -> Result<(), OntologyError> {
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let mut waiting: HashMap<(Uuid, Uuid), pending_change::Model> = HashMap::new();
        let mut candidates = Vec::new();

        for (change, payload) in items {
            if cancel.is_cancelled() {
                return Err(OntologyError::Cancelled);
            }
            let ChangePayload::NewFkPattern {
                source_column_id,
                target_column_id,
                ..
            } = payload
            else {
                continue;
            };
            let measured = relationships::measure_pair(
                self.executor.as_ref(),
                &catalog,
                source_column_id,
                target_column_id,
                self.cfg.sample_limit,
                cancel,
            )
            .await;
            match measured {
                Ok(Some(candidate)) => {
                    waiting.insert((source_column_id, target_column_id), change);
                    candidates.push(candidate);
                }
                Ok(None) => {
                    let e = OntologyError::Validation("pair has no measurable matching values".to_string());
                    self.fail(&change, e, summary).await?;
                }
                Err(e) => self.fail(&change, e, summary).await?,
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let batch = relationships::validate_all(
            self.semantic.as_ref(),
            candidates,
            self.cfg.validation_workers,
            self.cfg.min_confidence,
            cancel,
            &|_, _| {},
        )
        .await?;

        for validated in &batch.results {
            let key = (validated.candidate.source_column_id, validated.candidate.target_column_id);
            let Some(change) = waiting.remove(&key) else {
                continue;
            };
            let result = match &validated.error {
                Some(msg) => Err(OntologyError::Validation(msg.clone())),
                None => relationships::persist_validated(
                    &self.db,
                    project_id,
                    data_source_id,
                    std::slice::from_ref(validated),
                    &self.writer,
                )
                .await
                .map(|_| ()),
            };
            self.settle(&change, result, summary).await?;
        }
        if batch.cancelled {
            return Err(OntologyError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{ChangeDetector, NewChange, SeaOrmChangeStore};
    use crate::datasource::{ColumnProfile, JoinStats, LiveColumn};
    use crate::entity::{relationship, schema_column};
    use crate::model::{Cardinality, ChangeStatus, Source};
    use crate::pipeline::{Orchestrator, RunRegistry, Services, stages::default_stages};
    use crate::testing::{
        FakeExecutor, FakeOutcome, FakeSemantic, create_data_source, live_table, profile, setup_db, shop_executor,
    };

    struct Fixture {
        db: DatabaseConnection,
        project_id: Uuid,
        data_source_id: Uuid,
        store: Arc<SeaOrmChangeStore>,
    }

    async fn built() -> Fixture {
        let db = setup_db().await;
        let ds = create_data_source(&db).await;
        let orchestrator = Orchestrator::new(default_stages(), Arc::new(RunRegistry::new())).unwrap();
        let services = Services {
            db: db.clone(),
            semantic: Arc::new(FakeSemantic::default()),
            analysis: AnalysisConfig::default(),
            knowledge_seed_path: None,
        };
        orchestrator
            .run(services, Arc::new(shop_executor()), ds.project_id, ds.clone(), Writer::inferred("pipeline"))
            .await
            .unwrap();
        Fixture {
            store: Arc::new(SeaOrmChangeStore::new(db.clone())),
            db,
            project_id: ds.project_id,
            data_source_id: ds.id,
        }
    }

    impl Fixture {
        async fn scan_and_approve(&self, exec: FakeExecutor) -> Vec<pending_change::Model> {
            let detector = ChangeDetector::new(
                self.db.clone(),
                Arc::new(exec),
                self.store.clone(),
                AnalysisConfig::default(),
            );
            let found = detector
                .scan_for_changes(self.project_id, self.data_source_id, &CancellationToken::new())
                .await
                .unwrap();
            for c in found.iter().filter(|c| c.status == "pending") {
                self.store.update_status(c.id, ChangeStatus::Approved, "ops").await.unwrap();
            }
            found
        }

        async fn approve(&self, target: &str, payload: ChangePayload) -> pending_change::Model {
            let change = self
                .store
                .create(NewChange {
                    project_id: self.project_id,
                    data_source_id: self.data_source_id,
                    target: target.to_string(),
                    payload,
                })
                .await
                .unwrap();
            self.store.update_status(change.id, ChangeStatus::Approved, "ops").await.unwrap()
        }

        fn dispatcher(&self, exec: FakeExecutor, semantic: FakeSemantic) -> Dispatcher {
            Dispatcher::new(
                self.db.clone(),
                Arc::new(exec),
                Arc::new(semantic),
                self.store.clone(),
                AnalysisConfig::default(),
                Writer::inferred("dispatcher"),
            )
        }

        async fn change(&self, id: Uuid) -> pending_change::Model {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    /// The shop with orders.note added and a new invoices table.
    fn grown_shop() -> FakeExecutor {
        let mut exec = shop_executor();
        let orders = exec
            .tables
            .iter_mut()
            .find(|t| t.table == TableRef::new("public", "orders"))
            .unwrap();
        orders.columns.push(LiveColumn {
            column_name: "note".to_string(),
            ordinal_position: 5,
            data_type: "text".to_string(),
            is_nullable: true,
            is_primary_key: false,
            is_unique: false,
        });
        exec.profiles
            .get_mut(&TableRef::new("public", "orders"))
            .unwrap()
            .columns
            .push(ColumnProfile {
                column_name: "note".to_string(),
                distinct_count: 5,
                null_count: 0,
                samples: vec!["leave at the door".to_string(), "gift wrap please".to_string()],
            });
        exec.with_table(
            live_table(
                "public",
                "invoices",
                &[("id", "integer", true, true), ("amount", "numeric(10,2)", false, false)],
            ),
            profile(2, &[("id", 2, 0, &["1", "2"]), ("amount", 2, 0, &["9.50", "20.00"])]),
        )
    }

    #[tokio::test]
    async fn new_table_and_column_are_snapshotted_and_enriched() {
        let fx = built().await;
        let changes = fx.scan_and_approve(grown_shop()).await;
        assert_eq!(changes.len(), 2);

        let semantic = FakeSemantic::default();
        let summary = fx
            .dispatcher(grown_shop(), semantic)
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, DispatchSummary { applied: 2, failed: 0 });

        let catalog = Catalog::load(&fx.db, fx.data_source_id).await.unwrap();
        let invoices = catalog.find_table(&TableRef::new("public", "invoices")).unwrap();
        assert_eq!(invoices.columns.len(), 2);
        let (_, note) = catalog.find_column(&ColumnRef::new("public", "orders", "note")).unwrap();
        assert_eq!(note.distinct_count, Some(5));

        let meta = column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.eq(note.id))
            .one(&fx.db)
            .await
            .unwrap()
            .unwrap();
        assert!(meta.purpose.is_some());
        for c in changes {
            assert!(fx.change(c.id).await.resolved_at.is_some());
        }

        // nothing left to apply
        let again = fx
            .dispatcher(grown_shop(), FakeSemantic::default())
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, DispatchSummary::default());
    }

    #[tokio::test]
    async fn one_failing_item_does_not_block_the_others() {
        let fx = built().await;
        let catalog = Catalog::load(&fx.db, fx.data_source_id).await.unwrap();
        let (_, status) = catalog.find_column(&ColumnRef::new("public", "orders", "status")).unwrap();
        let (_, name) = catalog.find_column(&ColumnRef::new("public", "customers", "name")).unwrap();

        let enum_change = fx
            .approve(
                "public.orders.status",
                ChangePayload::NewEnumValues {
                    column_id: status.id,
                    values: vec!["returned".into()],
                },
            )
            .await;
        // customers.name has three long distinct values: not an enumeration
        let mut exec = shop_executor();
        exec.distinct.insert(
            ColumnRef::new("public", "customers", "name"),
            (0..30).map(|i| format!("customer {i}")).collect(),
        );
        let broken = fx
            .approve(
                "public.customers.name",
                ChangePayload::PotentialEnum {
                    column_id: name.id,
                    values: vec!["a".into(), "b".into()],
                },
            )
            .await;
        let missing = fx
            .approve(
                "public.orders.ghost",
                ChangePayload::ModifiedColumn {
                    column_id: Uuid::now_v7(),
                    old_type: "text".into(),
                    new_type: "varchar".into(),
                },
            )
            .await;

        let summary = fx
            .dispatcher(exec, FakeSemantic::default())
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, DispatchSummary { applied: 1, failed: 2 });

        let applied = fx.change(enum_change.id).await;
        assert!(applied.resolved_at.is_some());
        assert!(applied.error.is_none());
        let meta = column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.eq(status.id))
            .one(&fx.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.enum_value_list(), vec!["open", "returned", "shipped"]);

        for id in [broken.id, missing.id] {
            let failed = fx.change(id).await;
            assert!(failed.resolved_at.is_none());
            assert!(failed.error.is_some());
        }
    }

    #[tokio::test]
    async fn fk_patterns_share_a_pool_and_fail_individually() {
        let fx = built().await;
        // forget the relationship the build found, then re-approve it alongside a
        // pair whose classifier call fails
        relationship::Entity::delete_many().exec(&fx.db).await.unwrap();

        let mut exec = shop_executor();
        let orders_id = ColumnRef::new("public", "orders", "id");
        exec = exec.with_join(
            orders_id.clone(),
            ColumnRef::new("public", "customers", "id"),
            JoinStats {
                source_distinct: 5,
                target_distinct: 3,
                matched_count: 3,
                orphan_count: 2,
                reverse_orphan_count: 0,
                source_rows: 5,
                target_rows: 3,
            },
        );
        let catalog = Catalog::load(&fx.db, fx.data_source_id).await.unwrap();
        let id_of = |c: &ColumnRef| catalog.find_column(c).unwrap().1.id;
        let customer_id = ColumnRef::new("public", "orders", "customer_id");
        let customers_id = ColumnRef::new("public", "customers", "id");

        let good = fx
            .approve(
                "public.orders.customer_id -> public.customers.id",
                ChangePayload::NewFkPattern {
                    source_column_id: id_of(&customer_id),
                    target_column_id: id_of(&customers_id),
                    source: customer_id.clone(),
                    target: customers_id.clone(),
                    matched_count: 3,
                    overlap: 1.0,
                },
            )
            .await;
        let flaky = fx
            .approve(
                "public.orders.id -> public.customers.id",
                ChangePayload::NewFkPattern {
                    source_column_id: id_of(&orders_id),
                    target_column_id: id_of(&customers_id),
                    source: orders_id.clone(),
                    target: customers_id.clone(),
                    matched_count: 3,
                    overlap: 0.6,
                },
            )
            .await;

        let semantic = FakeSemantic::default().with_outcome("public.orders.id", FakeOutcome::Transport);
        let summary = fx
            .dispatcher(exec, semantic)
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, DispatchSummary { applied: 1, failed: 1 });

        let rels = relationship::Entity::find().all(&fx.db).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].cardinality, Cardinality::ManyToOne.as_str());
        assert!(fx.change(good.id).await.resolved_at.is_some());
        assert!(fx.change(flaky.id).await.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn cardinality_change_respects_precedence() {
        let fx = built().await;
        let rel = relationship::Entity::find().one(&fx.db).await.unwrap().unwrap();
        let change = fx
            .approve(
                "public.orders.customer_id -> public.customers.id",
                ChangePayload::CardinalityChange {
                    relationship_id: rel.id,
                    old: Cardinality::ManyToOne,
                    new: Cardinality::OneToOne,
                },
            )
            .await;
        fx.dispatcher(shop_executor(), FakeSemantic::default())
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        let stored = relationship::Entity::find_by_id(rel.id).one(&fx.db).await.unwrap().unwrap();
        assert_eq!(stored.cardinality, "1:1");
        assert!(fx.change(change.id).await.resolved_at.is_some());

        // a manual owner is left alone, and the change still resolves
        precedence::write_cardinality(&fx.db, rel.id, Cardinality::OneToMany, &Writer::new(Source::Manual, "ops"))
            .await
            .unwrap();
        fx.approve(
            "public.orders.customer_id -> public.customers.id",
            ChangePayload::CardinalityChange {
                relationship_id: rel.id,
                old: Cardinality::OneToOne,
                new: Cardinality::ManyToOne,
            },
        )
        .await;
        let summary = fx
            .dispatcher(shop_executor(), FakeSemantic::default())
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.applied, 1);
        let stored = relationship::Entity::find_by_id(rel.id).one(&fx.db).await.unwrap().unwrap();
        assert_eq!(stored.cardinality, "1:N");
    }

    #[tokio::test]
    async fn configuration_error_aborts_the_dispatch() {
        let fx = built().await;
        fx.scan_and_approve(grown_shop()).await;

        let semantic = FakeSemantic {
            default: FakeOutcome::Configuration,
            ..Default::default()
        };
        let err = fx
            .dispatcher(grown_shop(), semantic)
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::Configuration(_)));

        let open = fx.store.list_approved(fx.project_id, fx.data_source_id).await.unwrap();
        assert!(!open.is_empty());
    }

    #[tokio::test]
    async fn modified_column_updates_the_snapshot_type() {
        let fx = built().await;
        let mut exec = shop_executor();
        let orders = exec
            .tables
            .iter_mut()
            .find(|t| t.table == TableRef::new("public", "orders"))
            .unwrap();
        orders
            .columns
            .iter_mut()
            .find(|c| c.column_name == "customer_id")
            .unwrap()
            .data_type = "bigint".to_string();
        let changes = fx.scan_and_approve(exec).await;
        assert_eq!(changes.len(), 1);

        fx.dispatcher(shop_executor(), FakeSemantic::default())
            .apply_approved(fx.project_id, fx.data_source_id, &CancellationToken::new())
            .await
            .unwrap();
        let column = schema_column::Entity::find()
            .filter(schema_column::Column::ColumnName.eq("customer_id"))
            .one(&fx.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(column.data_type, "bigint");
    }
}
