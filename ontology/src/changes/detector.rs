//! Drift detection: live datasource against the stored snapshot and metadata.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ChangePayload, NewChange, PendingChangeStore, is_duplicate};
use crate::catalog::{self, Catalog, TableSnapshot};
use crate::config::AnalysisConfig;
use crate::datasource::{ColumnRef, DatasourceError, LiveTable, QueryExecutor};
use crate::entity::{column_metadata, pending_change};
use crate::error::OntologyError;
use crate::model::{Cardinality, ColumnRole, TypeFamily};
use crate::relationships::{self, candidates, cardinality::infer_from_stats};

/// Target key for a column pair.
pub fn pair_target(source: &ColumnRef, target: &ColumnRef) -> String {
    format!("{} -> {}", source.qualified_name(), target.qualified_name())
}

pub struct ChangeDetector {
    db: DatabaseConnection,
    executor: Arc<dyn QueryExecutor>,
    store: Arc<dyn PendingChangeStore>,
    cfg: AnalysisConfig,
}

impl ChangeDetector {
    pub fn new(
        db: DatabaseConnection,
        executor: Arc<dyn QueryExecutor>,
        store: Arc<dyn PendingChangeStore>,
        cfg: AnalysisConfig,
    ) -> Self {
        Self {
            db,
            executor,
            store,
            cfg,
        }
    }

    /// Compare the live datasource with the stored snapshot and record every
    /// drift not already known. Returns the changes created by this scan.
    pub async fn scan_for_changes(
        &self,
        project_id: Uuid,
        data_source_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<pending_change::Model>, OntologyError> {
        let live = self.executor.list_tables(cancel).await?;
        let catalog = Catalog::load(&self.db, data_source_id).await?;
        let mut found: Vec<(String, ChangePayload)> = Vec::new();
        // columns whose stored shape no longer matches; data checks skip them
        let mut unsettled: HashSet<Uuid> = HashSet::new();

        let live_names: HashSet<_> = live.iter().map(|t| t.table.clone()).collect();
        for table in &live {
            match catalog.find_table(&table.table) {
                None => found.push((
                    table.table.qualified_name(),
                    ChangePayload::NewTable {
                        table: table.table.clone(),
                        table_type: table.table_type.clone(),
                    },
                )),
                Some(stored) => self.diff_columns(stored, table, &mut found, &mut unsettled),
            }
        }
        for stored in &catalog.tables {
            let table = stored.table_ref();
            if !live_names.contains(&table) {
                found.push((
                    table.qualified_name(),
                    ChangePayload::DroppedTable {
                        table_id: stored.table.id,
                        table,
                    },
                ));
                unsettled.extend(stored.columns.iter().map(|c| c.id));
            }
        }

        if cancel.is_cancelled() {
            return Err(OntologyError::Cancelled);
        }
        self.detect_value_drift(&catalog, &unsettled, &mut found, cancel).await?;
        self.detect_fk_patterns(&catalog, data_source_id, &unsettled, &mut found, cancel)
            .await?;
        self.detect_cardinality_drift(&catalog, data_source_id, &unsettled, &mut found, cancel)
            .await?;

        let mut created = Vec::new();
        for (target, payload) in found {
            let change_type = payload.change_type();
            let json = payload.to_json()?;
            let history = self
                .store
                .find_for_target(project_id, data_source_id, change_type, &target)
                .await?;
            if is_duplicate(&history, &json) {
                tracing::debug!(change_type = %change_type, target = %target, "Change already known");
                continue;
            }
            self.apply_drop(&payload).await?;
            let recorded = self
                .store
                .create(NewChange {
                    project_id,
                    data_source_id,
                    target,
                    payload,
                })
                .await;
            match recorded {
                Ok(change) => created.push(change),
                // a concurrent scan recorded it first
                Err(OntologyError::Conflict(reason)) => {
                    tracing::debug!(change_type = %change_type, %reason, "Change already known");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            project_id = %project_id,
            data_source_id = %data_source_id,
            changes = created.len(),
            "Change scan finished"
        );
        Ok(created)
    }

    fn diff_columns(
        &self,
        stored: &TableSnapshot,
        live: &LiveTable,
        found: &mut Vec<(String, ChangePayload)>,
        unsettled: &mut HashSet<Uuid>,
    ) {
        for column in &live.columns {
            let column_ref = ColumnRef {
                table: live.table.clone(),
                column_name: column.column_name.clone(),
            };
            match stored.column(&column.column_name) {
                None => found.push((
                    column_ref.qualified_name(),
                    ChangePayload::NewColumn {
                        column: column_ref,
                        data_type: column.data_type.clone(),
                    },
                )),
                Some(existing) if existing.data_type != column.data_type => {
                    unsettled.insert(existing.id);
                    found.push((
                        column_ref.qualified_name(),
                        ChangePayload::ModifiedColumn {
                            column_id: existing.id,
                            old_type: existing.data_type.clone(),
                            new_type: column.data_type.clone(),
                        },
                    ));
                }
                Some(_) => {}
            }
        }

        let live_columns: HashSet<&str> = live.columns.iter().map(|c| c.column_name.as_str()).collect();
        for existing in &stored.columns {
            if !live_columns.contains(existing.column_name.as_str()) {
                unsettled.insert(existing.id);
                let column = stored.column_ref(existing);
                found.push((
                    column.qualified_name(),
                    ChangePayload::DroppedColumn {
                        column_id: existing.id,
                        column,
                    },
                ));
            }
        }
    }

    async fn apply_drop(&self, payload: &ChangePayload) -> Result<(), OntologyError> {
        match payload {
            ChangePayload::DroppedTable { table_id, .. } => {
                catalog::soft_delete_table(&self.db, *table_id).await
            }
            ChangePayload::DroppedColumn { column_id, .. } => {
                catalog::soft_delete_column(&self.db, *column_id).await
            }
            _ => Ok(()),
        }
    }

    /// New enum values on enumerated columns and enum-shaped unclassified
    /// text columns.
    async fn detect_value_drift(
        &self,
        catalog: &Catalog,
        unsettled: &HashSet<Uuid>,
        found: &mut Vec<(String, ChangePayload)>,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        let metadata = load_metadata(&self.db, catalog).await?;
        let value_limit = self.cfg.enum_max_distinct.max(0) as usize + 1;

        for (table, column) in catalog.columns() {
            if unsettled.contains(&column.id) {
                continue;
            }
            let meta = metadata.get(&column.id);
            let role = meta.and_then(|m| m.role.as_deref()).and_then(|r| r.parse::<ColumnRole>().ok());
            let column_ref = table.column_ref(column);

            match role {
                Some(ColumnRole::Enumeration) => {
                    let recorded: BTreeSet<String> = meta
                        .map(|m| m.enum_value_list())
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    if recorded.is_empty() {
                        continue;
                    }
                    let Some(values) = self.live_values(&column_ref, value_limit, cancel).await? else {
                        continue;
                    };
                    let new: Vec<String> = values.into_iter().filter(|v| !recorded.contains(v)).collect();
                    if !new.is_empty() {
                        found.push((
                            column_ref.qualified_name(),
                            ChangePayload::NewEnumValues {
                                column_id: column.id,
                                values: new,
                            },
                        ));
                    }
                }
                None if TypeFamily::of(&column.data_type) == TypeFamily::Text => {
                    let Some(values) = self.live_values(&column_ref, value_limit, cancel).await? else {
                        continue;
                    };
                    if crate::features::enum_shaped(values.len() as i64, &values, &self.cfg) {
                        found.push((
                            column_ref.qualified_name(),
                            ChangePayload::PotentialEnum {
                                column_id: column.id,
                                values,
                            },
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Identifier columns with no recorded relationship whose values resolve
    /// almost entirely in a key column.
    async fn detect_fk_patterns(
        &self,
        catalog: &Catalog,
        data_source_id: Uuid,
        unsettled: &HashSet<Uuid>,
        found: &mut Vec<(String, ChangePayload)>,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        let roles = relationships::column_roles(&self.db, catalog).await?;
        let recorded: HashSet<Uuid> = relationships::load_relationships(&self.db, data_source_id)
            .await?
            .into_iter()
            .map(|r| r.source_column_id)
            .collect();

        let exclude: HashSet<(Uuid, Uuid)> = HashSet::new();
        let pairs = candidates::candidate_pairs(catalog, &roles, &exclude);
        for (source_id, target_id) in pairs {
            if recorded.contains(&source_id)
                || unsettled.contains(&source_id)
                || unsettled.contains(&target_id)
                || roles.get(&source_id) != Some(&ColumnRole::Identifier)
            {
                continue;
            }
            let (Some(source), Some(target)) = (catalog.column_ref(source_id), catalog.column_ref(target_id)) else {
                continue;
            };
            let stats = match self.executor.join_stats(&source, &target, cancel).await {
                Ok(stats) => stats,
                Err(DatasourceError::Query(msg)) => {
                    tracing::warn!(
                        source = %source.qualified_name(),
                        target = %target.qualified_name(),
                        error = %msg,
                        "Join statistics failed, skipping pair"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if stats.matched_count > 0 && stats.overlap() >= self.cfg.fk_overlap_threshold {
                found.push((
                    pair_target(&source, &target),
                    ChangePayload::NewFkPattern {
                        source_column_id: source_id,
                        target_column_id: target_id,
                        source,
                        target,
                        matched_count: stats.matched_count,
                        overlap: stats.overlap(),
                    },
                ));
            }
        }
        Ok(())
    }

    async fn detect_cardinality_drift(
        &self,
        catalog: &Catalog,
        data_source_id: Uuid,
        unsettled: &HashSet<Uuid>,
        found: &mut Vec<(String, ChangePayload)>,
        cancel: &CancellationToken,
    ) -> Result<(), OntologyError> {
        for rel in relationships::load_relationships(&self.db, data_source_id).await? {
            if !rel.is_accepted()
                || unsettled.contains(&rel.source_column_id)
                || unsettled.contains(&rel.target_column_id)
            {
                continue;
            }
            let (Some(source), Some(target)) =
                (catalog.column_ref(rel.source_column_id), catalog.column_ref(rel.target_column_id))
            else {
                continue;
            };
            let stats = match self.executor.join_stats(&source, &target, cancel).await {
                Ok(stats) => stats,
                Err(DatasourceError::Query(msg)) => {
                    tracing::warn!(relationship_id = %rel.id, error = %msg, "Cardinality check failed");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let recomputed = infer_from_stats(&stats);
            let stored = rel.cardinality.parse::<Cardinality>().unwrap_or(Cardinality::Unknown);
            if recomputed != Cardinality::Unknown && recomputed != stored {
                found.push((
                    pair_target(&source, &target),
                    ChangePayload::CardinalityChange {
                        relationship_id: rel.id,
                        old: stored,
                        new: recomputed,
                    },
                ));
            }
        }
        Ok(())
    }

    /// Distinct live values, or `None` when the query failed for a
    /// non-connectivity reason.
    async fn live_values(
        &self,
        column: &ColumnRef,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<String>>, OntologyError> {
        match self.executor.distinct_values(column, limit, cancel).await {
            Ok(values) => Ok(Some(values)),
            Err(DatasourceError::Query(msg)) => {
                tracing::warn!(column = %column.qualified_name(), error = %msg, "Distinct value query failed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn load_metadata(
    db: &DatabaseConnection,
    catalog: &Catalog,
) -> Result<HashMap<Uuid, column_metadata::Model>, OntologyError> {
    let ids: Vec<Uuid> = catalog.columns().map(|(_, c)| c.id).collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(column_metadata::Entity::find()
        .filter(column_metadata::Column::SchemaColumnId.is_in(ids))
        .all(db)
        .await?
        .into_iter()
        .map(|m| (m.schema_column_id, m))
        .collect())
}
