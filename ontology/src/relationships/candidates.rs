//! Deterministic candidate generation.
//!
//! Sources are reference-like columns; targets are single-column primary
//! keys or unique columns. Every type-compatible pair is measured with one
//! aggregate query and kept only if at least one value matches.

use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Catalog, TableSnapshot};
use crate::datasource::{ColumnRef, DatasourceError, JoinStats, QueryExecutor};
use crate::entity::schema_column;
use crate::error::OntologyError;
use crate::model::{ColumnRole, TypeFamily};
use crate::semantic::{CandidateUnit, ColumnEvidence};

#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: ColumnRef,
    pub target: ColumnRef,
    pub source_column_id: Uuid,
    pub target_column_id: Uuid,
    pub stats: JoinStats,
    pub unit: CandidateUnit,
}

pub fn is_source(column: &schema_column::Model, role: Option<ColumnRole>) -> bool {
    let single_pk = column.is_primary_key && column.is_unique;
    !single_pk
        && role.is_some_and(|r| r.is_reference_like())
        && !TypeFamily::of(&column.data_type).is_excluded_from_references()
}

pub fn is_target(column: &schema_column::Model) -> bool {
    column.is_unique
}

pub fn evidence(table: &TableSnapshot, column: &schema_column::Model, sample_limit: usize) -> ColumnEvidence {
    let mut samples = column.samples();
    samples.truncate(sample_limit);
    ColumnEvidence {
        qualified_name: table.column_ref(column).qualified_name(),
        data_type: column.data_type.clone(),
        is_primary_key: column.is_primary_key,
        is_unique: column.is_unique,
        distinct_count: column.distinct_count,
        null_rate: column.null_rate,
        samples,
    }
}

/// Structurally plausible (source, target) column id pairs, in catalog order.
pub fn candidate_pairs(
    catalog: &Catalog,
    roles: &HashMap<Uuid, ColumnRole>,
    exclude: &HashSet<(Uuid, Uuid)>,
) -> Vec<(Uuid, Uuid)> {
    let targets: Vec<&schema_column::Model> = catalog
        .columns()
        .filter(|(_, c)| is_target(c))
        .map(|(_, c)| c)
        .collect();

    let mut pairs = Vec::new();
    for (_, source) in catalog.columns() {
        if !is_source(source, roles.get(&source.id).copied()) {
            continue;
        }
        let source_family = TypeFamily::of(&source.data_type);
        for target in &targets {
            if target.id == source.id || exclude.contains(&(source.id, target.id)) {
                continue;
            }
            if source_family.is_join_compatible(TypeFamily::of(&target.data_type)) {
                pairs.push((source.id, target.id));
            }
        }
    }
    pairs
}

/// Measure one pair. `Ok(None)` when the pair has no matching values or its
/// query failed for a non-connectivity reason.
pub async fn measure_pair(
    executor: &dyn QueryExecutor,
    catalog: &Catalog,
    source_id: Uuid,
    target_id: Uuid,
    sample_limit: usize,
    cancel: &CancellationToken,
) -> Result<Option<Candidate>, OntologyError> {
    let (Some((source_table, source)), Some((target_table, target))) =
        (catalog.column(source_id), catalog.column(target_id))
    else {
        return Err(OntologyError::NotFound(format!(
            "column pair {source_id} -> {target_id}"
        )));
    };
    let source_ref = source_table.column_ref(source);
    let target_ref = target_table.column_ref(target);

    let stats = match executor.join_stats(&source_ref, &target_ref, cancel).await {
        Ok(stats) => stats,
        Err(DatasourceError::Query(msg)) => {
            tracing::warn!(
                source = %source_ref.qualified_name(),
                target = %target_ref.qualified_name(),
                error = %msg,
                "Join statistics failed, skipping pair"
            );
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if stats.matched_count <= 0 {
        return Ok(None);
    }

    let unit = CandidateUnit::new(
        evidence(source_table, source, sample_limit),
        evidence(target_table, target, sample_limit),
        &stats,
    );
    Ok(Some(Candidate {
        source: source_ref,
        target: target_ref,
        source_column_id: source_id,
        target_column_id: target_id,
        stats,
        unit,
    }))
}

/// Measure every plausible pair. `on_progress(done, total)` fires after each
/// pair.
pub async fn collect_candidates(
    executor: &dyn QueryExecutor,
    catalog: &Catalog,
    roles: &HashMap<Uuid, ColumnRole>,
    exclude: &HashSet<(Uuid, Uuid)>,
    sample_limit: usize,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<Vec<Candidate>, OntologyError> {
    let pairs = candidate_pairs(catalog, roles, exclude);
    let total = pairs.len();
    let mut candidates = Vec::new();

    for (i, (source_id, target_id)) in pairs.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(OntologyError::Cancelled);
        }
        if let Some(c) = measure_pair(executor, catalog, source_id, target_id, sample_limit, cancel).await? {
            candidates.push(c);
        }
        on_progress(i + 1, total);
    }

    tracing::info!(pairs = total, candidates = candidates.len(), "Collected relationship candidates");
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::config::AnalysisConfig;
    use crate::features;
    use crate::precedence::Writer;
    use crate::testing::{create_data_source, setup_db, shop_executor, FakeExecutor};
    use sea_orm::DatabaseConnection;

    async fn snapshot(db: &DatabaseConnection, exec: &FakeExecutor) -> (Catalog, HashMap<Uuid, ColumnRole>) {
        let ds = create_data_source(db).await;
        let cancel = CancellationToken::new();
        let mut live = Vec::new();
        for t in exec.list_tables(&cancel).await.unwrap() {
            let names: Vec<String> = t.columns.iter().map(|c| c.column_name.clone()).collect();
            let p = exec.table_profile(&t.table, &names, 10, &cancel).await.unwrap();
            live.push((t, Some(p)));
        }
        catalog::persist_snapshot(db, ds.project_id, ds.id, &live, 10).await.unwrap();
        let catalog = Catalog::load(db, ds.id).await.unwrap();
        let cfg = AnalysisConfig::default();
        for t in &catalog.tables {
            features::write_column_features(db, t, None, &cfg, &Writer::inferred("test"))
                .await
                .unwrap();
        }
        let ids = catalog.columns().map(|(_, c)| c.id).collect();
        let roles = features::load_column_roles(db, ids).await.unwrap();
        (catalog, roles)
    }

    #[tokio::test]
    async fn shop_yields_exactly_one_candidate() {
        let db = setup_db().await;
        let exec = shop_executor();
        let (catalog, roles) = snapshot(&db, &exec).await;

        let pairs = candidate_pairs(&catalog, &roles, &HashSet::new());
        // orders.customer_id against both integer keys
        assert_eq!(pairs.len(), 2);

        let progress = std::sync::Mutex::new(Vec::new());
        let candidates = collect_candidates(
            &exec,
            &catalog,
            &roles,
            &HashSet::new(),
            10,
            &CancellationToken::new(),
            &|done, total| progress.lock().unwrap().push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(candidates.len(), 1, "zero-match pair is dropped");
        let c = &candidates[0];
        assert_eq!(c.source.qualified_name(), "public.orders.customer_id");
        assert_eq!(c.target.qualified_name(), "public.customers.id");
        assert_eq!(c.stats.orphan_count, 0);
        assert_eq!(c.unit.source.samples, vec!["1", "2", "3"]);
        assert_eq!(*progress.lock().unwrap(), vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn excluded_pairs_and_failed_queries_are_skipped() {
        let db = setup_db().await;
        let mut exec = shop_executor();
        let source = ColumnRef::new("public", "orders", "customer_id");
        let target = ColumnRef::new("public", "customers", "id");
        exec.failing_joins.insert((source.clone(), target.clone()));
        let (catalog, roles) = snapshot(&db, &exec).await;

        let candidates = collect_candidates(
            &exec, &catalog, &roles, &HashSet::new(), 10, &CancellationToken::new(), &|_, _| {},
        )
        .await
        .unwrap();
        assert!(candidates.is_empty());

        let (_, s) = catalog.find_column(&source).unwrap();
        let (_, t) = catalog.find_column(&target).unwrap();
        let exclude = HashSet::from([(s.id, t.id)]);
        assert_eq!(candidate_pairs(&catalog, &roles, &exclude).len(), 1);
    }

    #[tokio::test]
    async fn connectivity_failure_is_fatal() {
        let db = setup_db().await;
        let mut exec = shop_executor();
        let (catalog, roles) = snapshot(&db, &exec).await;
        exec.unreachable = true;

        let err = collect_candidates(
            &exec, &catalog, &roles, &HashSet::new(), 10, &CancellationToken::new(), &|_, _| {},
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
