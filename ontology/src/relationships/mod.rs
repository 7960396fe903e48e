//! Relationship discovery: declared and trusted links first, then
//! data-driven candidates confirmed one by one by the semantic validator.

use std::collections::{HashMap, HashSet};

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::datasource::QueryExecutor;
use crate::entity::{column_metadata, relationship};
use crate::error::OntologyError;
use crate::model::{Cardinality, ColumnRole, DetectionMethod, Source};
use crate::precedence::{self, ColumnPatch, RelationshipFact, WriteOutcome, Writer};

pub mod candidates;
pub mod cardinality;
pub mod validator;

pub use candidates::{Candidate, collect_candidates, measure_pair};
pub use validator::{Validated, ValidationBatch, ValidationOutcome, validate_all};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationshipSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub skipped: usize,
}

impl RelationshipSummary {
    fn count(&mut self, outcome: WriteOutcome, accepted: bool) {
        match (outcome, accepted) {
            (WriteOutcome::Skipped, _) => self.skipped += 1,
            (_, true) => self.accepted += 1,
            (_, false) => self.rejected += 1,
        }
    }
}

pub async fn load_relationships<C: ConnectionTrait>(
    db: &C,
    data_source_id: Uuid,
) -> Result<Vec<relationship::Model>, OntologyError> {
    Ok(relationship::Entity::find()
        .filter(relationship::Column::DataSourceId.eq(data_source_id))
        .all(db)
        .await?)
}

/// Pairs the inferred pass must not re-evaluate: constraint relationships and
/// anything owned by a manual or agent writer.
pub async fn settled_pairs<C: ConnectionTrait>(
    db: &C,
    data_source_id: Uuid,
) -> Result<HashSet<(Uuid, Uuid)>, OntologyError> {
    Ok(load_relationships(db, data_source_id)
        .await?
        .into_iter()
        .filter(|r| {
            r.detection_method == DetectionMethod::Constraint.as_str()
                || r.source != Source::Inferred.as_str()
        })
        .map(|r| (r.source_column_id, r.target_column_id))
        .collect())
}

/// Record declared foreign keys and high-confidence upstream links.
/// No semantic calls; every recorded pair gets confidence 1.0.
pub async fn record_constraint_relationships<C: ConnectionTrait>(
    db: &C,
    executor: &dyn QueryExecutor,
    catalog: &Catalog,
    project_id: Uuid,
    data_source_id: Uuid,
    trusted_link_confidence: f64,
    writer: &Writer,
    cancel: &CancellationToken,
) -> Result<RelationshipSummary, OntologyError> {
    let mut pairs: Vec<(Uuid, Uuid)> = Vec::new();

    for fk in executor.declared_foreign_keys(cancel).await? {
        match (catalog.find_column(&fk.source), catalog.find_column(&fk.target)) {
            (Some((_, s)), Some((_, t))) => pairs.push((s.id, t.id)),
            _ => tracing::debug!(
                source = %fk.source.qualified_name(),
                target = %fk.target.qualified_name(),
                "Declared foreign key outside the snapshot, ignoring"
            ),
        }
    }

    let column_ids: Vec<Uuid> = catalog.columns().map(|(_, c)| c.id).collect();
    if !column_ids.is_empty() {
        let trusted = column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.is_in(column_ids))
            .filter(column_metadata::Column::FkTargetColumnId.is_not_null())
            .filter(column_metadata::Column::FkConfidence.gte(trusted_link_confidence))
            // links this pass or the validator recorded are not upstream evidence
            .filter(column_metadata::Column::Source.ne(Source::Inferred.as_str()))
            .all(db)
            .await?;
        for link in trusted {
            let Some(target_id) = link.fk_target_column_id else {
                continue;
            };
            match catalog.column(target_id) {
                Some((_, target)) if candidates::is_target(target) => {
                    pairs.push((link.schema_column_id, target_id))
                }
                _ => tracing::warn!(
                    column_id = %link.schema_column_id,
                    target_id = %target_id,
                    "Trusted link does not point at a unique column, ignoring"
                ),
            }
        }
    }

    let mut seen = HashSet::new();
    let mut summary = RelationshipSummary::default();
    for (source_id, target_id) in pairs {
        if !seen.insert((source_id, target_id)) {
            continue;
        }
        let Some((_, source)) = catalog.column(source_id) else {
            continue;
        };
        let cardinality = if source.is_unique {
            Cardinality::OneToOne
        } else {
            Cardinality::ManyToOne
        };
        let fact = RelationshipFact {
            project_id,
            data_source_id,
            source_column_id: source_id,
            target_column_id: target_id,
            cardinality,
            confidence: 1.0,
            detection_method: DetectionMethod::Constraint,
            matched_count: None,
            orphan_count: None,
            reasoning: Some("declared constraint".to_string()),
            rejection_reason: None,
            source_role: None,
        };
        let outcome = precedence::write_relationship(db, &fact, writer).await?;
        if outcome.is_written() {
            mark_foreign_key(db, source_id, target_id, 1.0, writer).await?;
        }
        summary.count(outcome, true);
    }

    tracing::info!(
        project_id = %project_id,
        recorded = summary.accepted,
        skipped = summary.skipped,
        "Recorded constraint relationships"
    );
    Ok(summary)
}

/// Record a relationship stated by a person or agent rather than measured:
/// confidence 1.0, detection method `constraint`, and the source column
/// marked as a foreign key when the write goes through.
#[allow(clippy::too_many_arguments)]
pub async fn record_declared<C: ConnectionTrait>(
    db: &C,
    project_id: Uuid,
    data_source_id: Uuid,
    source_column_id: Uuid,
    target_column_id: Uuid,
    cardinality: Cardinality,
    reasoning: &str,
    writer: &Writer,
) -> Result<WriteOutcome, OntologyError> {
    let fact = RelationshipFact {
        project_id,
        data_source_id,
        source_column_id,
        target_column_id,
        cardinality,
        confidence: 1.0,
        detection_method: DetectionMethod::Constraint,
        matched_count: None,
        orphan_count: None,
        reasoning: Some(reasoning.to_string()),
        rejection_reason: None,
        source_role: None,
    };
    let outcome = precedence::write_relationship(db, &fact, writer).await?;
    if outcome.is_written() {
        mark_foreign_key(db, source_column_id, target_column_id, 1.0, writer).await?;
    }
    Ok(outcome)
}

async fn mark_foreign_key<C: ConnectionTrait>(
    db: &C,
    source_id: Uuid,
    target_id: Uuid,
    confidence: f64,
    writer: &Writer,
) -> Result<(), OntologyError> {
    let patch = ColumnPatch {
        role: Some(ColumnRole::ForeignKey),
        fk_target_column_id: Some(target_id),
        fk_confidence: Some(confidence),
        ..Default::default()
    };
    precedence::write_column_metadata(db, source_id, &patch, writer).await?;
    Ok(())
}

/// Persist validated candidates. Rejections keep their reason.
pub async fn persist_validated<C: ConnectionTrait>(
    db: &C,
    project_id: Uuid,
    data_source_id: Uuid,
    results: &[Validated],
    writer: &Writer,
) -> Result<RelationshipSummary, OntologyError> {
    let mut summary = RelationshipSummary::default();
    for v in results {
        let c = &v.candidate;
        let mut fact = RelationshipFact {
            project_id,
            data_source_id,
            source_column_id: c.source_column_id,
            target_column_id: c.target_column_id,
            cardinality: Cardinality::Unknown,
            confidence: 0.0,
            detection_method: DetectionMethod::Inferred,
            matched_count: Some(c.stats.matched_count),
            orphan_count: Some(c.stats.orphan_count),
            reasoning: None,
            rejection_reason: None,
            source_role: None,
        };
        match &v.outcome {
            ValidationOutcome::Accepted {
                cardinality,
                confidence,
                reasoning,
                source_role,
            } => {
                fact.cardinality = *cardinality;
                fact.confidence = *confidence;
                fact.reasoning = Some(reasoning.clone());
                fact.source_role = source_role.clone();
            }
            ValidationOutcome::Rejected {
                reason,
                confidence,
                reasoning,
            } => {
                fact.cardinality = cardinality::infer_from_stats(&c.stats);
                fact.confidence = *confidence;
                fact.reasoning = reasoning.clone();
                fact.rejection_reason = Some(reason.clone());
            }
        }

        let outcome = precedence::write_relationship(db, &fact, writer).await?;
        if outcome.is_written() {
            if let ValidationOutcome::Accepted { confidence, .. } = &v.outcome {
                mark_foreign_key(db, c.source_column_id, c.target_column_id, *confidence, writer)
                    .await?;
            }
        }
        summary.count(outcome, v.outcome.is_accepted());
    }
    Ok(summary)
}

/// Role lookup for candidate collection.
pub async fn column_roles<C: ConnectionTrait>(
    db: &C,
    catalog: &Catalog,
) -> Result<HashMap<Uuid, ColumnRole>, OntologyError> {
    crate::features::load_column_roles(db, catalog.columns().map(|(_, c)| c.id).collect()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::config::AnalysisConfig;
    use crate::datasource::{ColumnRef, DeclaredForeignKey};
    use crate::features;
    use crate::testing::{FakeExecutor, FakeSemantic, create_data_source, setup_db, shop_executor};
    use sea_orm::DatabaseConnection;

    async fn prepare(db: &DatabaseConnection, exec: &FakeExecutor) -> (Uuid, Uuid, Catalog) {
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
        for t in &catalog.tables {
            features::write_column_features(db, t, None, &AnalysisConfig::default(), &Writer::inferred("test"))
                .await
                .unwrap();
        }
        (ds.project_id, ds.id, catalog)
    }

    #[tokio::test]
    async fn declared_constraints_are_recorded_at_full_confidence() {
        let db = setup_db().await;
        let mut exec = shop_executor();
        exec.foreign_keys.push(DeclaredForeignKey {
            source: ColumnRef::new("public", "orders", "customer_id"),
            target: ColumnRef::new("public", "customers", "id"),
        });
        let (project_id, ds_id, catalog) = prepare(&db, &exec).await;
        let writer = Writer::inferred("pipeline");

        let summary = record_constraint_relationships(
            &db, &exec, &catalog, project_id, ds_id, 0.9, &writer, &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.accepted, 1);

        let rows = load_relationships(&db, ds_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].confidence, 1.0);
        assert_eq!(rows[0].detection_method, "constraint");
        assert_eq!(rows[0].cardinality, "N:1");

        // the inferred pass leaves the pair alone
        let settled = settled_pairs(&db, ds_id).await.unwrap();
        let roles = column_roles(&db, &catalog).await.unwrap();
        let candidates = collect_candidates(
            &exec, &catalog, &roles, &settled, 10, &CancellationToken::new(), &|_, _| {},
        )
        .await
        .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn only_non_inferred_links_are_trusted() {
        let db = setup_db().await;
        let exec = shop_executor();
        let (project_id, ds_id, catalog) = prepare(&db, &exec).await;
        let (_, source) = catalog.find_column(&ColumnRef::new("public", "orders", "customer_id")).unwrap();
        let (_, target) = catalog.find_column(&ColumnRef::new("public", "customers", "id")).unwrap();
        let (source_id, target_id) = (source.id, target.id);
        let cancel = CancellationToken::new();

        // a validated link written by the pipeline itself
        mark_foreign_key(&db, source_id, target_id, 0.95, &Writer::inferred("pipeline")).await.unwrap();
        let summary = record_constraint_relationships(
            &db, &exec, &catalog, project_id, ds_id, 0.9, &Writer::inferred("pipeline"), &cancel,
        )
        .await
        .unwrap();
        assert_eq!(summary.accepted, 0);
        assert!(load_relationships(&db, ds_id).await.unwrap().is_empty());

        // the same link stated by an agent is trusted
        mark_foreign_key(&db, source_id, target_id, 0.95, &Writer::new(Source::Agent, "assistant"))
            .await
            .unwrap();
        let summary = record_constraint_relationships(
            &db, &exec, &catalog, project_id, ds_id, 0.9, &Writer::inferred("pipeline"), &cancel,
        )
        .await
        .unwrap();
        assert_eq!(summary.accepted, 1);
        let rows = load_relationships(&db, ds_id).await.unwrap();
        assert_eq!(rows[0].detection_method, "constraint");
    }

    #[tokio::test]
    async fn orders_customers_end_to_end() {
        let db = setup_db().await;
        let exec = shop_executor();
        let (project_id, ds_id, catalog) = prepare(&db, &exec).await;
        let client = FakeSemantic::default();
        let writer = Writer::inferred("pipeline");
        let cancel = CancellationToken::new();

        let roles = column_roles(&db, &catalog).await.unwrap();
        let settled = settled_pairs(&db, ds_id).await.unwrap();
        let candidates = collect_candidates(&exec, &catalog, &roles, &settled, 10, &cancel, &|_, _| {})
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);

        let batch = validate_all(&client, candidates, 4, 0.5, &cancel, &|_, _| {})
            .await
            .unwrap();
        let summary = persist_validated(&db, project_id, ds_id, &batch.results, &writer)
            .await
            .unwrap();
        assert_eq!(summary, RelationshipSummary { accepted: 1, rejected: 0, skipped: 0 });

        let rows = load_relationships(&db, ds_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.detection_method, "inferred");
        assert_eq!(r.cardinality, "N:1");
        assert_eq!(r.orphan_count, Some(0));
        assert!(r.is_accepted());
        assert_eq!(catalog.column_ref(r.source_column_id).unwrap().qualified_name(), "public.orders.customer_id");
        assert_eq!(catalog.column_ref(r.target_column_id).unwrap().qualified_name(), "public.customers.id");

        let roles = column_roles(&db, &catalog).await.unwrap();
        assert_eq!(roles[&r.source_column_id], ColumnRole::ForeignKey);
    }

    #[tokio::test]
    async fn rejected_candidates_keep_their_reason() {
        let db = setup_db().await;
        let exec = shop_executor();
        let (project_id, ds_id, catalog) = prepare(&db, &exec).await;
        let client = FakeSemantic {
            default: crate::testing::FakeOutcome::Verdict(crate::testing::verdict(true, 0.2, "N:1")),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let roles = column_roles(&db, &catalog).await.unwrap();
        let candidates = collect_candidates(&exec, &catalog, &roles, &HashSet::new(), 10, &cancel, &|_, _| {})
            .await
            .unwrap();
        let batch = validate_all(&client, candidates, 2, 0.5, &cancel, &|_, _| {})
            .await
            .unwrap();
        persist_validated(&db, project_id, ds_id, &batch.results, &Writer::inferred("pipeline"))
            .await
            .unwrap();

        let rows = load_relationships(&db, ds_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rejection_reason.as_deref(), Some(validator::LOW_CONFIDENCE));
    }
}
