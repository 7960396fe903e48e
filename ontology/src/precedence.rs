//! Provenance-aware writes for column metadata, table metadata and
//! relationships.
//!
//! A writer may replace a fact only if its source has at least the
//! precedence of the fact's current owner (manual > agent > inferred), the
//! fact does not exist yet, or the write is forced. A refused write is not an
//! error: it returns [`WriteOutcome::Skipped`] and touches nothing. Accepted
//! writes only change the fields the writer supplied.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::entity::{column_metadata, relationship, table_metadata};
use crate::error::OntologyError;
use crate::model::{Cardinality, ColumnRole, DetectionMethod, Source, TableRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Skipped,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        !matches!(self, WriteOutcome::Skipped)
    }
}

/// Who is writing and with which provenance.
#[derive(Debug, Clone)]
pub struct Writer {
    pub source: Source,
    pub actor: String,
    pub force: bool,
}

impl Writer {
    pub fn new(source: Source, actor: impl Into<String>) -> Self {
        Self {
            source,
            actor: actor.into(),
            force: false,
        }
    }

    pub fn inferred(actor: impl Into<String>) -> Self {
        Self::new(Source::Inferred, actor)
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Whether this writer may replace a fact currently owned by `owner`.
    pub fn may_overwrite(&self, owner: &str) -> bool {
        if self.force {
            return true;
        }
        match owner.parse::<Source>() {
            Ok(owner) => self.source.precedence() >= owner.precedence(),
            // Unknown provenance is treated as the weakest writer
            Err(_) => true,
        }
    }
}

fn to_json_list(values: &[String]) -> Option<String> {
    serde_json::to_string(values).ok()
}

// ---------- column metadata ----------

#[derive(Debug, Clone, Default)]
pub struct ColumnPatch {
    pub purpose: Option<String>,
    pub role: Option<ColumnRole>,
    pub semantic_type: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub synonyms: Option<Vec<String>>,
    pub fk_target_column_id: Option<Uuid>,
    pub fk_confidence: Option<f64>,
    pub description: Option<String>,
}

impl ColumnPatch {
    pub fn is_empty(&self) -> bool {
        self.purpose.is_none()
            && self.role.is_none()
            && self.semantic_type.is_none()
            && self.enum_values.is_none()
            && self.synonyms.is_none()
            && self.fk_target_column_id.is_none()
            && self.fk_confidence.is_none()
            && self.description.is_none()
    }
}

pub async fn write_column_metadata<C: ConnectionTrait>(
    db: &C,
    schema_column_id: Uuid,
    patch: &ColumnPatch,
    writer: &Writer,
) -> Result<WriteOutcome, OntologyError> {
    let now = Utc::now().naive_utc();
    let existing = column_metadata::Entity::find()
        .filter(column_metadata::Column::SchemaColumnId.eq(schema_column_id))
        .one(db)
        .await?;

    match existing {
        Some(current) => {
            if !writer.may_overwrite(&current.source) {
                tracing::debug!(
                    column_id = %schema_column_id,
                    owner = %current.source,
                    writer = %writer.source,
                    "Skipping column metadata write: lower precedence"
                );
                return Ok(WriteOutcome::Skipped);
            }
            let mut active: column_metadata::ActiveModel = current.into();
            if let Some(ref v) = patch.purpose {
                active.purpose = Set(Some(v.clone()));
            }
            if let Some(role) = patch.role {
                active.role = Set(Some(role.as_str().to_string()));
            }
            if let Some(ref v) = patch.semantic_type {
                active.semantic_type = Set(Some(v.clone()));
            }
            if let Some(ref v) = patch.enum_values {
                active.enum_values = Set(to_json_list(v));
            }
            if let Some(ref v) = patch.synonyms {
                active.synonyms = Set(to_json_list(v));
            }
            if let Some(v) = patch.fk_target_column_id {
                active.fk_target_column_id = Set(Some(v));
            }
            if let Some(v) = patch.fk_confidence {
                active.fk_confidence = Set(Some(v));
            }
            if let Some(ref v) = patch.description {
                active.description = Set(Some(v.clone()));
            }
            active.source = Set(writer.source.as_str().to_string());
            active.updated_by = Set(writer.actor.clone());
            active.updated_at = Set(now);
            active.update(db).await?;
            Ok(WriteOutcome::Updated)
        }
        None => {
            column_metadata::ActiveModel {
                id: Set(Uuid::now_v7()),
                schema_column_id: Set(schema_column_id),
                purpose: Set(patch.purpose.clone()),
                role: Set(patch.role.map(|r| r.as_str().to_string())),
                semantic_type: Set(patch.semantic_type.clone()),
                enum_values: Set(patch.enum_values.as_deref().and_then(to_json_list)),
                synonyms: Set(patch.synonyms.as_deref().and_then(to_json_list)),
                fk_target_column_id: Set(patch.fk_target_column_id),
                fk_confidence: Set(patch.fk_confidence),
                description: Set(patch.description.clone()),
                source: Set(writer.source.as_str().to_string()),
                created_by: Set(writer.actor.clone()),
                updated_by: Set(writer.actor.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            Ok(WriteOutcome::Created)
        }
    }
}

// ---------- table metadata ----------

#[derive(Debug, Clone, Default)]
pub struct TablePatch {
    pub entity_name: Option<String>,
    pub table_role: Option<TableRole>,
    pub description: Option<String>,
    pub synonyms: Option<Vec<String>>,
}

pub async fn write_table_metadata<C: ConnectionTrait>(
    db: &C,
    schema_table_id: Uuid,
    patch: &TablePatch,
    writer: &Writer,
) -> Result<WriteOutcome, OntologyError> {
    let now = Utc::now().naive_utc();
    let existing = table_metadata::Entity::find()
        .filter(table_metadata::Column::SchemaTableId.eq(schema_table_id))
        .one(db)
        .await?;

    match existing {
        Some(current) => {
            if !writer.may_overwrite(&current.source) {
                tracing::debug!(
                    table_id = %schema_table_id,
                    owner = %current.source,
                    writer = %writer.source,
                    "Skipping table metadata write: lower precedence"
                );
                return Ok(WriteOutcome::Skipped);
            }
            let mut active: table_metadata::ActiveModel = current.into();
            if let Some(ref v) = patch.entity_name {
                active.entity_name = Set(Some(v.clone()));
            }
            if let Some(role) = patch.table_role {
                active.table_role = Set(Some(role.as_str().to_string()));
            }
            if let Some(ref v) = patch.description {
                active.description = Set(Some(v.clone()));
            }
            if let Some(ref v) = patch.synonyms {
                active.synonyms = Set(to_json_list(v));
            }
            active.source = Set(writer.source.as_str().to_string());
            active.updated_by = Set(writer.actor.clone());
            active.updated_at = Set(now);
            active.update(db).await?;
            Ok(WriteOutcome::Updated)
        }
        None => {
            table_metadata::ActiveModel {
                id: Set(Uuid::now_v7()),
                schema_table_id: Set(schema_table_id),
                entity_name: Set(patch.entity_name.clone()),
                table_role: Set(patch.table_role.map(|r| r.as_str().to_string())),
                description: Set(patch.description.clone()),
                synonyms: Set(patch.synonyms.as_deref().and_then(to_json_list)),
                source: Set(writer.source.as_str().to_string()),
                created_by: Set(writer.actor.clone()),
                updated_by: Set(writer.actor.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            Ok(WriteOutcome::Created)
        }
    }
}

// ---------- relationships ----------

/// A relationship decision. `rejection_reason` is set for evaluated and
/// declined candidates; optional statistics are only written when present.
#[derive(Debug, Clone)]
pub struct RelationshipFact {
    pub project_id: Uuid,
    pub data_source_id: Uuid,
    pub source_column_id: Uuid,
    pub target_column_id: Uuid,
    pub cardinality: Cardinality,
    pub confidence: f64,
    pub detection_method: DetectionMethod,
    pub matched_count: Option<i64>,
    pub orphan_count: Option<i64>,
    pub reasoning: Option<String>,
    pub rejection_reason: Option<String>,
    pub source_role: Option<String>,
}

pub async fn find_relationship<C: ConnectionTrait>(
    db: &C,
    source_column_id: Uuid,
    target_column_id: Uuid,
) -> Result<Option<relationship::Model>, OntologyError> {
    Ok(relationship::Entity::find()
        .filter(relationship::Column::SourceColumnId.eq(source_column_id))
        .filter(relationship::Column::TargetColumnId.eq(target_column_id))
        .one(db)
        .await?)
}

pub async fn write_relationship<C: ConnectionTrait>(
    db: &C,
    fact: &RelationshipFact,
    writer: &Writer,
) -> Result<WriteOutcome, OntologyError> {
    let now = Utc::now().naive_utc();
    match find_relationship(db, fact.source_column_id, fact.target_column_id).await? {
        Some(current) => {
            if !writer.may_overwrite(&current.source) {
                tracing::debug!(
                    relationship_id = %current.id,
                    owner = %current.source,
                    writer = %writer.source,
                    "Skipping relationship write: lower precedence"
                );
                return Ok(WriteOutcome::Skipped);
            }
            let mut active: relationship::ActiveModel = current.into();
            active.cardinality = Set(fact.cardinality.as_str().to_string());
            active.confidence = Set(fact.confidence);
            active.detection_method = Set(fact.detection_method.as_str().to_string());
            active.rejection_reason = Set(fact.rejection_reason.clone());
            if fact.matched_count.is_some() {
                active.matched_count = Set(fact.matched_count);
            }
            if fact.orphan_count.is_some() {
                active.orphan_count = Set(fact.orphan_count);
            }
            if fact.reasoning.is_some() {
                active.reasoning = Set(fact.reasoning.clone());
            }
            if fact.source_role.is_some() {
                active.source_role = Set(fact.source_role.clone());
            }
            active.source = Set(writer.source.as_str().to_string());
            active.updated_by = Set(writer.actor.clone());
            active.updated_at = Set(now);
            active.update(db).await?;
            Ok(WriteOutcome::Updated)
        }
        None => {
            relationship::ActiveModel {
                id: Set(Uuid::now_v7()),
                project_id: Set(fact.project_id),
                data_source_id: Set(fact.data_source_id),
                source_column_id: Set(fact.source_column_id),
                target_column_id: Set(fact.target_column_id),
                cardinality: Set(fact.cardinality.as_str().to_string()),
                confidence: Set(fact.confidence),
                detection_method: Set(fact.detection_method.as_str().to_string()),
                matched_count: Set(fact.matched_count),
                orphan_count: Set(fact.orphan_count),
                reasoning: Set(fact.reasoning.clone()),
                rejection_reason: Set(fact.rejection_reason.clone()),
                source_role: Set(fact.source_role.clone()),
                source: Set(writer.source.as_str().to_string()),
                created_by: Set(writer.actor.clone()),
                updated_by: Set(writer.actor.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            Ok(WriteOutcome::Created)
        }
    }
}

/// Change only the cardinality of an existing relationship.
pub async fn write_cardinality<C: ConnectionTrait>(
    db: &C,
    relationship_id: Uuid,
    cardinality: Cardinality,
    writer: &Writer,
) -> Result<WriteOutcome, OntologyError> {
    let current = relationship::Entity::find_by_id(relationship_id)
        .one(db)
        .await?
        .ok_or_else(|| OntologyError::NotFound(format!("relationship {relationship_id}")))?;
    if !writer.may_overwrite(&current.source) {
        tracing::debug!(
            relationship_id = %relationship_id,
            owner = %current.source,
            "Skipping cardinality write: lower precedence"
        );
        return Ok(WriteOutcome::Skipped);
    }
    let mut active: relationship::ActiveModel = current.into();
    active.cardinality = Set(cardinality.as_str().to_string());
    active.source = Set(writer.source.as_str().to_string());
    active.updated_by = Set(writer.actor.clone());
    active.updated_at = Set(Utc::now().naive_utc());
    active.update(db).await?;
    Ok(WriteOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, Catalog};
    use crate::datasource::ColumnRef;
    use crate::testing::{create_data_source, live_table, setup_db};
    use sea_orm::DatabaseConnection;

    async fn seeded_column(db: &DatabaseConnection) -> (Uuid, Uuid, Uuid) {
        let ds = create_data_source(db).await;
        let orders = live_table(
            "public",
            "orders",
            &[("id", "integer", true, true), ("status", "text", false, false)],
        );
        catalog::persist_snapshot(db, ds.project_id, ds.id, &[(orders, None)], 10)
            .await
            .unwrap();
        let catalog = Catalog::load(db, ds.id).await.unwrap();
        let (t, c) = catalog
            .find_column(&ColumnRef::new("public", "orders", "status"))
            .unwrap();
        (ds.id, t.table.id, c.id)
    }

    fn described(text: &str) -> ColumnPatch {
        ColumnPatch {
            description: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn precedence_table() {
        let inferred = Writer::inferred("pipeline");
        let agent = Writer::new(Source::Agent, "agent-1");
        let manual = Writer::new(Source::Manual, "alice");
        assert!(!inferred.may_overwrite("manual"));
        assert!(!inferred.may_overwrite("agent"));
        assert!(inferred.may_overwrite("inferred"));
        assert!(!agent.may_overwrite("manual"));
        assert!(agent.may_overwrite("agent"));
        assert!(manual.may_overwrite("inferred"));
        assert!(inferred.clone().forced().may_overwrite("manual"));
    }

    #[tokio::test]
    async fn inferred_write_over_manual_fact_is_a_silent_noop() {
        let db = setup_db().await;
        let (_, _, column_id) = seeded_column(&db).await;
        let manual = Writer::new(Source::Manual, "alice");
        let inferred = Writer::inferred("pipeline");

        let out = write_column_metadata(&db, column_id, &described("Order state"), &manual)
            .await
            .unwrap();
        assert_eq!(out, WriteOutcome::Created);

        for _ in 0..2 {
            let out = write_column_metadata(&db, column_id, &described("status text"), &inferred)
                .await
                .unwrap();
            assert_eq!(out, WriteOutcome::Skipped);
        }

        let row = column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.eq(column_id))
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.description.as_deref(), Some("Order state"));
        assert_eq!(row.source, "manual");
        assert_eq!(row.updated_by, "alice");
    }

    #[tokio::test]
    async fn accepted_write_only_touches_supplied_fields() {
        let db = setup_db().await;
        let (_, _, column_id) = seeded_column(&db).await;
        let agent = Writer::new(Source::Agent, "agent-1");

        write_column_metadata(
            &db,
            column_id,
            &ColumnPatch {
                role: Some(ColumnRole::Enumeration),
                enum_values: Some(vec!["open".into(), "shipped".into()]),
                ..Default::default()
            },
            &Writer::inferred("pipeline"),
        )
        .await
        .unwrap();

        let out = write_column_metadata(&db, column_id, &described("Order state"), &agent)
            .await
            .unwrap();
        assert_eq!(out, WriteOutcome::Updated);

        let row = column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.eq(column_id))
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.role.as_deref(), Some("enumeration"));
        assert_eq!(row.enum_value_list(), vec!["open", "shipped"]);
        assert_eq!(row.description.as_deref(), Some("Order state"));
        assert_eq!(row.source, "agent");
        assert_eq!(row.created_by, "pipeline");
        assert_eq!(row.updated_by, "agent-1");
    }

    #[tokio::test]
    async fn table_metadata_respects_precedence() {
        let db = setup_db().await;
        let (_, table_id, _) = seeded_column(&db).await;
        let patch = |name: &str| TablePatch {
            entity_name: Some(name.to_string()),
            ..Default::default()
        };

        write_table_metadata(&db, table_id, &patch("Order"), &Writer::new(Source::Agent, "a"))
            .await
            .unwrap();
        let out = write_table_metadata(&db, table_id, &patch("Orders"), &Writer::inferred("p"))
            .await
            .unwrap();
        assert_eq!(out, WriteOutcome::Skipped);
        let out = write_table_metadata(&db, table_id, &patch("SalesOrder"), &Writer::new(Source::Manual, "m"))
            .await
            .unwrap();
        assert_eq!(out, WriteOutcome::Updated);

        let row = table_metadata::Entity::find()
            .filter(table_metadata::Column::SchemaTableId.eq(table_id))
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.entity_name.as_deref(), Some("SalesOrder"));
    }

    #[tokio::test]
    async fn relationship_upsert_is_keyed_by_column_pair() {
        let db = setup_db().await;
        let (ds_id, _, status_id) = seeded_column(&db).await;
        let catalog = Catalog::load(&db, ds_id).await.unwrap();
        let (t, id_col) = catalog
            .find_column(&ColumnRef::new("public", "orders", "id"))
            .unwrap();
        let mut fact = RelationshipFact {
            project_id: t.table.project_id,
            data_source_id: ds_id,
            source_column_id: status_id,
            target_column_id: id_col.id,
            cardinality: Cardinality::ManyToOne,
            confidence: 0.4,
            detection_method: DetectionMethod::Inferred,
            matched_count: Some(1),
            orphan_count: Some(0),
            reasoning: Some("first".into()),
            rejection_reason: Some("low confidence".into()),
            source_role: None,
        };
        let writer = Writer::inferred("pipeline");
        assert_eq!(write_relationship(&db, &fact, &writer).await.unwrap(), WriteOutcome::Created);

        fact.rejection_reason = None;
        fact.confidence = 0.8;
        fact.reasoning = None;
        assert_eq!(write_relationship(&db, &fact, &writer).await.unwrap(), WriteOutcome::Updated);

        let rows = relationship::Entity::find().all(&db).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_accepted());
        assert_eq!(rows[0].reasoning.as_deref(), Some("first"));
        assert!((rows[0].confidence - 0.8).abs() < f64::EPSILON);
    }
}
