//! Operator-provided knowledge imported as manual facts.
//!
//! ```json
//! {
//!   "tables": [{"table": "public.orders", "entity_name": "Order"}],
//!   "columns": [{"column": "public.orders.status", "enum_values": ["open", "shipped"]}],
//!   "relationships": [{"source": "public.orders.customer_id", "target": "public.customers.id"}]
//! }
//! ```

use std::path::Path;

use sea_orm::ConnectionTrait;
use serde::Deserialize;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::datasource::{ColumnRef, TableRef};
use crate::error::OntologyError;
use crate::model::{Cardinality, ColumnRole, TableRole};
use crate::precedence::{self, ColumnPatch, TablePatch, Writer};
use crate::relationships;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeSeed {
    #[serde(default)]
    pub tables: Vec<TableSeed>,
    #[serde(default)]
    pub columns: Vec<ColumnSeed>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSeed {
    /// `schema.table`
    pub table: String,
    pub entity_name: Option<String>,
    pub table_role: Option<TableRole>,
    pub description: Option<String>,
    pub synonyms: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSeed {
    /// `schema.table.column`
    pub column: String,
    pub purpose: Option<String>,
    pub role: Option<ColumnRole>,
    pub semantic_type: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub synonyms: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipSeed {
    pub source: String,
    pub target: String,
    pub cardinality: Option<Cardinality>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub written: usize,
    pub skipped: usize,
    /// Entries naming objects absent from the snapshot.
    pub unresolved: Vec<String>,
}

/// Read and parse a seed file. A configured file that cannot be read or
/// parsed is a configuration error.
pub async fn load(path: &Path) -> Result<KnowledgeSeed, OntologyError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        OntologyError::Configuration(format!("cannot read knowledge seed {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        OntologyError::Configuration(format!("invalid knowledge seed {}: {e}", path.display()))
    })
}

fn tally(outcome: precedence::WriteOutcome, summary: &mut SeedSummary) {
    if outcome.is_written() {
        summary.written += 1;
    } else {
        summary.skipped += 1;
    }
}

fn resolve_column(catalog: &Catalog, qualified: &str) -> Option<Uuid> {
    let column = ColumnRef::parse(qualified)?;
    catalog.find_column(&column).map(|(_, c)| c.id)
}

pub async fn apply<C: ConnectionTrait>(
    db: &C,
    catalog: &Catalog,
    project_id: Uuid,
    data_source_id: Uuid,
    seed: &KnowledgeSeed,
    writer: &Writer,
) -> Result<SeedSummary, OntologyError> {
    let mut summary = SeedSummary::default();

    for t in &seed.tables {
        let Some(table) = TableRef::parse(&t.table).and_then(|r| catalog.find_table(&r)) else {
            summary.unresolved.push(t.table.clone());
            continue;
        };
        let patch = TablePatch {
            entity_name: t.entity_name.clone(),
            table_role: t.table_role,
            description: t.description.clone(),
            synonyms: t.synonyms.clone(),
        };
        tally(precedence::write_table_metadata(db, table.table.id, &patch, writer).await?, &mut summary);
    }

    for c in &seed.columns {
        let Some(column_id) = resolve_column(catalog, &c.column) else {
            summary.unresolved.push(c.column.clone());
            continue;
        };
        let patch = ColumnPatch {
            purpose: c.purpose.clone(),
            role: c.role,
            semantic_type: c.semantic_type.clone(),
            enum_values: c.enum_values.clone(),
            synonyms: c.synonyms.clone(),
            description: c.description.clone(),
            ..Default::default()
        };
        if patch.is_empty() {
            continue;
        }
        tally(precedence::write_column_metadata(db, column_id, &patch, writer).await?, &mut summary);
    }

    for r in &seed.relationships {
        let (Some(source_id), Some(target_id)) =
            (resolve_column(catalog, &r.source), resolve_column(catalog, &r.target))
        else {
            summary.unresolved.push(format!("{} -> {}", r.source, r.target));
            continue;
        };
        let outcome = relationships::record_declared(
            db,
            project_id,
            data_source_id,
            source_id,
            target_id,
            r.cardinality.unwrap_or(Cardinality::ManyToOne),
            "knowledge seed",
            writer,
        )
        .await?;
        tally(outcome, &mut summary);
    }

    Ok(summary)
}
