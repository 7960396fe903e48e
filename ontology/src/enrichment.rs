//! LLM-backed descriptions: entity names for tables, purposes for columns.
//! Results are written as inferred facts through the precedence check.

use std::collections::{BTreeSet, HashMap};

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Catalog, TableSnapshot};
use crate::entity::{column_metadata, relationship, schema_column, table_metadata};
use crate::error::OntologyError;
use crate::precedence::{self, ColumnPatch, TablePatch, WriteOutcome, Writer};
use crate::relationships::candidates::evidence;
use crate::semantic::{ColumnContext, SemanticClient, SemanticError, TableContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub written: usize,
    pub skipped: usize,
    /// Items whose call or answer failed; the rest were still processed.
    pub failed: usize,
}

impl EnrichmentSummary {
    fn count(&mut self, outcome: WriteOutcome) {
        if outcome.is_written() {
            self.written += 1;
        } else {
            self.skipped += 1;
        }
    }
}

async fn call<T>(
    fut: impl std::future::Future<Output = Result<T, SemanticError>>,
    cancel: &CancellationToken,
) -> Result<T, OntologyError> {
    tokio::select! {
        r = fut => r.map_err(OntologyError::from),
        _ = cancel.cancelled() => Err(OntologyError::Cancelled),
    }
}

fn related_tables(catalog: &Catalog, table: &TableSnapshot, relationships: &[relationship::Model]) -> Vec<String> {
    let own: BTreeSet<Uuid> = table.columns.iter().map(|c| c.id).collect();
    let mut related = BTreeSet::new();
    for r in relationships.iter().filter(|r| r.is_accepted()) {
        let other = if own.contains(&r.source_column_id) {
            r.target_column_id
        } else if own.contains(&r.target_column_id) {
            r.source_column_id
        } else {
            continue;
        };
        if let Some(column) = catalog.column_ref(other) {
            related.insert(column.table.qualified_name());
        }
    }
    related.remove(&table.table_ref().qualified_name());
    related.into_iter().collect()
}

pub fn table_context(
    catalog: &Catalog,
    table: &TableSnapshot,
    table_role: Option<String>,
    relationships: &[relationship::Model],
    sample_limit: usize,
) -> TableContext {
    TableContext {
        qualified_name: table.table_ref().qualified_name(),
        table_role,
        row_count: table.table.row_count,
        columns: table
            .columns
            .iter()
            .map(|c| evidence(table, c, sample_limit))
            .collect(),
        related_tables: related_tables(catalog, table, relationships),
    }
}

pub fn column_context(
    table: &TableSnapshot,
    column: &schema_column::Model,
    meta: Option<&column_metadata::Model>,
    sample_limit: usize,
) -> ColumnContext {
    ColumnContext {
        table: table.table_ref().qualified_name(),
        column: evidence(table, column, sample_limit),
        role: meta.and_then(|m| m.role.clone()),
        enum_values: meta.map(|m| m.enum_value_list()).unwrap_or_default(),
    }
}

/// Describe every table in `catalog` (or only `only`). Per-table failures
/// are counted and logged; configuration failures abort.
#[allow(clippy::too_many_arguments)]
pub async fn enrich_tables<C: ConnectionTrait>(
    db: &C,
    client: &dyn SemanticClient,
    catalog: &Catalog,
    only: Option<Uuid>,
    writer: &Writer,
    sample_limit: usize,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<EnrichmentSummary, OntologyError> {
    let tables: Vec<&TableSnapshot> = catalog
        .tables
        .iter()
        .filter(|t| only.is_none_or(|id| id == t.table.id))
        .collect();
    let table_ids: Vec<Uuid> = tables.iter().map(|t| t.table.id).collect();
    let existing: HashMap<Uuid, table_metadata::Model> = if table_ids.is_empty() {
        HashMap::new()
    } else {
        table_metadata::Entity::find()
            .filter(table_metadata::Column::SchemaTableId.is_in(table_ids))
            .all(db)
            .await?
            .into_iter()
            .map(|m| (m.schema_table_id, m))
            .collect()
    };
    let data_source_id = tables.first().map(|t| t.table.data_source_id);
    let relationships = match data_source_id {
        Some(id) => crate::relationships::load_relationships(db, id).await?,
        None => Vec::new(),
    };

    let total = tables.len();
    let mut summary = EnrichmentSummary::default();
    for (i, table) in tables.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(OntologyError::Cancelled);
        }
        let meta = existing.get(&table.table.id);
        if meta.is_some_and(|m| !writer.may_overwrite(&m.source)) {
            summary.skipped += 1;
            on_progress(i + 1, total);
            continue;
        }
        let ctx = table_context(
            catalog,
            table,
            meta.and_then(|m| m.table_role.clone()),
            &relationships,
            sample_limit,
        );
        match call(client.describe_table(&ctx), cancel).await {
            Ok(desc) => {
                let patch = TablePatch {
                    entity_name: Some(desc.entity_name),
                    description: Some(desc.description).filter(|d| !d.trim().is_empty()),
                    synonyms: Some(desc.synonyms).filter(|s| !s.is_empty()),
                    ..Default::default()
                };
                summary.count(precedence::write_table_metadata(db, table.table.id, &patch, writer).await?);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(table = %ctx.qualified_name, error = %e, "Table enrichment failed");
                summary.failed += 1;
            }
        }
        on_progress(i + 1, total);
    }
    Ok(summary)
}

/// Annotate the columns of `table` (or only the column named `only`).
pub async fn enrich_table_columns<C: ConnectionTrait>(
    db: &C,
    client: &dyn SemanticClient,
    table: &TableSnapshot,
    only: Option<&str>,
    writer: &Writer,
    sample_limit: usize,
    cancel: &CancellationToken,
) -> Result<EnrichmentSummary, OntologyError> {
    let columns: Vec<&schema_column::Model> = table
        .columns
        .iter()
        .filter(|c| only.is_none_or(|name| name == c.column_name))
        .collect();
    let ids: Vec<Uuid> = columns.iter().map(|c| c.id).collect();
    let existing: HashMap<Uuid, column_metadata::Model> = if ids.is_empty() {
        HashMap::new()
    } else {
        column_metadata::Entity::find()
            .filter(column_metadata::Column::SchemaColumnId.is_in(ids))
            .all(db)
            .await?
            .into_iter()
            .map(|m| (m.schema_column_id, m))
            .collect()
    };

    let mut summary = EnrichmentSummary::default();
    for column in columns {
        if cancel.is_cancelled() {
            return Err(OntologyError::Cancelled);
        }
        let meta = existing.get(&column.id);
        if meta.is_some_and(|m| !writer.may_overwrite(&m.source)) {
            summary.skipped += 1;
            continue;
        }
        let ctx = column_context(table, column, meta, sample_limit);
        match call(client.enrich_column(&ctx), cancel).await {
            Ok(annotation) => {
                let patch = ColumnPatch {
                    purpose: annotation.purpose,
                    semantic_type: annotation.semantic_type,
                    description: annotation.description,
                    synonyms: Some(annotation.synonyms).filter(|s| !s.is_empty()),
                    ..Default::default()
                };
                if patch.is_empty() {
                    continue;
                }
                summary.count(precedence::write_column_metadata(db, column.id, &patch, writer).await?);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(column = %ctx.column.qualified_name, error = %e, "Column enrichment failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Column annotations across the whole catalog, one table at a time.
pub async fn enrich_columns<C: ConnectionTrait>(
    db: &C,
    client: &dyn SemanticClient,
    catalog: &Catalog,
    writer: &Writer,
    sample_limit: usize,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<EnrichmentSummary, OntologyError> {
    let total = catalog.tables.len();
    let mut summary = EnrichmentSummary::default();
    for (i, table) in catalog.tables.iter().enumerate() {
        let s = enrich_table_columns(db, client, table, None, writer, sample_limit, cancel).await?;
        summary.written += s.written;
        summary.skipped += s.skipped;
        summary.failed += s.failed;
        on_progress(i + 1, total);
    }
    Ok(summary)
}
