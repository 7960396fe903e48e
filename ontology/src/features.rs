//! Deterministic column and table roles derived from types and statistics.
//! Names only serve as key evidence for integer columns.

use std::collections::{BTreeSet, HashMap};

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::catalog::TableSnapshot;
use crate::config::AnalysisConfig;
use crate::entity::{column_metadata, schema_column};
use crate::error::OntologyError;
use crate::model::{ColumnRole, TableRole, TypeFamily};
use crate::precedence::{self, ColumnPatch, TablePatch, WriteOutcome, Writer};

const TOKEN_MAX_LEN: usize = 64;
const REFERENCE_TABLE_MAX_ROWS: i64 = 1000;

/// Values short enough and few enough to be an enumeration.
pub fn enum_shaped(distinct: i64, values: &[String], cfg: &AnalysisConfig) -> bool {
    (2..=cfg.enum_max_distinct).contains(&distinct)
        && values
            .iter()
            .all(|v| v.chars().count() <= cfg.enum_max_value_length)
}

/// `id`, `customer_id`, `order_key`, `customerId`.
fn key_named(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let camel_id = name.len() > 2
        && name.ends_with("Id")
        && name[..name.len() - 2].ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
    lower == "id"
        || ["_id", "_key", "_fk", "_ref"].iter().any(|suffix| lower.ends_with(suffix))
        || camel_id
}

fn token_like(values: &[String]) -> bool {
    !values.is_empty()
        && values
            .iter()
            .all(|v| !v.is_empty() && v.len() <= TOKEN_MAX_LEN && !v.chars().any(char::is_whitespace))
}

pub fn classify_column(
    column: &schema_column::Model,
    row_count: Option<i64>,
    cfg: &AnalysisConfig,
) -> ColumnRole {
    // Composite-key members fall through and are classified like any other column
    if column.is_primary_key && column.is_unique {
        return ColumnRole::PrimaryKey;
    }

    match TypeFamily::of(&column.data_type) {
        TypeFamily::Timestamp | TypeFamily::Date => ColumnRole::Timestamp,
        TypeFamily::Boolean => ColumnRole::Flag,
        TypeFamily::Document => ColumnRole::Document,
        TypeFamily::Float | TypeFamily::Decimal => ColumnRole::Measure,
        TypeFamily::Uuid => ColumnRole::Identifier,
        // a bare integer is a count or amount unless something marks it as a key
        TypeFamily::Integer
            if column.is_primary_key || column.is_unique || key_named(&column.column_name) =>
        {
            ColumnRole::Identifier
        }
        TypeFamily::Integer => ColumnRole::Measure,
        TypeFamily::Text => {
            let samples = column.samples();
            let distinct = column.distinct_count.unwrap_or(0);
            let rows = row_count.unwrap_or(0);
            let repeats = distinct > 0 && distinct * 2 <= rows;
            if repeats && enum_shaped(distinct, &samples, cfg) {
                ColumnRole::Enumeration
            } else if token_like(&samples) {
                ColumnRole::Identifier
            } else {
                ColumnRole::Text
            }
        }
        TypeFamily::Binary | TypeFamily::Other => ColumnRole::Unknown,
    }
}

pub fn classify_table(
    table: &TableSnapshot,
    roles: &HashMap<Uuid, ColumnRole>,
) -> TableRole {
    let role_of = |c: &schema_column::Model| roles.get(&c.id).copied().unwrap_or(ColumnRole::Unknown);
    let has_pk = table.columns.iter().any(|c| c.is_primary_key);
    let references = table
        .columns
        .iter()
        .filter(|c| role_of(c).is_reference_like() && !(c.is_primary_key && c.is_unique))
        .count();
    let measures = table
        .columns
        .iter()
        .filter(|c| role_of(c) == ColumnRole::Measure)
        .count();
    let payload = table
        .columns
        .iter()
        .filter(|c| {
            !c.is_primary_key
                && !matches!(
                    role_of(c),
                    ColumnRole::Identifier | ColumnRole::ForeignKey | ColumnRole::Timestamp
                )
        })
        .count();
    let timestamps = table
        .columns
        .iter()
        .filter(|c| role_of(c) == ColumnRole::Timestamp)
        .count();
    let rows = table.table.row_count.unwrap_or(0);

    if references >= 2 && payload <= 1 {
        TableRole::Junction
    } else if references >= 2 || (references >= 1 && (measures >= 1 || timestamps >= 1)) {
        TableRole::Fact
    } else if has_pk && references == 0 && rows <= REFERENCE_TABLE_MAX_ROWS && payload <= 2 {
        TableRole::Reference
    } else if has_pk {
        TableRole::Dimension
    } else {
        TableRole::Standalone
    }
}

/// Sorted set union.
pub fn union_enum_values(existing: &[String], incoming: &[String]) -> Vec<String> {
    existing
        .iter()
        .chain(incoming.iter())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Stored roles for the given columns.
pub async fn load_column_roles<C: ConnectionTrait>(
    db: &C,
    column_ids: Vec<Uuid>,
) -> Result<HashMap<Uuid, ColumnRole>, OntologyError> {
    if column_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = column_metadata::Entity::find()
        .filter(column_metadata::Column::SchemaColumnId.is_in(column_ids))
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|m| {
            let role = m.role.as_deref()?.parse().ok()?;
            Some((m.schema_column_id, role))
        })
        .collect())
}

/// Write roles for the columns of one table, or a single column when `only`
/// is given. Returns how many facts were written.
pub async fn write_column_features<C: ConnectionTrait>(
    db: &C,
    table: &TableSnapshot,
    only: Option<&str>,
    cfg: &AnalysisConfig,
    writer: &Writer,
) -> Result<usize, OntologyError> {
    let mut written = 0;
    for column in &table.columns {
        if only.is_some_and(|name| name != column.column_name) {
            continue;
        }
        let role = classify_column(column, table.table.row_count, cfg);
        let mut patch = ColumnPatch {
            role: Some(role),
            ..Default::default()
        };
        if role == ColumnRole::Enumeration {
            let samples = column.samples();
            if samples.len() as i64 >= column.distinct_count.unwrap_or(i64::MAX) {
                patch.enum_values = Some(union_enum_values(&[], &samples));
            }
        }
        let outcome = precedence::write_column_metadata(db, column.id, &patch, writer).await?;
        if outcome.is_written() {
            written += 1;
        }
    }
    Ok(written)
}

pub async fn write_table_features<C: ConnectionTrait>(
    db: &C,
    table: &TableSnapshot,
    writer: &Writer,
) -> Result<WriteOutcome, OntologyError> {
    let roles = load_column_roles(db, table.columns.iter().map(|c| c.id).collect()).await?;
    let patch = TablePatch {
        table_role: Some(classify_table(table, &roles)),
        ..Default::default()
    };
    precedence::write_table_metadata(db, table.table.id, &patch, writer).await
}
