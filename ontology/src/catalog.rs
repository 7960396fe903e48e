//! Stored schema snapshot: `schema_table` / `schema_column` rows.
//!
//! Ids are deterministic (UUID v5 over the natural key), so re-introspecting
//! the same object always lands on the same row. Rows are soft-deleted and
//! revived when the object re-appears.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::datasource::{ColumnProfile, ColumnRef, LiveColumn, LiveTable, TableProfile, TableRef};
use crate::entity::{schema_column, schema_table};
use crate::error::OntologyError;

/// Namespace UUID for catalog fingerprints (UUID v5).
const CATALOG_NS: Uuid = Uuid::from_bytes([
    0x3f, 0x62, 0x0d, 0x95, 0xa4, 0x1c, 0x5e, 0x07, 0x9b, 0x2a, 0x61, 0xd8, 0x4e, 0x13, 0xc7, 0x5b,
]);

pub fn table_uuid(data_source_id: Uuid, table: &TableRef) -> Uuid {
    let key = format!("{data_source_id}:{}:{}", table.schema_name, table.table_name);
    Uuid::new_v5(&CATALOG_NS, key.as_bytes())
}

pub fn column_uuid(table_id: Uuid, column_name: &str) -> Uuid {
    let key = format!("{table_id}:{column_name}");
    Uuid::new_v5(&CATALOG_NS, key.as_bytes())
}

// ---------- in-memory view ----------

#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub table: schema_table::Model,
    pub columns: Vec<schema_column::Model>,
}

impl TableSnapshot {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.table.schema_name, &self.table.table_name)
    }

    pub fn column_ref(&self, column: &schema_column::Model) -> ColumnRef {
        ColumnRef {
            table: self.table_ref(),
            column_name: column.column_name.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&schema_column::Model> {
        self.columns.iter().find(|c| c.column_name == name)
    }
}

/// Active (not soft-deleted) snapshot of one data source, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tables: Vec<TableSnapshot>,
    by_column_id: HashMap<Uuid, (usize, usize)>,
}

impl Catalog {
    pub fn new(tables: Vec<TableSnapshot>) -> Self {
        let mut by_column_id = HashMap::new();
        for (ti, t) in tables.iter().enumerate() {
            for (ci, c) in t.columns.iter().enumerate() {
                by_column_id.insert(c.id, (ti, ci));
            }
        }
        Self {
            tables,
            by_column_id,
        }
    }

    pub async fn load<C: ConnectionTrait>(db: &C, data_source_id: Uuid) -> Result<Self, OntologyError> {
        let rows: Vec<(schema_table::Model, Vec<schema_column::Model>)> =
            schema_table::Entity::find()
                .filter(schema_table::Column::DataSourceId.eq(data_source_id))
                .filter(schema_table::Column::DeletedAt.is_null())
                .order_by_asc(schema_table::Column::SchemaName)
                .order_by_asc(schema_table::Column::TableName)
                .find_with_related(schema_column::Entity)
                .all(db)
                .await?;

        let tables = rows
            .into_iter()
            .map(|(table, columns)| {
                let mut columns: Vec<_> = columns
                    .into_iter()
                    .filter(|c| c.deleted_at.is_none())
                    .collect();
                columns.sort_by_key(|c| c.ordinal_position);
                TableSnapshot { table, columns }
            })
            .collect();
        Ok(Self::new(tables))
    }

    pub fn column(&self, id: Uuid) -> Option<(&TableSnapshot, &schema_column::Model)> {
        let &(ti, ci) = self.by_column_id.get(&id)?;
        let t = &self.tables[ti];
        Some((t, &t.columns[ci]))
    }

    pub fn column_ref(&self, id: Uuid) -> Option<ColumnRef> {
        self.column(id).map(|(t, c)| t.column_ref(c))
    }

    pub fn find_table(&self, table: &TableRef) -> Option<&TableSnapshot> {
        self.tables.iter().find(|t| {
            t.table.schema_name == table.schema_name && t.table.table_name == table.table_name
        })
    }

    pub fn find_column(&self, column: &ColumnRef) -> Option<(&TableSnapshot, &schema_column::Model)> {
        let t = self.find_table(&column.table)?;
        t.column(&column.column_name).map(|c| (t, c))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&TableSnapshot, &schema_column::Model)> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(move |c| (t, c)))
    }

    pub fn column_count(&self) -> usize {
        self.by_column_id.len()
    }
}

// ---------- writes ----------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub tables: usize,
    pub columns: usize,
    pub removed_tables: usize,
    pub removed_columns: usize,
}

/// Upsert one live table and its columns. Statistics are only overwritten
/// when a profile is supplied. Columns missing from `live.columns` are
/// soft-deleted.
pub async fn upsert_table<C: ConnectionTrait>(
    db: &C,
    project_id: Uuid,
    data_source_id: Uuid,
    live: &LiveTable,
    profile: Option<&TableProfile>,
    sample_limit: usize,
) -> Result<(schema_table::Model, usize), OntologyError> {
    let now = Utc::now().naive_utc();
    let table_id = table_uuid(data_source_id, &live.table);

    let table = match schema_table::Entity::find_by_id(table_id).one(db).await? {
        Some(existing) => {
            let mut active: schema_table::ActiveModel = existing.into();
            active.table_type = Set(live.table_type.clone());
            if let Some(p) = profile {
                active.row_count = Set(Some(p.row_count));
            }
            active.deleted_at = Set(None);
            active.updated_at = Set(now);
            active.update(db).await?
        }
        None => {
            schema_table::ActiveModel {
                id: Set(table_id),
                project_id: Set(project_id),
                data_source_id: Set(data_source_id),
                schema_name: Set(live.table.schema_name.clone()),
                table_name: Set(live.table.table_name.clone()),
                table_type: Set(live.table_type.clone()),
                row_count: Set(profile.map(|p| p.row_count)),
                deleted_at: Set(None),
                discovered_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?
        }
    };

    let row_count = profile.map(|p| p.row_count);
    for column in &live.columns {
        let stats = profile.and_then(|p| p.columns.iter().find(|c| c.column_name == column.column_name));
        let stats = stats.map(|s| {
            let mut samples = s.samples.clone();
            samples.truncate(sample_limit);
            (
                s.distinct_count,
                s.null_rate(row_count.unwrap_or_default()),
                samples,
            )
        });
        upsert_column(db, table.id, column, stats, now).await?;
    }

    let live_names: HashSet<&str> = live.columns.iter().map(|c| c.column_name.as_str()).collect();
    let stale: Vec<schema_column::Model> = schema_column::Entity::find()
        .filter(schema_column::Column::SchemaTableId.eq(table.id))
        .filter(schema_column::Column::DeletedAt.is_null())
        .all(db)
        .await?
        .into_iter()
        .filter(|c| !live_names.contains(c.column_name.as_str()))
        .collect();
    let removed = stale.len();
    for column in stale {
        soft_delete_column(db, column.id).await?;
    }

    Ok((table, removed))
}

/// Insert (or revive) a single column of an already stored table without
/// touching its siblings.
pub async fn add_column<C: ConnectionTrait>(
    db: &C,
    table_id: Uuid,
    live: &LiveColumn,
    row_count: Option<i64>,
    profile: Option<&ColumnProfile>,
    sample_limit: usize,
) -> Result<schema_column::Model, OntologyError> {
    let stats = profile.map(|p| {
        let mut samples = p.samples.clone();
        samples.truncate(sample_limit);
        (p.distinct_count, p.null_rate(row_count.unwrap_or_default()), samples)
    });
    upsert_column(db, table_id, live, stats, Utc::now().naive_utc()).await
}

async fn upsert_column<C: ConnectionTrait>(
    db: &C,
    table_id: Uuid,
    live: &LiveColumn,
    stats: Option<(i64, f64, Vec<String>)>,
    now: NaiveDateTime,
) -> Result<schema_column::Model, OntologyError> {
    let column_id = column_uuid(table_id, &live.column_name);
    let samples_json = |samples: &Vec<String>| serde_json::to_string(samples).ok();

    match schema_column::Entity::find_by_id(column_id).one(db).await? {
        Some(existing) => {
            let mut active: schema_column::ActiveModel = existing.into();
            active.ordinal_position = Set(live.ordinal_position);
            active.data_type = Set(live.data_type.clone());
            active.is_nullable = Set(live.is_nullable);
            active.is_primary_key = Set(live.is_primary_key);
            active.is_unique = Set(live.is_unique);
            if let Some((distinct, null_rate, ref samples)) = stats {
                active.distinct_count = Set(Some(distinct));
                active.null_rate = Set(Some(null_rate));
                active.sample_values = Set(samples_json(samples));
            }
            active.deleted_at = Set(None);
            active.updated_at = Set(now);
            Ok(active.update(db).await?)
        }
        None => Ok(schema_column::ActiveModel {
            id: Set(column_id),
            schema_table_id: Set(table_id),
            column_name: Set(live.column_name.clone()),
            ordinal_position: Set(live.ordinal_position),
            data_type: Set(live.data_type.clone()),
            is_nullable: Set(live.is_nullable),
            is_primary_key: Set(live.is_primary_key),
            is_unique: Set(live.is_unique),
            distinct_count: Set(stats.as_ref().map(|s| s.0)),
            null_rate: Set(stats.as_ref().map(|s| s.1)),
            sample_values: Set(stats.as_ref().and_then(|s| samples_json(&s.2))),
            deleted_at: Set(None),
            discovered_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await?),
    }
}

/// Persist a full introspection result. Tables absent from `live` are
/// soft-deleted along with their columns.
pub async fn persist_snapshot<C: ConnectionTrait>(
    db: &C,
    project_id: Uuid,
    data_source_id: Uuid,
    live: &[(LiveTable, Option<TableProfile>)],
    sample_limit: usize,
) -> Result<SnapshotSummary, OntologyError> {
    let mut summary = SnapshotSummary::default();
    let mut seen = HashSet::new();

    for (table, profile) in live {
        let (model, removed) = upsert_table(
            db,
            project_id,
            data_source_id,
            table,
            profile.as_ref(),
            sample_limit,
        )
        .await?;
        seen.insert(model.id);
        summary.tables += 1;
        summary.columns += table.columns.len();
        summary.removed_columns += removed;
    }

    let existing = schema_table::Entity::find()
        .filter(schema_table::Column::DataSourceId.eq(data_source_id))
        .filter(schema_table::Column::DeletedAt.is_null())
        .all(db)
        .await?;
    for table in existing {
        if !seen.contains(&table.id) {
            soft_delete_table(db, table.id).await?;
            summary.removed_tables += 1;
        }
    }

    Ok(summary)
}

/// Soft-delete a table and every active column under it.
pub async fn soft_delete_table<C: ConnectionTrait>(db: &C, table_id: Uuid) -> Result<(), OntologyError> {
    let now = Utc::now().naive_utc();
    if let Some(table) = schema_table::Entity::find_by_id(table_id).one(db).await? {
        let mut active: schema_table::ActiveModel = table.into();
        active.deleted_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(db).await?;
    }
    let columns = schema_column::Entity::find()
        .filter(schema_column::Column::SchemaTableId.eq(table_id))
        .filter(schema_column::Column::DeletedAt.is_null())
        .all(db)
        .await?;
    for column in columns {
        soft_delete_column(db, column.id).await?;
    }
    Ok(())
}

pub async fn soft_delete_column<C: ConnectionTrait>(db: &C, column_id: Uuid) -> Result<(), OntologyError> {
    let now = Utc::now().naive_utc();
    if let Some(column) = schema_column::Entity::find_by_id(column_id).one(db).await? {
        let mut active: schema_column::ActiveModel = column.into();
        active.deleted_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(db).await?;
    }
    Ok(())
}

pub async fn update_column_type<C: ConnectionTrait>(
    db: &C,
    column_id: Uuid,
    data_type: &str,
) -> Result<schema_column::Model, OntologyError> {
    let column = schema_column::Entity::find_by_id(column_id)
        .one(db)
        .await?
        .ok_or_else(|| OntologyError::NotFound(format!("column {column_id}")))?;
    let mut active: schema_column::ActiveModel = column.into();
    active.data_type = Set(data_type.to_string());
    active.updated_at = Set(Utc::now().naive_utc());
    Ok(active.update(db).await?)
}
