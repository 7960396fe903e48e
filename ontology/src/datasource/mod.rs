use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entity::data_source;
use crate::error::{OntologyError, is_unique_violation};

pub mod postgres;

// ---------- DTOs ----------

/// A (schema, table) reference on the monitored datasource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema_name: String,
    pub table_name: String,
}

impl TableRef {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Parse `schema.table`.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (schema, table) = qualified.trim().split_once('.')?;
        if schema.is_empty() || table.is_empty() || table.contains('.') {
            return None;
        }
        Some(Self::new(schema, table))
    }
}

/// A single column on the monitored datasource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: TableRef,
    pub column_name: String,
}

impl ColumnRef {
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self {
            table: TableRef::new(schema_name, table_name),
            column_name: column_name.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.table.qualified_name(), self.column_name)
    }

    /// Parse `schema.table.column`.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (table, column) = qualified.trim().rsplit_once('.')?;
        if column.is_empty() {
            return None;
        }
        Some(Self {
            table: TableRef::parse(table)?,
            column_name: column.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LiveTable {
    pub table: TableRef,
    /// "TABLE" or "VIEW"
    pub table_type: String,
    pub columns: Vec<LiveColumn>,
}

#[derive(Debug, Clone)]
pub struct LiveColumn {
    pub column_name: String,
    pub ordinal_position: i32,
    /// Upstream type string (e.g. "character varying", "integer")
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    /// Covered by a single-column PRIMARY KEY or UNIQUE constraint.
    pub is_unique: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TableProfile {
    pub row_count: i64,
    pub columns: Vec<ColumnProfile>,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnProfile {
    pub column_name: String,
    pub distinct_count: i64,
    pub null_count: i64,
    pub samples: Vec<String>,
}

impl ColumnProfile {
    pub fn null_rate(&self, row_count: i64) -> f64 {
        if row_count <= 0 {
            0.0
        } else {
            self.null_count as f64 / row_count as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeclaredForeignKey {
    pub source: ColumnRef,
    pub target: ColumnRef,
}

/// Join-overlap statistics for a (source, target) column pair.
/// Value counts are over distinct non-null values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub source_distinct: i64,
    pub target_distinct: i64,
    /// Distinct source values present in the target.
    pub matched_count: i64,
    /// Distinct source values absent from the target.
    pub orphan_count: i64,
    /// Distinct target values never referenced by the source.
    pub reverse_orphan_count: i64,
    /// Non-null rows on the source side.
    pub source_rows: i64,
    /// Non-null rows on the target side.
    pub target_rows: i64,
}

impl JoinStats {
    /// Share of distinct source values that resolve in the target.
    pub fn overlap(&self) -> f64 {
        if self.source_distinct <= 0 {
            0.0
        } else {
            self.matched_count as f64 / self.source_distinct as f64
        }
    }
}

// ---------- errors ----------

#[derive(Debug)]
pub enum DatasourceError {
    Connect(String),
    Query(String),
    UnsupportedType(String),
    Cancelled,
}

impl fmt::Display for DatasourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasourceError::Connect(msg) => write!(f, "Connection error: {msg}"),
            DatasourceError::Query(msg) => write!(f, "Query error: {msg}"),
            DatasourceError::UnsupportedType(msg) => write!(f, "Unsupported type: {msg}"),
            DatasourceError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for DatasourceError {}

// ---------- trait ----------

/// Read-only access to the monitored datasource. Dialect differences live
/// entirely behind this trait.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Shape of every table in the configured schemas, including PK/unique flags.
    async fn list_tables(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LiveTable>, DatasourceError>;

    /// Row count plus per-column distinct/null counts and up to `sample_limit`
    /// distinct sample values.
    async fn table_profile(
        &self,
        table: &TableRef,
        columns: &[String],
        sample_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<TableProfile, DatasourceError>;

    /// Declared single-column foreign-key constraints.
    async fn declared_foreign_keys(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeclaredForeignKey>, DatasourceError>;

    /// One aggregate query computing the overlap between two columns.
    async fn join_stats(
        &self,
        source: &ColumnRef,
        target: &ColumnRef,
        cancel: &CancellationToken,
    ) -> Result<JoinStats, DatasourceError>;

    /// Up to `limit` distinct non-null values, rendered as text, sorted.
    async fn distinct_values(
        &self,
        column: &ColumnRef,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DatasourceError>;
}

// ---------- data source config ----------

/// Resolved (decrypted) connection parameters for a data source.
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: String,
    /// Schemas to introspect. Defaults to `["public"]`.
    pub schemas: Vec<String>,
}

impl DataSourceConfig {
    /// Build config from a `data_source` model by decrypting secure_config with the master key.
    pub fn from_model(
        model: &data_source::Model,
        master_key: &[u8; 32],
    ) -> Result<Self, DatasourceError> {
        if model.ds_type != "postgres" {
            return Err(DatasourceError::UnsupportedType(format!(
                "No query executor for data source type: {}",
                model.ds_type
            )));
        }

        let config: serde_json::Value = serde_json::from_str(&model.config)
            .map_err(|e| DatasourceError::Connect(format!("Invalid config JSON: {e}")))?;

        let secure: serde_json::Value = if model.secure_config.is_empty() {
            serde_json::json!({})
        } else {
            crate::crypto::decrypt_json(&model.secure_config, master_key).map_err(|e| {
                DatasourceError::Connect(format!("Failed to decrypt secure_config: {e}"))
            })?
        };

        let required = |key: &str| -> Result<String, DatasourceError> {
            config[key]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| DatasourceError::Connect(format!("missing {key} in config")))
        };

        let schemas = config
            .get("schemas")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| vec!["public".to_string()]);

        Ok(Self {
            host: required("host")?,
            port: config["port"]
                .as_u64()
                .ok_or_else(|| DatasourceError::Connect("missing port in config".to_string()))
                .and_then(|port| {
                    u16::try_from(port).map_err(|_| {
                        DatasourceError::Connect(format!("port {port} is out of range"))
                    })
                })?,
            database: required("database")?,
            username: required("username")?,
            password: secure["password"]
                .as_str()
                .ok_or_else(|| {
                    DatasourceError::Connect("missing password in secure_config".to_string())
                })?
                .to_string(),
            ssl_mode: config
                .get("sslmode")
                .and_then(|v| v.as_str())
                .unwrap_or("require")
                .to_string(),
            schemas,
        })
    }
}

/// Split a user-supplied config object into (public, secret) parts.
/// Only `password` is treated as secret.
pub fn split_config(
    mut config: serde_json::Value,
) -> Result<(serde_json::Value, serde_json::Value), DatasourceError> {
    let obj = config
        .as_object_mut()
        .ok_or_else(|| DatasourceError::Connect("config must be a JSON object".to_string()))?;
    for key in ["host", "port", "database", "username"] {
        if !obj.contains_key(key) {
            return Err(DatasourceError::Connect(format!("missing {key} in config")));
        }
    }
    let password = obj
        .remove("password")
        .ok_or_else(|| DatasourceError::Connect("missing password in config".to_string()))?;
    Ok((config, serde_json::json!({ "password": password })))
}

// ---------- registration ----------

/// Store a new data source. The password is encrypted with `master_key`;
/// names are unique per project.
pub async fn register<C: ConnectionTrait>(
    db: &C,
    project_id: Uuid,
    name: &str,
    ds_type: &str,
    config: serde_json::Value,
    master_key: &[u8; 32],
) -> Result<data_source::Model, OntologyError> {
    if ds_type != "postgres" {
        return Err(OntologyError::Validation(format!(
            "unsupported data source type: {ds_type}"
        )));
    }
    let (public, secret) =
        split_config(config).map_err(|e| OntologyError::Validation(e.to_string()))?;
    let secure_config = crate::crypto::encrypt_json(&secret, master_key)?;

    let now = Utc::now().naive_utc();
    let inserted = data_source::ActiveModel {
        id: Set(Uuid::now_v7()),
        project_id: Set(project_id),
        name: Set(name.to_string()),
        ds_type: Set(ds_type.to_string()),
        config: Set(public.to_string()),
        secure_config: Set(secure_config),
        last_build_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await;

    match inserted {
        Ok(model) => Ok(model),
        Err(e) if is_unique_violation(&e) => Err(OntologyError::Conflict(format!(
            "data source {name:?} already exists in project {project_id}"
        ))),
        Err(e) => Err(e.into()),
    }
}

pub async fn find_by_name<C: ConnectionTrait>(
    db: &C,
    project_id: Uuid,
    name: &str,
) -> Result<data_source::Model, OntologyError> {
    data_source::Entity::find()
        .filter(data_source::Column::ProjectId.eq(project_id))
        .filter(data_source::Column::Name.eq(name))
        .one(db)
        .await?
        .ok_or_else(|| OntologyError::NotFound(format!("data source {name:?}")))
}

// ---------- factory ----------

pub fn create_executor(
    ds_type: &str,
    cfg: DataSourceConfig,
) -> Result<Box<dyn QueryExecutor>, DatasourceError> {
    match ds_type {
        "postgres" => Ok(Box::new(postgres::PostgresExecutor::new(cfg))),
        other => Err(DatasourceError::UnsupportedType(format!(
            "No query executor for data source type: {other}"
        ))),
    }
}
