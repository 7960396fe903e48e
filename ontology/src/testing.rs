//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::datasource::{
    ColumnProfile, ColumnRef, DatasourceError, DeclaredForeignKey, JoinStats, LiveColumn,
    LiveTable, QueryExecutor, TableProfile, TableRef,
};
use crate::entity::data_source;
use crate::semantic::{
    CandidateUnit, ColumnAnnotation, ColumnContext, RelationshipVerdict, SemanticClient,
    SemanticError, TableContext, TableDescription,
};

pub const TEST_KEY: [u8; 32] = [7u8; 32];

pub async fn setup_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db
}

pub async fn create_data_source(db: &DatabaseConnection) -> data_source::Model {
    let now = Utc::now().naive_utc();
    data_source::ActiveModel {
        id: Set(Uuid::now_v7()),
        project_id: Set(Uuid::now_v7()),
        name: Set(format!("shop-{}", Uuid::now_v7().simple())),
        ds_type: Set("postgres".to_string()),
        config: Set(serde_json::json!({
            "host": "localhost", "port": 5432, "database": "shop", "username": "ro"
        })
        .to_string()),
        secure_config: Set(
            crate::crypto::encrypt_json(&serde_json::json!({"password": "pw"}), &TEST_KEY).unwrap(),
        ),
        last_build_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap()
}

/// `(name, data_type, is_primary_key, is_unique)` per column.
pub fn live_table(schema: &str, table: &str, columns: &[(&str, &str, bool, bool)]) -> LiveTable {
    LiveTable {
        table: TableRef::new(schema, table),
        table_type: "TABLE".to_string(),
        columns: columns
            .iter()
            .enumerate()
            .map(|(i, (name, data_type, pk, unique))| LiveColumn {
                column_name: name.to_string(),
                ordinal_position: i as i32 + 1,
                data_type: data_type.to_string(),
                is_nullable: !pk,
                is_primary_key: *pk,
                is_unique: *unique,
            })
            .collect(),
    }
}

/// `(name, distinct, nulls, samples)` per column.
pub fn profile(row_count: i64, columns: &[(&str, i64, i64, &[&str])]) -> TableProfile {
    TableProfile {
        row_count,
        columns: columns
            .iter()
            .map(|(name, distinct, nulls, samples)| ColumnProfile {
                column_name: name.to_string(),
                distinct_count: *distinct,
                null_count: *nulls,
                samples: samples.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
    }
}

// ---------- datasource ----------

#[derive(Default)]
pub struct FakeExecutor {
    pub tables: Vec<LiveTable>,
    pub profiles: HashMap<TableRef, TableProfile>,
    pub foreign_keys: Vec<DeclaredForeignKey>,
    pub joins: HashMap<(ColumnRef, ColumnRef), JoinStats>,
    pub failing_joins: HashSet<(ColumnRef, ColumnRef)>,
    pub failing_profiles: HashSet<TableRef>,
    pub distinct: HashMap<ColumnRef, Vec<String>>,
    pub unreachable: bool,
    pub join_calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn with_table(mut self, table: LiveTable, profile: TableProfile) -> Self {
        self.profiles.insert(table.table.clone(), profile);
        self.tables.push(table);
        self
    }

    pub fn with_join(mut self, source: ColumnRef, target: ColumnRef, stats: JoinStats) -> Self {
        self.joins.insert((source, target), stats);
        self
    }

    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }
}

/// customers(id, name) with 3 rows; orders(id, customer_id, status, created_at)
/// with 5 rows, every order pointing at an existing customer.
pub fn shop_executor() -> FakeExecutor {
    FakeExecutor::default()
        .with_table(
            live_table(
                "public",
                "customers",
                &[("id", "integer", true, true), ("name", "text", false, false)],
            ),
            profile(
                3,
                &[
                    ("id", 3, 0, &["1", "2", "3"]),
                    ("name", 3, 0, &["Ada Lovelace", "Alan Turing", "Grace Hopper"]),
                ],
            ),
        )
        .with_table(
            live_table(
                "public",
                "orders",
                &[
                    ("id", "integer", true, true),
                    ("customer_id", "integer", false, false),
                    ("status", "text", false, false),
                    ("created_at", "timestamp without time zone", false, false),
                ],
            ),
            profile(
                5,
                &[
                    ("id", 5, 0, &["1", "2", "3", "4", "5"]),
                    ("customer_id", 3, 0, &["1", "2", "3"]),
                    ("status", 2, 0, &["open", "shipped"]),
                    ("created_at", 5, 0, &["2024-01-01 00:00:00"]),
                ],
            ),
        )
        .with_join(
            ColumnRef::new("public", "orders", "customer_id"),
            ColumnRef::new("public", "customers", "id"),
            JoinStats {
                source_distinct: 3,
                target_distinct: 3,
                matched_count: 3,
                orphan_count: 0,
                reverse_orphan_count: 0,
                source_rows: 5,
                target_rows: 3,
            },
        )
}

#[async_trait::async_trait]
impl QueryExecutor for FakeExecutor {
    async fn list_tables(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LiveTable>, DatasourceError> {
        if self.unreachable {
            return Err(DatasourceError::Connect("connection refused".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(DatasourceError::Cancelled);
        }
        Ok(self.tables.clone())
    }

    async fn table_profile(
        &self,
        table: &TableRef,
        columns: &[String],
        sample_limit: usize,
        _cancel: &CancellationToken,
    ) -> Result<TableProfile, DatasourceError> {
        if self.unreachable {
            return Err(DatasourceError::Connect("connection refused".to_string()));
        }
        if self.failing_profiles.contains(table) {
            return Err(DatasourceError::Query("statement timeout".to_string()));
        }
        let stored = self.profiles.get(table).cloned().unwrap_or_default();
        Ok(TableProfile {
            row_count: stored.row_count,
            columns: columns
                .iter()
                .map(|name| {
                    let mut c = stored
                        .columns
                        .iter()
                        .find(|c| &c.column_name == name)
                        .cloned()
                        .unwrap_or_else(|| ColumnProfile {
                            column_name: name.clone(),
                            ..Default::default()
                        });
                    c.samples.truncate(sample_limit);
                    c
                })
                .collect(),
        })
    }

    async fn declared_foreign_keys(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DeclaredForeignKey>, DatasourceError> {
        if self.unreachable {
            return Err(DatasourceError::Connect("connection refused".to_string()));
        }
        Ok(self.foreign_keys.clone())
    }

    async fn join_stats(
        &self,
        source: &ColumnRef,
        target: &ColumnRef,
        _cancel: &CancellationToken,
    ) -> Result<JoinStats, DatasourceError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(DatasourceError::Connect("connection refused".to_string()));
        }
        let key = (source.clone(), target.clone());
        if self.failing_joins.contains(&key) {
            return Err(DatasourceError::Query("statement timeout".to_string()));
        }
        Ok(self.joins.get(&key).copied().unwrap_or_default())
    }

    async fn distinct_values(
        &self,
        column: &ColumnRef,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, DatasourceError> {
        if let Some(values) = self.distinct.get(column) {
            let mut values = values.clone();
            values.sort();
            values.truncate(limit);
            return Ok(values);
        }
        let stored = self
            .profiles
            .get(&column.table)
            .and_then(|p| p.columns.iter().find(|c| c.column_name == column.column_name))
            .map(|c| c.samples.clone())
            .unwrap_or_default();
        Ok(stored.into_iter().take(limit).collect())
    }
}

// ---------- semantic ----------

#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Verdict(RelationshipVerdict),
    Transport,
    Invalid,
    Configuration,
}

impl FakeOutcome {
    fn into_result<T>(self, ok: impl FnOnce(RelationshipVerdict) -> T) -> Result<T, SemanticError> {
        match self {
            FakeOutcome::Verdict(v) => Ok(ok(v)),
            FakeOutcome::Transport => Err(SemanticError::Transport("HTTP 503".to_string())),
            FakeOutcome::Invalid => Err(SemanticError::InvalidResponse("expected value".to_string())),
            FakeOutcome::Configuration => {
                Err(SemanticError::Configuration("HTTP 401".to_string()))
            }
        }
    }
}

pub fn verdict(is_valid_fk: bool, confidence: f64, cardinality: &str) -> RelationshipVerdict {
    RelationshipVerdict {
        is_valid_fk,
        confidence,
        cardinality: Some(cardinality.to_string()),
        reasoning: "values line up".to_string(),
        source_role: None,
    }
}

/// Answers by source column qualified name; anything else gets `default`.
pub struct FakeSemantic {
    pub by_source: HashMap<String, FakeOutcome>,
    pub default: FakeOutcome,
    pub delay: Option<Duration>,
    /// Table or column qualified names whose enrichment fails.
    pub failing_targets: HashSet<String>,
    pub calls: AtomicUsize,
    pub validations: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl Default for FakeSemantic {
    fn default() -> Self {
        Self {
            by_source: HashMap::new(),
            default: FakeOutcome::Verdict(verdict(true, 0.9, "N:1")),
            delay: None,
            failing_targets: HashSet::new(),
            calls: AtomicUsize::new(0),
            validations: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSemantic {
    pub fn with_outcome(mut self, source: &str, outcome: FakeOutcome) -> Self {
        self.by_source.insert(source.to_string(), outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn validation_calls(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    fn record(&self, name: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(name.to_string());
        }
    }
}

fn pascal_case(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl SemanticClient for FakeSemantic {
    async fn validate_relationship(
        &self,
        unit: &CandidateUnit,
    ) -> Result<RelationshipVerdict, SemanticError> {
        self.record(&unit.source.qualified_name);
        self.validations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.by_source
            .get(&unit.source.qualified_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
            .into_result(|v| v)
    }

    async fn describe_table(&self, table: &TableContext) -> Result<TableDescription, SemanticError> {
        self.record(&table.qualified_name);
        if self.failing_targets.contains(&table.qualified_name) {
            return Err(SemanticError::Transport("HTTP 503".to_string()));
        }
        if let FakeOutcome::Configuration = self.default {
            return Err(SemanticError::Configuration("HTTP 401".to_string()));
        }
        let bare = table
            .qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&table.qualified_name);
        let entity = pascal_case(bare.trim_end_matches('s'));
        Ok(TableDescription {
            description: format!("One row per {}.", entity.to_lowercase()),
            entity_name: entity,
            synonyms: vec![],
        })
    }

    async fn enrich_column(
        &self,
        column: &ColumnContext,
    ) -> Result<ColumnAnnotation, SemanticError> {
        self.record(&column.column.qualified_name);
        if self.failing_targets.contains(&column.column.qualified_name) {
            return Err(SemanticError::InvalidResponse("expected value".to_string()));
        }
        if let FakeOutcome::Configuration = self.default {
            return Err(SemanticError::Configuration("HTTP 401".to_string()));
        }
        Ok(ColumnAnnotation {
            purpose: Some(format!("{} of the row", column.column.qualified_name)),
            semantic_type: None,
            description: Some("Generated description.".to_string()),
            synonyms: vec![],
        })
    }
}
