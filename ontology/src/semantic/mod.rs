//! Semantic judgment: relationship validation and descriptive enrichment.
//!
//! Every call carries one self-contained unit of evidence and returns one
//! typed result. Implementations classify their own failures into
//! [`SemanticError`] so callers can tell a dead endpoint (abort) from a bad
//! answer about a single item (record and move on).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datasource::JoinStats;

pub mod http;

// ---------- evidence ----------

/// Everything the classifier may know about one column.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ColumnEvidence {
    /// `schema.table.column`
    pub qualified_name: String,
    pub data_type: String,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub distinct_count: Option<i64>,
    pub null_rate: Option<f64>,
    pub samples: Vec<String>,
}

/// One relationship candidate, packaged for a single validation call.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateUnit {
    pub source: ColumnEvidence,
    pub target: ColumnEvidence,
    pub matched_count: i64,
    pub orphan_count: i64,
    pub reverse_orphan_count: i64,
    pub source_distinct: i64,
    pub target_distinct: i64,
    pub source_rows: i64,
    pub target_rows: i64,
}

impl CandidateUnit {
    pub fn new(source: ColumnEvidence, target: ColumnEvidence, stats: &JoinStats) -> Self {
        Self {
            source,
            target,
            matched_count: stats.matched_count,
            orphan_count: stats.orphan_count,
            reverse_orphan_count: stats.reverse_orphan_count,
            source_distinct: stats.source_distinct,
            target_distinct: stats.target_distinct,
            source_rows: stats.source_rows,
            target_rows: stats.target_rows,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableContext {
    pub qualified_name: String,
    pub table_role: Option<String>,
    pub row_count: Option<i64>,
    pub columns: Vec<ColumnEvidence>,
    /// Qualified names of tables this one references or is referenced by.
    pub related_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnContext {
    pub table: String,
    pub column: ColumnEvidence,
    pub role: Option<String>,
    pub enum_values: Vec<String>,
}

// ---------- results ----------

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RelationshipVerdict {
    pub is_valid_fk: bool,
    #[serde(default)]
    pub confidence: f64,
    /// Raw classifier text; parsed leniently by the validator.
    #[serde(default)]
    pub cardinality: Option<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub source_role: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TableDescription {
    pub entity_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ColumnAnnotation {
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub semantic_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

// ---------- errors ----------

#[derive(Debug)]
pub enum SemanticError {
    /// Endpoint unreachable, unauthorised or unknown. Aborts the batch.
    Configuration(String),
    /// Timeout, rate limit or server error that outlived retries.
    Transport(String),
    /// The endpoint answered but not with the expected JSON.
    InvalidResponse(String),
    Cancelled,
}

impl fmt::Display for SemanticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticError::Configuration(msg) => write!(f, "Semantic endpoint misconfigured: {msg}"),
            SemanticError::Transport(msg) => write!(f, "Semantic call failed: {msg}"),
            SemanticError::InvalidResponse(msg) => write!(f, "Invalid semantic response: {msg}"),
            SemanticError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for SemanticError {}

// ---------- trait ----------

#[async_trait::async_trait]
pub trait SemanticClient: Send + Sync {
    async fn validate_relationship(
        &self,
        unit: &CandidateUnit,
    ) -> Result<RelationshipVerdict, SemanticError>;

    async fn describe_table(&self, table: &TableContext) -> Result<TableDescription, SemanticError>;

    async fn enrich_column(&self, column: &ColumnContext)
    -> Result<ColumnAnnotation, SemanticError>;
}
