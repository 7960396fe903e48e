use std::fmt;

use sea_orm::{DbErr, SqlErr};

use crate::crypto::CryptoError;
use crate::datasource::DatasourceError;
use crate::model::UnknownValue;
use crate::semantic::SemanticError;

/// Engine-wide error.
///
/// Stages and the dispatcher decide between aborting and degrading with
/// [`OntologyError::is_fatal`]. Precedence rejections are not errors; see
/// `precedence::WriteOutcome::Skipped`.
#[derive(Debug)]
pub enum OntologyError {
    /// Missing or invalid configuration, unreachable or unauthorised endpoints.
    Configuration(String),
    /// A single item could not be processed (bad response, invalid input).
    Validation(String),
    NotFound(String),
    /// A run is already in progress for the same project and data source.
    Conflict(String),
    Datasource(DatasourceError),
    Database(DbErr),
    Cancelled,
}

impl OntologyError {
    /// Errors that abort a run regardless of the stage's failure policy.
    pub fn is_fatal(&self) -> bool {
        match self {
            OntologyError::Configuration(_)
            | OntologyError::Conflict(_)
            | OntologyError::NotFound(_)
            | OntologyError::Database(_)
            | OntologyError::Cancelled => true,
            OntologyError::Datasource(e) => !matches!(e, DatasourceError::Query(_)),
            OntologyError::Validation(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OntologyError::Cancelled | OntologyError::Datasource(DatasourceError::Cancelled)
        )
    }
}

impl fmt::Display for OntologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OntologyError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            OntologyError::Validation(msg) => write!(f, "Validation error: {msg}"),
            OntologyError::NotFound(msg) => write!(f, "Not found: {msg}"),
            OntologyError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            OntologyError::Datasource(e) => write!(f, "Datasource error: {e}"),
            OntologyError::Database(e) => write!(f, "Database error: {e}"),
            OntologyError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for OntologyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OntologyError::Datasource(e) => Some(e),
            OntologyError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbErr> for OntologyError {
    fn from(e: DbErr) -> Self {
        OntologyError::Database(e)
    }
}

impl From<DatasourceError> for OntologyError {
    fn from(e: DatasourceError) -> Self {
        match e {
            DatasourceError::Cancelled => OntologyError::Cancelled,
            // Bad credentials or unreachable host: nothing downstream can succeed
            DatasourceError::Connect(msg) => {
                OntologyError::Configuration(format!("datasource connection failed: {msg}"))
            }
            DatasourceError::UnsupportedType(msg) => OntologyError::Configuration(msg),
            other => OntologyError::Datasource(other),
        }
    }
}

impl From<SemanticError> for OntologyError {
    fn from(e: SemanticError) -> Self {
        match e {
            SemanticError::Configuration(msg) => OntologyError::Configuration(msg),
            SemanticError::Cancelled => OntologyError::Cancelled,
            other => OntologyError::Validation(other.to_string()),
        }
    }
}

impl From<CryptoError> for OntologyError {
    fn from(e: CryptoError) -> Self {
        OntologyError::Configuration(e.to_string())
    }
}

impl From<UnknownValue> for OntologyError {
    fn from(e: UnknownValue) -> Self {
        OntologyError::Validation(e.to_string())
    }
}

impl From<serde_json::Error> for OntologyError {
    fn from(e: serde_json::Error) -> Self {
        OntologyError::Validation(format!("invalid JSON: {e}"))
    }
}

pub type Result<T, E = OntologyError> = std::result::Result<T, E>;

/// Whether a metadata-store error is a unique constraint violation.
pub fn is_unique_violation(e: &DbErr) -> bool {
    if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    let msg = e.to_string();
    msg.contains("UNIQUE") || msg.contains("unique")
}
