//! Vocabulary shared by every component: provenance, cardinality, change and
//! run states, column/table roles. Entities store these as strings; the enums
//! here are the typed view.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error for an unrecognised stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownValue {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownValue {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ---------- provenance ----------

/// Who wrote a fact. Ordered by precedence: manual > agent > inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Manual,
    Agent,
    Inferred,
}

string_enum!(Source, "source", {
    Manual => "manual",
    Agent => "agent",
    Inferred => "inferred",
});

impl Source {
    pub fn precedence(&self) -> u8 {
        match self {
            Source::Manual => 3,
            Source::Agent => 2,
            Source::Inferred => 1,
        }
    }
}

// ---------- relationships ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:M")]
    ManyToMany,
    #[serde(rename = "unknown")]
    Unknown,
}

string_enum!(Cardinality, "cardinality", {
    OneToOne => "1:1",
    ManyToOne => "N:1",
    OneToMany => "1:N",
    ManyToMany => "N:M",
    Unknown => "unknown",
});

impl Cardinality {
    /// Cardinality of the same relationship read from the target side.
    pub fn reverse(self) -> Self {
        match self {
            Cardinality::ManyToOne => Cardinality::OneToMany,
            Cardinality::OneToMany => Cardinality::ManyToOne,
            other => other,
        }
    }

    /// Lenient parse for classifier output ("many-to-one", "n:1", "N-1", ...).
    pub fn parse_loose(s: &str) -> Self {
        let normalized: String = s
            .trim()
            .to_ascii_uppercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        match normalized.as_str() {
            "1:1" | "1-1" | "ONE-TO-ONE" | "ONE_TO_ONE" => Cardinality::OneToOne,
            "N:1" | "N-1" | "M:1" | "MANY-TO-ONE" | "MANY_TO_ONE" => Cardinality::ManyToOne,
            "1:N" | "1-N" | "1:M" | "ONE-TO-MANY" | "ONE_TO_MANY" => Cardinality::OneToMany,
            "N:M" | "M:N" | "N-M" | "MANY-TO-MANY" | "MANY_TO_MANY" => Cardinality::ManyToMany,
            _ => Cardinality::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Constraint,
    Inferred,
}

string_enum!(DetectionMethod, "detection method", {
    Constraint => "constraint",
    Inferred => "inferred",
});

// ---------- pending changes ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewTable,
    NewColumn,
    DroppedTable,
    DroppedColumn,
    ModifiedColumn,
    NewEnumValues,
    PotentialEnum,
    NewFkPattern,
    CardinalityChange,
}

string_enum!(ChangeType, "change type", {
    NewTable => "new_table",
    NewColumn => "new_column",
    DroppedTable => "dropped_table",
    DroppedColumn => "dropped_column",
    ModifiedColumn => "modified_column",
    NewEnumValues => "new_enum_values",
    PotentialEnum => "potential_enum",
    NewFkPattern => "new_fk_pattern",
    CardinalityChange => "cardinality_change",
});

impl ChangeType {
    /// Drops are applied at detection time: the data no longer exists.
    pub fn is_auto_applied(&self) -> bool {
        matches!(self, ChangeType::DroppedTable | ChangeType::DroppedColumn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
    AutoApplied,
}

string_enum!(ChangeStatus, "change status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    AutoApplied => "auto_applied",
});

// ---------- pipeline runs ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Degraded,
    Failed,
    Skipped,
}

string_enum!(StageStatus, "stage status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Degraded => "degraded",
    Failed => "failed",
    Skipped => "skipped",
});

impl StageStatus {
    /// Whether a dependent stage may start after this one.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Degraded)
    }
}

// ---------- column / table roles ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    PrimaryKey,
    Identifier,
    ForeignKey,
    Enumeration,
    Measure,
    Timestamp,
    Flag,
    Document,
    Text,
    Unknown,
}

string_enum!(ColumnRole, "column role", {
    PrimaryKey => "primary_key",
    Identifier => "identifier",
    ForeignKey => "foreign_key",
    Enumeration => "enumeration",
    Measure => "measure",
    Timestamp => "timestamp",
    Flag => "flag",
    Document => "document",
    Text => "text",
    Unknown => "unknown",
});

impl ColumnRole {
    /// Roles that make a column a relationship source candidate.
    pub fn is_reference_like(&self) -> bool {
        matches!(self, ColumnRole::Identifier | ColumnRole::ForeignKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    Fact,
    Dimension,
    Junction,
    Reference,
    Standalone,
}

string_enum!(TableRole, "table role", {
    Fact => "fact",
    Dimension => "dimension",
    Junction => "junction",
    Reference => "reference",
    Standalone => "standalone",
});

// ---------- data types ----------

/// Coarse grouping of upstream type names, used for type compatibility and
/// role extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    Integer,
    Decimal,
    Float,
    Text,
    Uuid,
    Boolean,
    Timestamp,
    Date,
    Document,
    Binary,
    Other,
}

impl TypeFamily {
    pub fn of(data_type: &str) -> Self {
        let t = data_type.trim().to_ascii_lowercase();
        let base = t.split('(').next().unwrap_or(&t).trim();
        match base {
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8"
            | "smallserial" | "serial" | "bigserial" | "serial4" | "serial8" => TypeFamily::Integer,
            "numeric" | "decimal" | "money" => TypeFamily::Decimal,
            "real" | "double precision" | "float4" | "float8" | "float" | "double" => {
                TypeFamily::Float
            }
            "text" | "character varying" | "varchar" | "character" | "char" | "bpchar"
            | "citext" | "name" | "string" => TypeFamily::Text,
            "uuid" => TypeFamily::Uuid,
            "boolean" | "bool" => TypeFamily::Boolean,
            "date" => TypeFamily::Date,
            "json" | "jsonb" | "xml" | "hstore" => TypeFamily::Document,
            "bytea" | "blob" | "binary" => TypeFamily::Binary,
            b if b.starts_with("timestamp") || b.starts_with("time") || b == "datetime" => {
                TypeFamily::Timestamp
            }
            _ => TypeFamily::Other,
        }
    }

    /// Whether values of the two families can meaningfully be joined.
    pub fn is_join_compatible(self, other: TypeFamily) -> bool {
        use TypeFamily::*;
        match (self, other) {
            (Integer, Integer) | (Text, Text) | (Uuid, Uuid) => true,
            (Uuid, Text) | (Text, Uuid) => true,
            (Integer, Decimal) | (Decimal, Integer) => true,
            _ => false,
        }
    }

    /// Families that can never act as a relationship source.
    pub fn is_excluded_from_references(self) -> bool {
        matches!(
            self,
            TypeFamily::Timestamp
                | TypeFamily::Date
                | TypeFamily::Boolean
                | TypeFamily::Document
                | TypeFamily::Binary
                | TypeFamily::Float
        )
    }
}
