//! Semantic validation of candidates over a bounded worker pool.

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;

use super::candidates::Candidate;
use super::cardinality::infer_from_stats;
use crate::datasource::JoinStats;
use crate::error::OntologyError;
use crate::model::Cardinality;
use crate::semantic::{RelationshipVerdict, SemanticClient, SemanticError};

pub const LOW_CONFIDENCE: &str = "low confidence";

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted {
        cardinality: Cardinality,
        confidence: f64,
        reasoning: String,
        source_role: Option<String>,
    },
    Rejected {
        reason: String,
        confidence: f64,
        reasoning: Option<String>,
    },
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Validated {
    pub candidate: Candidate,
    pub outcome: ValidationOutcome,
    /// Set when the call itself failed and the rejection carries its error.
    pub error: Option<String>,
}

/// Results of a batch. When `cancelled` is set, candidates still in flight
/// were dropped and appear nowhere in `results`.
#[derive(Debug, Default)]
pub struct ValidationBatch {
    pub results: Vec<Validated>,
    /// Rejections caused by a failed call rather than by the classifier.
    pub errored: usize,
    pub cancelled: bool,
}

/// Turn a classifier verdict into a decision.
pub fn decide(verdict: RelationshipVerdict, stats: &JoinStats, min_confidence: f64) -> ValidationOutcome {
    let confidence = verdict.confidence.clamp(0.0, 1.0);
    if !verdict.is_valid_fk {
        let reason = if verdict.reasoning.trim().is_empty() {
            "rejected by classifier".to_string()
        } else {
            verdict.reasoning.clone()
        };
        return ValidationOutcome::Rejected {
            reason,
            confidence,
            reasoning: Some(verdict.reasoning),
        };
    }
    if confidence < min_confidence {
        return ValidationOutcome::Rejected {
            reason: LOW_CONFIDENCE.to_string(),
            confidence,
            reasoning: Some(verdict.reasoning),
        };
    }
    let cardinality = match verdict
        .cardinality
        .as_deref()
        .map(Cardinality::parse_loose)
        .unwrap_or(Cardinality::Unknown)
    {
        Cardinality::Unknown => infer_from_stats(stats),
        c => c,
    };
    ValidationOutcome::Accepted {
        cardinality,
        confidence,
        reasoning: verdict.reasoning,
        source_role: verdict.source_role.filter(|r| !r.trim().is_empty()),
    }
}

/// Validate every candidate, one semantic call each, at most `workers` at a
/// time. `on_progress(done, total)` fires once per completed candidate with a
/// strictly increasing `done`.
///
/// Transport and parse failures reject only their own candidate. A
/// configuration failure aborts the batch.
pub async fn validate_all(
    client: &dyn SemanticClient,
    candidates: Vec<Candidate>,
    workers: usize,
    min_confidence: f64,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<ValidationBatch, OntologyError> {
    let total = candidates.len();
    let mut in_flight = stream::iter(candidates.into_iter().map(|candidate| async move {
        if cancel.is_cancelled() {
            return (candidate, Err(SemanticError::Cancelled));
        }
        let result = tokio::select! {
            r = client.validate_relationship(&candidate.unit) => r,
            _ = cancel.cancelled() => Err(SemanticError::Cancelled),
        };
        (candidate, result)
    }))
    .buffer_unordered(workers.max(1));

    let mut batch = ValidationBatch::default();
    let mut done = 0;
    while let Some((candidate, result)) = in_flight.next().await {
        let mut error = None;
        let outcome = match result {
            Ok(verdict) => decide(verdict, &candidate.stats, min_confidence),
            Err(SemanticError::Configuration(msg)) => {
                return Err(OntologyError::Configuration(msg));
            }
            Err(SemanticError::Cancelled) => {
                batch.cancelled = true;
                continue;
            }
            Err(e) => {
                tracing::warn!(
                    source = %candidate.source.qualified_name(),
                    target = %candidate.target.qualified_name(),
                    error = %e,
                    "Candidate validation failed"
                );
                batch.errored += 1;
                error = Some(e.to_string());
                ValidationOutcome::Rejected {
                    reason: e.to_string(),
                    confidence: 0.0,
                    reasoning: None,
                }
            }
        };
        done += 1;
        on_progress(done, total);
        batch.results.push(Validated {
            candidate,
            outcome,
            error,
        });
    }

    Ok(batch)
}
