// 🚨 Error Taxonomy
// One error type per pipeline stage. Row-level errors are recovered locally,
// promotion errors are fatal for the batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// VALIDATION (Normalizer)
// ============================================================================

/// Malformed input row. The row is skipped, the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("missing required field `{field}`")]
    MissingField { field: String },

    #[error("unknown jurisdiction `{value}`")]
    UnknownJurisdiction { value: String },

    #[error("malformed date in `{field}`: `{value}`")]
    MalformedDate { field: String, value: String },

    #[error("malformed amount in `{field}`: `{value}`")]
    MalformedAmount { field: String, value: String },

    #[error("identifier missing or malformed and no composite key can be built: {reason}")]
    NoIdentity { reason: String },
}

impl ValidationError {
    pub fn missing(field: &str) -> Self {
        ValidationError::MissingField {
            field: field.to_string(),
        }
    }
}

// ============================================================================
// IDENTITY (Resolver)
// ============================================================================

/// Where a row came from. Used by conflicts and the rejected-rows log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_file: String,
    pub line_number: usize,
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_file, self.line_number)
    }
}

/// Two rows of one batch resolved to the same key. Resolved by
/// last-write-wins; the discarded row is kept here for audit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("identity conflict on `{entity_id}`: kept {kept}, discarded {discarded}")]
pub struct IdentityConflict {
    pub entity_id: String,
    pub kept: SourceRef,
    pub discarded: SourceRef,
}

// ============================================================================
// ENRICHMENT
// ============================================================================

/// One enrichment step failed for one record. The record continues with the
/// attributes it had before the step.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EnrichmentError {
    #[error("step `{step}` failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("step `{step}` timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("step `{step}` violated its contract: {reason}")]
    ContractViolation { step: String, reason: String },
}

impl EnrichmentError {
    pub fn failed(step: &str, reason: impl Into<String>) -> Self {
        EnrichmentError::StepFailed {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn step(&self) -> &str {
        match self {
            EnrichmentError::StepFailed { step, .. }
            | EnrichmentError::Timeout { step, .. }
            | EnrichmentError::ContractViolation { step, .. } => step,
        }
    }
}

// ============================================================================
// PROMOTION (Snapshot Store)
// ============================================================================

/// Fatal for the batch. The store stays on the prior generation.
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("another promotion is already in flight")]
    Busy,

    #[error("entity without an assigned entity_id (source {source_ref})")]
    UnassignedIdentity { source_ref: SourceRef },

    #[error("entity_id `{0}` appears more than once in the generation")]
    DuplicateEntityId(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("failed to persist generation {generation}: {reason}")]
    Persistence { generation: u64, reason: String },
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("promotion failed: {0}")]
    Promotion(#[from] PromotionError),

    #[error("batch cancelled before promotion")]
    Cancelled,

    #[error("worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
