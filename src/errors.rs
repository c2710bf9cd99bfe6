//! Typed error hierarchy for the editorial service.
//!
//! Four top-level enums cover the subsystems:
//! - `ValidationError`: rule repository, strategy and request failures
//! - `ClientError`: HTTP calls from the orchestrator to the editorial service
//! - `StoreError`: checkpoint/sequence persistence failures
//! - `OrchestratorError`: checkpoint and sequence operations

use thiserror::Error;

use editorial_common::ValidationMode;

/// Errors from the validation service and its collaborators.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Rule repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error(
        "Insufficient rules for {mode} validation: {available} relevant rule(s) found, \
         at least {required} required"
    )]
    InsufficientRules {
        mode: ValidationMode,
        required: usize,
        available: usize,
    },

    #[error(
        "Selective validation requires a checkpoint (pre-writing, mid-writing or post-writing)"
    )]
    MissingCheckpoint,

    #[error("A checkpoint is not allowed for {mode} validation")]
    InvalidModeCheckpointCombination { mode: ValidationMode },

    #[error("Unsupported validation mode '{0}'. Valid values: comprehensive, selective")]
    UnsupportedMode(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ValidationError {
    /// Stable machine-readable kind used in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RepositoryUnavailable(_) => "repository_unavailable",
            Self::InsufficientRules { .. } => "insufficient_rules",
            Self::MissingCheckpoint => "missing_checkpoint",
            Self::InvalidModeCheckpointCombination { .. } => "invalid_mode_checkpoint_combination",
            Self::UnsupportedMode(_) => "unsupported_mode",
            Self::BadRequest(_) => "bad_request",
        }
    }
}

/// Errors from the HTTP client adapter that calls the editorial service.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Circuit breaker open; editorial service calls suspended for {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Editorial service did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Editorial service unreachable: {0}")]
    Transport(String),

    #[error("Editorial service returned {status} ({kind}): {detail}")]
    Status {
        status: u16,
        kind: String,
        detail: String,
    },

    #[error("Invalid response from editorial service: {0}")]
    Decode(String),
}

impl ClientError {
    /// Timeouts, transport failures and 5xx answers are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::CircuitOpen { .. } | Self::Decode(_) => false,
        }
    }
}

/// Errors from the checkpoint/sequence state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State store backend error: {0}")]
    Backend(String),

    #[error("Concurrent update conflict on {key}")]
    Conflict { key: String },

    #[error("Corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors from checkpoint and sequence operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Checkpoint {id} not found")]
    CheckpointNotFound { id: String },

    #[error("Sequence {flow_id} not found")]
    SequenceNotFound { flow_id: String },

    #[error("Checkpoint {id} is {status}; cannot {action}")]
    InvalidTransition {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("Step {step} exceeded its {timeout_secs}s timeout")]
    SequenceStepTimeout { step: String, timeout_secs: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
