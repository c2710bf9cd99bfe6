//! Human-review checkpoints.
//!
//! ```text
//! pending ──ok──▶ validated ──intervene──▶ awaiting_intervention ─┐
//!    │                │                        │    ▲            │
//!    └──error──▶ failed ◀──────error───────────┘    └─revalidate─┘
//!                                 any non-terminal ──finalize──▶ finalized
//! ```
//!
//! `finalized` and `failed` are terminal. Validation runs in a background
//! task; a result is applied only if no newer validation pass was started
//! and the checkpoint has not reached a terminal state in the meantime.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use editorial_common::{CheckpointType, ValidationRequest, ValidationResponse};

use super::client::Validator;
use super::store::{Record, Records, StateStore};
use crate::errors::{OrchestratorError, ValidationError};
use crate::server::ws::{WsMessage, broadcast_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Validated,
    AwaitingIntervention,
    Finalized,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::AwaitingIntervention => "awaiting_intervention",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub user_input: String,
    pub finalize: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub content: String,
    pub platform: Option<String>,
    pub checkpoint_type: CheckpointType,
    pub status: CheckpointStatus,
    pub result: Option<ValidationResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub user_notes: Option<String>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
    #[serde(default)]
    pub validation_attempts: u32,
    #[serde(default)]
    pub version: u64,
}

impl Record for Checkpoint {
    const NAMESPACE: &'static str = "checkpoint";

    fn id(&self) -> &str {
        &self.checkpoint_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Checkpoint {
    fn validation_request(&self, user_input: Option<&str>) -> ValidationRequest {
        let mut request = ValidationRequest::selective(
            &self.content,
            self.platform.as_deref(),
            self.checkpoint_type,
        )
        .with_context("checkpoint_id", json!(self.checkpoint_id));
        if let Some(notes) = &self.user_notes {
            request = request.with_context("user_notes", json!(notes));
        }
        if let Some(input) = user_input {
            request = request.with_context("user_input", json!(input));
        }
        request
    }
}

/// Input to [`CheckpointManager::create`].
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub content: String,
    pub platform: Option<String>,
    pub checkpoint_type: CheckpointType,
    pub user_notes: Option<String>,
}

pub struct CheckpointManager {
    records: Records<Checkpoint>,
    validator: Arc<dyn Validator>,
    events: broadcast::Sender<String>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        validator: Arc<dyn Validator>,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            records: Records::new(store),
            validator,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        self.records.store()
    }

    /// Create a `pending` checkpoint and start its first validation pass.
    pub async fn create(
        self: &Arc<Self>,
        new: NewCheckpoint,
    ) -> Result<Checkpoint, OrchestratorError> {
        if new.content.trim().is_empty() {
            let err = ValidationError::BadRequest("content must not be empty".into());
            return Err(err.into());
        }
        let now = Utc::now();
        let mut checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().to_string(),
            content: new.content,
            platform: new.platform,
            checkpoint_type: new.checkpoint_type,
            status: CheckpointStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
            error_message: None,
            user_notes: new.user_notes,
            interventions: Vec::new(),
            validation_attempts: 1,
            version: 0,
        };
        self.records.insert(&mut checkpoint).await?;
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            checkpoint_type = %checkpoint.checkpoint_type,
            "Checkpoint created"
        );
        broadcast_message(
            &self.events,
            &WsMessage::CheckpointCreated {
                checkpoint_id: checkpoint.checkpoint_id.clone(),
                checkpoint_type: checkpoint.checkpoint_type,
                status: checkpoint.status,
            },
        );
        let request = checkpoint.validation_request(None);
        self.spawn_validation(checkpoint.checkpoint_id.clone(), 1, request);
        Ok(checkpoint)
    }

    pub async fn status(&self, checkpoint_id: &str) -> Result<Checkpoint, OrchestratorError> {
        self.records
            .get(checkpoint_id)
            .await?
            .ok_or_else(|| OrchestratorError::CheckpointNotFound {
                id: checkpoint_id.to_string(),
            })
    }

    /// Record human input. `finalize` closes the checkpoint; otherwise it
    /// moves to `awaiting_intervention` and a fresh validation pass runs.
    pub async fn intervene(
        self: &Arc<Self>,
        checkpoint_id: &str,
        user_input: &str,
        finalize: bool,
    ) -> Result<Checkpoint, OrchestratorError> {
        let updated = self
            .records
            .update(checkpoint_id, |cp| {
                if cp.status.is_terminal() {
                    return Err(OrchestratorError::InvalidTransition {
                        id: cp.checkpoint_id.clone(),
                        status: cp.status.to_string(),
                        action: "intervene",
                    });
                }
                let now = Utc::now();
                cp.interventions.push(Intervention {
                    user_input: user_input.to_string(),
                    finalize,
                    at: now,
                });
                cp.updated_at = now;
                if finalize {
                    cp.status = CheckpointStatus::Finalized;
                } else {
                    cp.status = CheckpointStatus::AwaitingIntervention;
                    cp.validation_attempts += 1;
                }
                Ok(true)
            })
            .await?
            .ok_or_else(|| OrchestratorError::CheckpointNotFound {
                id: checkpoint_id.to_string(),
            })?;

        info!(checkpoint_id, status = %updated.status, finalize, "Checkpoint intervention");
        self.notify(&updated);
        if !finalize {
            let request = updated.validation_request(Some(user_input));
            let attempt = updated.validation_attempts;
            self.spawn_validation(updated.checkpoint_id.clone(), attempt, request);
        }
        Ok(updated)
    }

    fn notify(&self, checkpoint: &Checkpoint) {
        broadcast_message(
            &self.events,
            &WsMessage::CheckpointUpdated {
                checkpoint_id: checkpoint.checkpoint_id.clone(),
                status: checkpoint.status,
                error_message: checkpoint.error_message.clone(),
            },
        );
    }

    fn spawn_validation(
        self: &Arc<Self>,
        checkpoint_id: String,
        attempt: u32,
        request: ValidationRequest,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.validator.validate(request).await;
            if let Err(e) = this.apply_outcome(&checkpoint_id, attempt, outcome).await {
                warn!(
                    checkpoint_id = %checkpoint_id,
                    error = %e,
                    "Failed to record validation outcome"
                );
            }
        });
    }

    async fn apply_outcome(
        &self,
        checkpoint_id: &str,
        attempt: u32,
        outcome: Result<ValidationResponse, OrchestratorError>,
    ) -> Result<(), OrchestratorError> {
        let mut applied = false;
        let updated = self
            .records
            .update(checkpoint_id, |cp| {
                applied = false;
                if cp.status.is_terminal() || cp.validation_attempts != attempt {
                    return Ok(false);
                }
                cp.updated_at = Utc::now();
                match &outcome {
                    Ok(response) => {
                        cp.result = Some(response.clone());
                        cp.error_message = None;
                        if cp.status == CheckpointStatus::Pending {
                            cp.status = CheckpointStatus::Validated;
                        }
                    }
                    Err(e) => {
                        cp.status = CheckpointStatus::Failed;
                        cp.error_message = Some(e.to_string());
                    }
                }
                applied = true;
                Ok(true)
            })
            .await?;

        match updated {
            Some(cp) if applied => {
                match &cp.error_message {
                    Some(err) => warn!(
                        checkpoint_id,
                        attempt,
                        error = %err,
                        "Checkpoint validation failed"
                    ),
                    None => info!(
                        checkpoint_id,
                        attempt,
                        status = %cp.status,
                        rule_count = cp.result.as_ref().map(|r| r.rule_count).unwrap_or(0),
                        "Checkpoint validated"
                    ),
                }
                self.notify(&cp);
            }
            Some(_) => info!(checkpoint_id, attempt, "Discarded stale validation result"),
            None => warn!(checkpoint_id, "Checkpoint vanished before validation completed"),
        }
        Ok(())
    }
}
