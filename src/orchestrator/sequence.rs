//! Content pipeline sequences.
//!
//! A sequence walks research → audience → writer → style → quality, one step
//! at a time, in a background task. `checkpoints` only ever grows and a
//! terminal status (`completed`, `failed:<reason>`) is never left.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use editorial_common::{CheckpointType, ValidationRequest};

use super::client::Validator;
use super::store::{Record, Records, StateStore};
use crate::errors::{OrchestratorError, StoreError, ValidationError};
use crate::server::ws::{WsMessage, broadcast_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Research,
    Audience,
    Writer,
    Style,
    Quality,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 5] = [
        Self::Research,
        Self::Audience,
        Self::Writer,
        Self::Style,
        Self::Quality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Audience => "audience",
            Self::Writer => "writer",
            Self::Style => "style",
            Self::Quality => "quality",
        }
    }

    /// Writing stage whose rules gate this step.
    pub fn checkpoint(&self) -> CheckpointType {
        match self {
            Self::Research | Self::Audience => CheckpointType::PreWriting,
            Self::Writer => CheckpointType::MidWriting,
            Self::Style | Self::Quality => CheckpointType::PostWriting,
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized as `running`, `completed` or `failed:<reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceStatus {
    Running,
    Completed,
    Failed(String),
}

impl SequenceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed:{}", reason),
        }
    }
}

impl FromStr for SequenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            _ => match s.strip_prefix("failed:") {
                Some(reason) if !reason.is_empty() => Ok(Self::Failed(reason.to_string())),
                _ => Err(format!("Invalid sequence status: {}", s)),
            },
        }
    }
}

impl Serialize for SequenceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: PipelineStep,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_count: Option<usize>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub flow_id: String,
    pub content: String,
    pub platform: Option<String>,
    pub status: SequenceStatus,
    pub current_step: Option<PipelineStep>,
    pub checkpoints: Vec<String>,
    #[serde(default)]
    pub skip_research: bool,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Record for Sequence {
    const NAMESPACE: &'static str = "sequence";

    fn id(&self) -> &str {
        &self.flow_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Marker recorded in `checkpoints` for a step that was skipped.
pub fn skipped_marker(step: PipelineStep) -> String {
    format!("{}:skipped", step)
}

// ── Step agents ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub rule_count: Option<usize>,
}

/// Runs one pipeline step for a sequence.
#[async_trait]
pub trait StepAgent: Send + Sync {
    async fn run(
        &self,
        step: PipelineStep,
        sequence: &Sequence,
    ) -> Result<StepOutput, OrchestratorError>;
}

/// Gates each step on a selective validation at the step's checkpoint.
pub struct ValidationGateAgent {
    validator: Arc<dyn Validator>,
}

impl ValidationGateAgent {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl StepAgent for ValidationGateAgent {
    async fn run(
        &self,
        step: PipelineStep,
        sequence: &Sequence,
    ) -> Result<StepOutput, OrchestratorError> {
        let request = ValidationRequest::selective(
            &sequence.content,
            sequence.platform.as_deref(),
            step.checkpoint(),
        )
        .with_context("flow_id", json!(sequence.flow_id))
        .with_context("step", json!(step.as_str()));
        let response = self.validator.validate(request).await?;
        Ok(StepOutput {
            rule_count: Some(response.rule_count),
        })
    }
}

// ── Views ─────────────────────────────────────────────────────────────

/// What `status` reports. Without a durable store only `status` is
/// trustworthy, so step details are blanked and `persistence` says so.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceView {
    pub flow_id: String,
    pub status: String,
    pub current_step: Option<PipelineStep>,
    pub checkpoints: Vec<String>,
    pub persistence: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveFlow {
    pub status: String,
    pub current_step: Option<PipelineStep>,
    pub steps_completed: usize,
    pub started_at: DateTime<Utc>,
}

/// Options for [`SequenceTracker::start`].
#[derive(Debug, Clone, Default)]
pub struct StartSequence {
    pub content: String,
    pub platform: Option<String>,
    pub skip_research: Option<bool>,
    pub content_ownership: Option<String>,
}

// ── Tracker ───────────────────────────────────────────────────────────

pub struct SequenceTracker {
    records: Records<Sequence>,
    agent: Arc<dyn StepAgent>,
    events: broadcast::Sender<String>,
    step_timeout: Duration,
    skip_research_default: bool,
}

impl SequenceTracker {
    pub fn new(
        store: Arc<dyn StateStore>,
        agent: Arc<dyn StepAgent>,
        events: broadcast::Sender<String>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            records: Records::new(store),
            agent,
            events,
            step_timeout,
            skip_research_default: false,
        }
    }

    pub fn with_skip_research_default(mut self, skip: bool) -> Self {
        self.skip_research_default = skip;
        self
    }

    pub fn registered_agents(&self) -> Vec<&'static str> {
        PipelineStep::ALL.iter().map(|s| s.as_str()).collect()
    }

    fn is_durable(&self) -> bool {
        self.records.store().is_durable()
    }

    /// Durable store present and answering.
    pub async fn ready(&self) -> bool {
        self.is_durable() && self.records.store().ping().await.is_ok()
    }

    pub fn persistence(&self) -> &'static str {
        if self.is_durable() { "durable" } else { "degraded" }
    }

    /// Create a `running` sequence and start its pipeline in the background.
    pub async fn start(
        self: &Arc<Self>,
        options: StartSequence,
    ) -> Result<Sequence, OrchestratorError> {
        if options.content.trim().is_empty() {
            return Err(ValidationError::BadRequest("content must not be empty".into()).into());
        }
        let original = options
            .content_ownership
            .as_deref()
            .is_some_and(|o| o.eq_ignore_ascii_case("original"));
        let skip_research = options.skip_research.unwrap_or(self.skip_research_default) || original;

        let now = Utc::now();
        let mut sequence = Sequence {
            flow_id: Uuid::new_v4().to_string(),
            content: options.content,
            platform: options.platform,
            status: SequenceStatus::Running,
            current_step: None,
            checkpoints: Vec::new(),
            skip_research,
            step_results: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.records.insert(&mut sequence).await?;
        if !self.is_durable() {
            warn!(
                flow_id = %sequence.flow_id,
                "No durable state store; sequence status is best-effort"
            );
        }
        info!(flow_id = %sequence.flow_id, skip_research, "Sequence started");
        broadcast_message(
            &self.events,
            &WsMessage::SequenceStarted {
                flow_id: sequence.flow_id.clone(),
            },
        );

        let this = Arc::clone(self);
        let flow_id = sequence.flow_id.clone();
        tokio::spawn(async move { this.run_pipeline(flow_id).await });
        Ok(sequence)
    }

    pub async fn status(&self, flow_id: &str) -> Result<SequenceView, OrchestratorError> {
        match self.records.get(flow_id).await {
            Ok(Some(sequence)) if self.is_durable() => Ok(SequenceView {
                flow_id: sequence.flow_id,
                status: sequence.status.to_string(),
                current_step: sequence.current_step,
                checkpoints: sequence.checkpoints,
                persistence: "durable",
                error_message: sequence.error_message,
                step_results: sequence.step_results,
                updated_at: Some(sequence.updated_at),
            }),
            Ok(Some(sequence)) => Ok(SequenceView {
                flow_id: sequence.flow_id,
                status: sequence.status.to_string(),
                current_step: None,
                checkpoints: Vec::new(),
                persistence: "degraded",
                error_message: sequence.error_message,
                step_results: Vec::new(),
                updated_at: None,
            }),
            Ok(None) => Err(OrchestratorError::SequenceNotFound {
                flow_id: flow_id.to_string(),
            }),
            Err(e) => {
                warn!(flow_id, error = %e, "Sequence state unreadable");
                Ok(SequenceView {
                    flow_id: flow_id.to_string(),
                    status: "unknown".to_string(),
                    current_step: None,
                    checkpoints: Vec::new(),
                    persistence: "degraded",
                    error_message: Some(e.to_string()),
                    step_results: Vec::new(),
                    updated_at: None,
                })
            }
        }
    }

    /// In-flight sequences keyed by flow id.
    pub async fn active(&self) -> Result<BTreeMap<String, ActiveFlow>, OrchestratorError> {
        let durable = self.is_durable();
        Ok(self
            .records
            .list()
            .await?
            .into_iter()
            .filter(|s| s.status == SequenceStatus::Running)
            .map(|s| {
                let flow = ActiveFlow {
                    status: s.status.to_string(),
                    current_step: if durable { s.current_step } else { None },
                    steps_completed: s.checkpoints.len(),
                    started_at: s.created_at,
                };
                (s.flow_id, flow)
            })
            .collect())
    }

    /// Apply `change` unless the sequence already reached a terminal status.
    async fn advance<F>(
        &self,
        flow_id: &str,
        mut change: F,
    ) -> Result<Option<Sequence>, OrchestratorError>
    where
        F: FnMut(&mut Sequence) + Send,
    {
        self.records
            .update(flow_id, |s| {
                if s.status.is_terminal() {
                    return Ok(false);
                }
                change(s);
                s.updated_at = Utc::now();
                Ok(true)
            })
            .await
    }

    /// [`Self::advance`], retried across transient store failures.
    async fn record<F>(
        &self,
        flow_id: &str,
        change: F,
    ) -> Result<Option<Sequence>, OrchestratorError>
    where
        F: Fn(&mut Sequence) + Send + Sync,
    {
        let change = &change;
        (move || self.advance(flow_id, change))
            .retry(store_backoff())
            .when(is_store_blip)
            .notify(|err, after| {
                warn!(
                    flow_id,
                    error = %err,
                    retry_in_ms = after.as_millis() as u64,
                    "Retrying sequence write"
                );
            })
            .await
    }

    async fn fail(&self, flow_id: &str, reason: String, message: String) {
        warn!(flow_id, reason = %reason, error = %message, "Sequence failed");
        let result = self
            .record(flow_id, |s| {
                s.status = SequenceStatus::Failed(reason.clone());
                s.error_message = Some(message.clone());
            })
            .await;
        if let Err(e) = result {
            error!(flow_id, error = %e, "Could not record sequence failure");
        }
        broadcast_message(
            &self.events,
            &WsMessage::SequenceFailed {
                flow_id: flow_id.to_string(),
                reason,
            },
        );
    }

    /// A write that kept failing ends the sequence rather than leaving it running.
    async fn fail_on_store(&self, flow_id: &str, err: OrchestratorError) {
        self.fail(flow_id, STATE_STORE_FAILURE.to_string(), err.to_string()).await;
    }

    async fn run_pipeline(self: Arc<Self>, flow_id: String) {
        for step in PipelineStep::ALL {
            let read = (|| self.records.get(&flow_id))
                .retry(store_backoff())
                .when(|e| !matches!(e, StoreError::Corrupt { .. }))
                .await;
            let sequence = match read {
                Ok(Some(s)) if !s.status.is_terminal() => s,
                Ok(_) => return,
                Err(e) => {
                    error!(flow_id = %flow_id, error = %e, "Lost sequence state");
                    return self.fail_on_store(&flow_id, e.into()).await;
                }
            };

            if step == PipelineStep::Research && sequence.skip_research {
                let recorded = self
                    .record(&flow_id, |s| {
                        s.checkpoints.push(skipped_marker(step));
                        s.step_results.push(StepResult {
                            step,
                            skipped: true,
                            rule_count: None,
                            duration_ms: 0.0,
                        });
                    })
                    .await;
                if let Err(e) = recorded {
                    return self.fail_on_store(&flow_id, e).await;
                }
                info!(flow_id = %flow_id, step = %step, "Step skipped");
                broadcast_message(
                    &self.events,
                    &WsMessage::SequenceStepCompleted {
                        flow_id: flow_id.clone(),
                        step: step.as_str().to_string(),
                        skipped: true,
                        rule_count: None,
                    },
                );
                continue;
            }

            if let Err(e) = self.record(&flow_id, |s| s.current_step = Some(step)).await {
                return self.fail_on_store(&flow_id, e).await;
            }
            broadcast_message(
                &self.events,
                &WsMessage::SequenceStepStarted {
                    flow_id: flow_id.clone(),
                    step: step.as_str().to_string(),
                },
            );

            let started = Instant::now();
            let run = tokio::time::timeout(self.step_timeout, self.agent.run(step, &sequence));
            let output = match run.await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return self.fail(&flow_id, format!("{}_error", step), e.to_string()).await;
                }
                Err(_) => {
                    let err = OrchestratorError::SequenceStepTimeout {
                        step: step.to_string(),
                        timeout_secs: self.step_timeout.as_secs(),
                    };
                    return self.fail(&flow_id, "timeout".to_string(), err.to_string()).await;
                }
            };
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            let recorded = self
                .record(&flow_id, |s| {
                    s.checkpoints.push(step.as_str().to_string());
                    s.step_results.push(StepResult {
                        step,
                        skipped: false,
                        rule_count: output.rule_count,
                        duration_ms,
                    });
                })
                .await;
            if let Err(e) = recorded {
                return self.fail_on_store(&flow_id, e).await;
            }
            info!(
                flow_id = %flow_id,
                step = %step,
                rule_count = ?output.rule_count,
                duration_ms,
                "Step completed"
            );
            broadcast_message(
                &self.events,
                &WsMessage::SequenceStepCompleted {
                    flow_id: flow_id.clone(),
                    step: step.as_str().to_string(),
                    skipped: false,
                    rule_count: output.rule_count,
                },
            );
        }

        let finished = self
            .record(&flow_id, |s| {
                s.status = SequenceStatus::Completed;
                s.current_step = None;
            })
            .await;
        match finished {
            Ok(_) => {
                info!(flow_id = %flow_id, "Sequence completed");
                broadcast_message(&self.events, &WsMessage::SequenceCompleted { flow_id });
            }
            Err(e) => self.fail_on_store(&flow_id, e).await,
        }
    }
}

/// Failure reason when sequence state could not be written.
pub const STATE_STORE_FAILURE: &str = "state_store_error";

fn store_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
}

fn is_store_blip(err: &OrchestratorError) -> bool {
    matches!(
        err,
        OrchestratorError::Store(StoreError::Backend(_) | StoreError::Conflict { .. })
    )
}
