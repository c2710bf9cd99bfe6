//! How the orchestrator reaches the validation service.
//!
//! [`Validator`] is the seam: [`LocalValidator`] calls an in-process
//! [`ValidationService`], [`EditorialClient`] calls a remote one over HTTP
//! behind a circuit breaker. Both retry transient failures with bounded
//! exponential backoff and enforce a hard per-call timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use editorial_common::{ValidationMode, ValidationRequest, ValidationResponse};

use super::breaker::CircuitBreaker;
use crate::config::EditorialSection;
use crate::editorial::ValidationService;
use crate::errors::{ClientError, OrchestratorError, ValidationError};

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, OrchestratorError>;

    /// Health block reported under `editorial` in `/health`.
    async fn health(&self) -> Value;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &EditorialSection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            call_timeout: cfg.request_timeout(),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EditorialSection::default())
    }
}

// ── In-process ────────────────────────────────────────────────────────

pub struct LocalValidator {
    service: Arc<ValidationService>,
    policy: RetryPolicy,
}

impl LocalValidator {
    pub fn new(service: Arc<ValidationService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    async fn call_once(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationResponse, OrchestratorError> {
        let timeout = self.policy.call_timeout;
        match tokio::time::timeout(timeout, self.service.validate(request.clone())).await {
            Ok(result) => result.map_err(OrchestratorError::from),
            Err(_) => Err(ClientError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }
}

fn is_transient(err: &OrchestratorError) -> bool {
    match err {
        OrchestratorError::Validation(ValidationError::RepositoryUnavailable(_)) => true,
        OrchestratorError::Client(e) => e.is_retryable(),
        _ => false,
    }
}

#[async_trait]
impl Validator for LocalValidator {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, OrchestratorError> {
        (|| self.call_once(&request))
            .retry(self.policy.backoff())
            .when(is_transient)
            .notify(|err, after| {
                warn!(
                    error = %err,
                    retry_in_ms = after.as_millis() as u64,
                    "Retrying validation"
                )
            })
            .await
    }

    async fn health(&self) -> Value {
        serde_json::to_value(self.service.health().await)
            .unwrap_or_else(|e| json!({ "status": "degraded", "detail": e.to_string() }))
    }
}

// ── Remote ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    detail: String,
}

pub struct EditorialClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    health_timeout: Duration,
}

impl EditorialClient {
    pub fn new(cfg: &EditorialSection) -> Result<Self, ClientError> {
        let policy = RetryPolicy::from_config(cfg);
        let http = reqwest::Client::builder()
            .timeout(policy.call_timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.service_url.trim_end_matches('/').to_string(),
            breaker: Arc::new(CircuitBreaker::new(
                cfg.breaker_failure_threshold,
                Duration::from_secs(cfg.breaker_cooldown_secs),
            )),
            policy,
            health_timeout: cfg.health_timeout(),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn endpoint(&self, mode: ValidationMode) -> String {
        format!("{}/validate/{}", self.base_url, mode)
    }

    async fn post(&self, request: &ValidationRequest) -> Result<ValidationResponse, ClientError> {
        let url = self.endpoint(request.mode);
        let timeout_ms = self.policy.call_timeout.as_millis() as u64;
        let call = async {
            let resp = self.http.post(&url).json(request).send().await.map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout { timeout_ms }
                } else {
                    ClientError::Transport(e.to_string())
                }
            })?;
            let status = resp.status();
            if !status.is_success() {
                let body: ErrorBody = resp.json().await.unwrap_or_default();
                return Err(ClientError::Status {
                    status: status.as_u16(),
                    kind: body.error,
                    detail: body.detail,
                });
            }
            resp.json::<ValidationResponse>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))
        };
        tokio::time::timeout(self.policy.call_timeout, call)
            .await
            .unwrap_or(Err(ClientError::Timeout { timeout_ms }))
    }

    async fn call_once(
        &self,
        request: &ValidationRequest,
    ) -> Result<ValidationResponse, ClientError> {
        let permit = self.breaker.acquire()?;
        let result = self.post(request).await;
        match &result {
            Err(e) if e.is_retryable() => permit.failure(),
            // The service answered, even if it rejected the request.
            _ => permit.success(),
        }
        result
    }
}

#[async_trait]
impl Validator for EditorialClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, OrchestratorError> {
        debug!(
            url = %self.endpoint(request.mode),
            mode = %request.mode,
            "Calling editorial service"
        );
        let response = (|| self.call_once(&request))
            .retry(self.policy.backoff())
            .when(|e: &ClientError| e.is_retryable())
            .notify(|err, after| {
                warn!(
                    error = %err,
                    retry_in_ms = after.as_millis() as u64,
                    "Retrying editorial call"
                )
            })
            .await?;
        Ok(response)
    }

    async fn health(&self) -> Value {
        let url = format!("{}/editorial/health", self.base_url);
        let check = async {
            let resp = self.http.get(&url).send().await?;
            resp.json::<Value>().await
        };
        let mut body = match tokio::time::timeout(self.health_timeout, check).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => json!({ "status": "unreachable", "detail": e.to_string() }),
            Err(_) => json!({ "status": "unreachable", "detail": "health check timed out" }),
        };
        if let Some(map) = body.as_object_mut() {
            map.insert("url".into(), json!(self.base_url));
            map.insert("circuit".into(), json!(self.breaker.state()));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editorial::fixtures::sample_service;
    use crate::orchestrator::breaker::CircuitState;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use editorial_common::CheckpointType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_secs(2),
        }
    }

    fn test_config(url: &str) -> EditorialSection {
        EditorialSection {
            service_url: url.to_string(),
            request_timeout_ms: 500,
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 60,
            ..EditorialSection::default()
        }
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_local_validator_returns_service_response() {
        let (service, _) = sample_service();
        let validator = LocalValidator::new(service, fast_policy());
        let request =
            ValidationRequest::selective("x", Some("linkedin"), CheckpointType::PreWriting);
        let response = validator.validate(request).await.unwrap();
        assert_eq!(response.checkpoint, Some(CheckpointType::PreWriting));
    }

    #[tokio::test]
    async fn test_local_validator_gives_up_after_retries() {
        let (service, repo) = sample_service();
        repo.set_available(false);
        let validator = LocalValidator::new(service.clone(), fast_policy());
        let err = validator
            .validate(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::RepositoryUnavailable(_))
        ));
        // One call plus two retries.
        assert_eq!(service.metrics().summary().errors["repository_unavailable"], 3);
    }

    #[tokio::test]
    async fn test_local_validator_does_not_retry_client_errors() {
        let (service, _) = sample_service();
        let validator = LocalValidator::new(service.clone(), fast_policy());
        let mut request = ValidationRequest::selective("x", None, CheckpointType::PreWriting);
        request.checkpoint = None;
        assert!(validator.validate(request).await.is_err());
        assert!(service.metrics().summary().errors.is_empty());
    }

    #[tokio::test]
    async fn test_client_retries_5xx_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/validate/comprehensive",
            post(move |Json(req): Json<ValidationRequest>| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err((
                            StatusCode::SERVICE_UNAVAILABLE,
                            Json(json!({"error": "repository_unavailable", "detail": "down"})),
                        ));
                    }
                    Ok(Json(ValidationResponse::new(req.mode, None, Vec::new())))
                }
            }),
        );
        let url = spawn(router).await;
        let client = EditorialClient::new(&test_config(&url)).unwrap();
        let response = client
            .validate(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap();
        assert_eq!(response.mode, ValidationMode::Comprehensive);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_client_surfaces_4xx_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/validate/selective",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "error": "missing_checkpoint",
                            "detail": "checkpoint required"
                        })),
                    )
                }
            }),
        );
        let url = spawn(router).await;
        let client = EditorialClient::new(&test_config(&url)).unwrap();
        let err = client
            .validate(ValidationRequest::selective("x", None, CheckpointType::MidWriting))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Client(ClientError::Status { status, kind, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(kind, "missing_checkpoint");
            }
            other => panic!("Expected Status error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_opens_circuit_when_service_down() {
        // Nothing listens on port 1.
        let client = EditorialClient::new(&test_config("http://127.0.0.1:1")).unwrap();
        let err = client
            .validate(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Client(ClientError::Transport(_))));
        assert_eq!(client.breaker().state(), CircuitState::Open);

        let err = client
            .validate(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Client(ClientError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_trial_does_not_wedge_circuit() {
        let router = Router::new().route(
            "/validate/comprehensive",
            post(|Json(req): Json<ValidationRequest>| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Json(ValidationResponse::new(req.mode, None, Vec::new()))
            }),
        );
        let url = spawn(router).await;
        let client = EditorialClient::new(&EditorialSection {
            breaker_failure_threshold: 1,
            breaker_cooldown_secs: 0,
            ..test_config(&url)
        })
        .unwrap();
        client.breaker().acquire().unwrap().failure();
        assert_eq!(client.breaker().state(), CircuitState::Open);

        // The caller gives up while the half-open trial call is still waiting.
        let request = ValidationRequest::comprehensive("x", None, None);
        let cut_short =
            tokio::time::timeout(Duration::from_millis(50), client.validate(request.clone())).await;
        assert!(cut_short.is_err());

        let response = client.validate(request).await.unwrap();
        assert_eq!(response.mode, ValidationMode::Comprehensive);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_client_health_reports_unreachable() {
        let client = EditorialClient::new(&test_config("http://127.0.0.1:1")).unwrap();
        let health = client.health().await;
        assert_eq!(health["status"], "unreachable");
        assert_eq!(health["circuit"], "closed");
    }
}
