//! Editorial validation service.
//!
//! Ties the rule repository, the strategy factory, the response cache and
//! the metrics recorder together. Repository failures always propagate;
//! the service never answers with rules it did not read from the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use editorial_common::{
    Severity, ValidationMode, ValidationRequest, ValidationResponse, ValidationRule,
};

use super::cache::{CacheKey, ResponseCache};
use super::metrics::ValidationMetrics;
use super::repository::RuleRepository;
use super::strategy::{StrategyFactory, ValidationStrategy};
use crate::errors::ValidationError;

pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    /// `up`, `down` or `timeout`.
    pub status: &'static str,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DependencyHealth {
    pub fn is_up(&self) -> bool {
        self.status == "up"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub rule_repository: DependencyHealth,
    pub cache: DependencyHealth,
}

pub struct ValidationService {
    repository: Arc<dyn RuleRepository>,
    factory: StrategyFactory,
    cache: Arc<ResponseCache>,
    metrics: Arc<ValidationMetrics>,
    health_timeout: Duration,
}

impl ValidationService {
    pub fn new(repository: Arc<dyn RuleRepository>, cache: Arc<ResponseCache>) -> Self {
        Self {
            repository,
            factory: StrategyFactory::default(),
            cache,
            metrics: Arc::new(ValidationMetrics::default()),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    pub fn with_factory(mut self, factory: StrategyFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn metrics(&self) -> &ValidationMetrics {
        &self.metrics
    }

    pub fn repository_name(&self) -> &'static str {
        self.repository.name()
    }

    /// Validate with whatever mode the request names.
    pub async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, ValidationError> {
        let strategy = self.factory.for_mode(request.mode);
        strategy.check_request(&request)?;
        self.run(strategy.as_ref(), request).await
    }

    pub async fn validate_comprehensive(
        &self,
        mut request: ValidationRequest,
    ) -> Result<ValidationResponse, ValidationError> {
        request.mode = ValidationMode::Comprehensive;
        self.validate(request).await
    }

    pub async fn validate_selective(
        &self,
        mut request: ValidationRequest,
    ) -> Result<ValidationResponse, ValidationError> {
        request.mode = ValidationMode::Selective;
        self.validate(request).await
    }

    async fn run(
        &self,
        strategy: &dyn ValidationStrategy,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, ValidationError> {
        let mode = strategy.mode();
        let result = self.execute(strategy, request).await;
        match &result {
            Ok(response) => self.metrics.record(
                mode,
                response.processing_time_ms.unwrap_or_default(),
                response.rule_count,
                response.cache_hit(),
            ),
            Err(e) => self.metrics.record_error(mode, e.kind()),
        }
        result
    }

    async fn execute(
        &self,
        strategy: &dyn ValidationStrategy,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, ValidationError> {
        if request.content.trim().is_empty() {
            return Err(ValidationError::BadRequest("content must not be empty".to_string()));
        }

        let started = Instant::now();
        let key = CacheKey::for_request(&request);
        if let Some(mut cached) = self.cache.get(&key) {
            debug!(key = %key, "Serving validation from cache");
            if let Some(original) = cached.processing_time_ms {
                cached.metadata.insert("original_processing_time_ms".into(), json!(original));
            }
            cached.metadata.insert("cache_hit".into(), json!(true));
            cached.processing_time_ms = Some(elapsed_ms(started));
            return Ok(cached);
        }

        let candidates = self
            .repository
            .get_rules(&strategy.rule_filter(&request))
            .await
            .inspect_err(|e| {
                warn!(repository = self.repository.name(), error = %e, "Rule lookup failed")
            })?;
        let considered = candidates.len();
        let rules = strategy.select_rules(candidates, &request)?;

        let sources: BTreeSet<&str> =
            rules.iter().map(|r| r.origin().collection_name.as_str()).collect();
        let sources: Vec<String> = sources.into_iter().map(str::to_string).collect();

        let checkpoint = strategy.response_checkpoint(&request);
        let mut response = ValidationResponse::new(strategy.mode(), checkpoint, rules);
        response.suggestions = suggestions(&response.rules_applied);
        response.processing_time_ms = Some(elapsed_ms(started));
        response.metadata.insert("cache_hit".into(), json!(false));
        response.metadata.insert("strategy".into(), json!(strategy.name()));
        response.metadata.insert("candidates_considered".into(), json!(considered));
        response.metadata.insert("rule_sources".into(), json!(sources));
        if let Some(platform) = request.normalized_platform() {
            response.metadata.insert("platform".into(), json!(platform));
        }
        if let Some(content_type) = request.normalized_content_type() {
            response.metadata.insert("content_type".into(), json!(content_type));
        }

        self.cache.insert(key, response.clone());
        Ok(response)
    }

    /// Check the repository and the cache, each bounded by the health timeout.
    pub async fn health(&self) -> ServiceHealth {
        let started = Instant::now();
        let ping = tokio::time::timeout(self.health_timeout, self.repository.ping());
        let rule_repository = match ping.await {
            Ok(Ok(())) => DependencyHealth {
                status: "up",
                latency_ms: elapsed_ms(started),
                detail: None,
            },
            Ok(Err(e)) => DependencyHealth {
                status: "down",
                latency_ms: elapsed_ms(started),
                detail: Some(e.to_string()),
            },
            Err(_) => DependencyHealth {
                status: "timeout",
                latency_ms: elapsed_ms(started),
                detail: Some(format!(
                    "no answer within {}ms",
                    self.health_timeout.as_millis()
                )),
            },
        };

        let started = Instant::now();
        let cache = {
            let stats = self.cache.stats();
            DependencyHealth {
                status: "up",
                latency_ms: elapsed_ms(started),
                detail: (!stats.enabled).then(|| "disabled".to_string()),
            }
        };

        let status = if rule_repository.is_up() && cache.is_up() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        ServiceHealth {
            status,
            rule_repository,
            cache,
        }
    }
}

/// One suggestion per critical or warning rule, in ranking order.
fn suggestions(rules: &[ValidationRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.severity() >= Severity::Warning)
        .map(|r| format!("[{}] {}", r.category(), r.text()))
        .collect()
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editorial::fixtures::{sample_rules, sample_service};
    use crate::editorial::repository::{RuleFilter, StaticRuleRepository};
    use async_trait::async_trait;
    use editorial_common::CheckpointType;

    #[tokio::test]
    async fn test_comprehensive_bounds_and_origin() {
        let (service, _) = sample_service();
        let response = service
            .validate_comprehensive(ValidationRequest::comprehensive(
                "AI agents transform workflows",
                Some("linkedin"),
                Some("post"),
            ))
            .await
            .unwrap();
        assert!((8..=12).contains(&response.rule_count));
        assert!(response.is_consistent());
        for rule in &response.rules_applied {
            assert!(!rule.origin().collection_name.is_empty());
            assert!(!rule.origin().document_id.is_empty());
            assert!(!rule.origin().timestamp.is_empty());
        }
        assert_eq!(response.metadata["strategy"], "comprehensive");
        assert_eq!(response.metadata["rule_sources"], json!(["editorial_rules"]));
        assert!(response.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_selective_echoes_checkpoint() {
        let (service, _) = sample_service();
        for checkpoint in CheckpointType::ALL {
            let response = service
                .validate_selective(ValidationRequest::selective(
                    "Test content",
                    Some("linkedin"),
                    checkpoint,
                ))
                .await
                .unwrap();
            assert!((3..=4).contains(&response.rule_count), "{checkpoint}");
            assert_eq!(response.checkpoint, Some(checkpoint));
        }
    }

    #[tokio::test]
    async fn test_second_identical_call_is_cached_with_same_order() {
        let (service, _) = sample_service();
        let request = ValidationRequest::comprehensive("Same content", Some("linkedin"), None);
        let first = service.validate_comprehensive(request.clone()).await.unwrap();
        let second = service.validate_comprehensive(request).await.unwrap();
        assert!(!first.cache_hit());
        assert!(second.cache_hit());
        assert_eq!(first.rules_applied, second.rules_applied);
        assert_eq!(service.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_selective_without_checkpoint_rejected() {
        let (service, _) = sample_service();
        let mut request = ValidationRequest::selective("x", None, CheckpointType::PreWriting);
        request.checkpoint = None;
        assert!(matches!(
            service.validate_selective(request).await,
            Err(ValidationError::MissingCheckpoint)
        ));
    }

    #[tokio::test]
    async fn test_comprehensive_with_checkpoint_rejected() {
        let (service, _) = sample_service();
        let mut request = ValidationRequest::comprehensive("x", None, None);
        request.checkpoint = Some(CheckpointType::PostWriting);
        assert!(matches!(
            service.validate(request).await,
            Err(ValidationError::InvalidModeCheckpointCombination { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let (service, _) = sample_service();
        let err = service
            .validate(ValidationRequest::comprehensive("  ", None, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "bad_request");
    }

    #[tokio::test]
    async fn test_repository_outage_propagates() {
        let (service, repo) = sample_service();
        repo.set_available(false);
        let err = service
            .validate(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::RepositoryUnavailable(_)));
        assert_eq!(service.metrics().summary().errors["repository_unavailable"], 1);
    }

    #[tokio::test]
    async fn test_insufficient_rules_not_padded() {
        let rules: Vec<_> = sample_rules().into_iter().take(5).collect();
        let service = ValidationService::new(
            Arc::new(StaticRuleRepository::new(rules)),
            Arc::new(ResponseCache::disabled()),
        );
        let err = service
            .validate_comprehensive(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientRules { available: 5, .. }));
    }

    #[tokio::test]
    async fn test_suggestions_cover_warning_and_critical_rules() {
        let (service, _) = sample_service();
        let response = service
            .validate_comprehensive(ValidationRequest::comprehensive("x", None, None))
            .await
            .unwrap();
        let expected = response
            .rules_applied
            .iter()
            .filter(|r| r.severity() != Severity::Info)
            .count();
        assert_eq!(response.suggestions.len(), expected);
        assert!(response.suggestions.iter().all(|s| s.starts_with('[')));
    }

    #[tokio::test]
    async fn test_health_healthy_then_degraded() {
        let (service, repo) = sample_service();
        assert_eq!(service.health().await.status, HealthStatus::Healthy);
        repo.set_available(false);
        let health = service.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.rule_repository.status, "down");
    }

    struct HangingRepository;

    #[async_trait]
    impl RuleRepository for HangingRepository {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn get_rules(
            &self,
            _filter: &RuleFilter,
        ) -> Result<Vec<ValidationRule>, ValidationError> {
            std::future::pending().await
        }

        async fn ping(&self) -> Result<(), ValidationError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_health_times_out_to_degraded() {
        let service = ValidationService::new(
            Arc::new(HangingRepository),
            Arc::new(ResponseCache::disabled()),
        )
        .with_health_timeout(Duration::from_millis(50));
        let health = service.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.rule_repository.status, "timeout");
    }
}
