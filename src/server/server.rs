use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState, Orchestration, SharedState};
use super::ws;
use crate::config::{EditorialConfig, RuleBackend, StateSection};
use crate::editorial::{
    ChromaRuleRepository, FileRuleRepository, ResponseCache, RuleRepository, ValidationService,
};
use crate::orchestrator::{
    CheckpointManager, EditorialClient, InMemoryStateStore, LocalValidator, RedisStateStore,
    RetryPolicy, SequenceTracker, StateStore, ValidationGateAgent, Validator,
};

/// Bound on the initial Redis handshake before falling back to memory.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

fn rule_repository(config: &EditorialConfig) -> Result<Arc<dyn RuleRepository>> {
    let rules = &config.rules;
    Ok(match rules.backend {
        RuleBackend::File => Arc::new(FileRuleRepository::new(&rules.file)),
        RuleBackend::Chroma => Arc::new(
            ChromaRuleRepository::new(
                &rules.chroma_url(),
                &rules.collection,
                Duration::from_millis(rules.timeout_ms),
            )
            .context("Failed to build ChromaDB rule repository")?,
        ),
    })
}

/// Redis when configured and reachable, otherwise process memory.
pub async fn open_state_store(state: &StateSection) -> Arc<dyn StateStore> {
    let fallback = || -> Arc<dyn StateStore> {
        Arc::new(InMemoryStateStore::with_ttl(Duration::from_secs(state.ttl_seconds)))
    };
    let Some(url) = state.redis_url.as_deref() else {
        warn!(
            "No Redis URL configured; checkpoint and sequence state is in-memory only (degraded)"
        );
        return fallback();
    };
    let connected =
        RedisStateStore::connect(url, &state.key_prefix, state.ttl_seconds, REDIS_CONNECT_TIMEOUT)
            .await;
    match connected {
        Ok(store) => {
            info!(prefix = %state.key_prefix, "Connected to Redis state store");
            Arc::new(store)
        }
        Err(e) => {
            warn!(error = %e, "Redis unreachable; falling back to in-memory state (degraded)");
            fallback()
        }
    }
}

/// Wire services for the configured role.
pub async fn build_state(config: &EditorialConfig) -> Result<SharedState> {
    let role = config.server.role;
    let (ws_tx, _rx) = broadcast::channel::<String>(256);

    let editorial = if role.serves_editorial() {
        let cache = if config.cache.enabled {
            ResponseCache::new(
                Duration::from_secs(config.cache.ttl_seconds),
                config.cache.max_entries,
            )
        } else {
            ResponseCache::disabled()
        };
        let service = ValidationService::new(rule_repository(config)?, Arc::new(cache))
            .with_health_timeout(config.editorial.health_timeout());
        info!(
            repository = service.repository_name(),
            cache = config.cache.enabled,
            "Validation service ready"
        );
        Some(Arc::new(service))
    } else {
        None
    };

    let orchestration = if role.serves_orchestrator() {
        let validator: Arc<dyn Validator> = match &editorial {
            Some(service) => Arc::new(LocalValidator::new(
                Arc::clone(service),
                RetryPolicy::from_config(&config.editorial),
            )),
            None => Arc::new(
                EditorialClient::new(&config.editorial)
                    .context("Failed to build editorial service client")?,
            ),
        };
        let store = open_state_store(&config.state).await;
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&store),
            Arc::clone(&validator),
            ws_tx.clone(),
        ));
        let sequences = Arc::new(
            SequenceTracker::new(
                store,
                Arc::new(ValidationGateAgent::new(Arc::clone(&validator))),
                ws_tx.clone(),
                Duration::from_secs(config.sequence.step_timeout_secs),
            )
            .with_skip_research_default(config.sequence.skip_research),
        );
        info!(
            validator = validator.name(),
            persistence = sequences.persistence(),
            "Orchestrator ready"
        );
        Some(Orchestration {
            validator,
            checkpoints,
            sequences,
        })
    } else {
        None
    };

    Ok(Arc::new(AppState {
        role,
        editorial,
        orchestration,
        ws_tx,
        started_at: Instant::now(),
    }))
}

/// Start the HTTP server and run until Ctrl+C.
pub async fn start_server(config: EditorialConfig) -> Result<()> {
    let state = build_state(&config).await?;
    let mut app = build_router(state);

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, role = %config.server.role, "Editorial service listening");
    println!("Editorial service running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler; shutdown signal disabled");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceRole;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn config_with_rules() -> EditorialConfig {
        let mut config = EditorialConfig::default();
        config.rules.file =
            std::path::PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/rules.yaml"));
        config
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let state = build_state(&config_with_rules()).await.unwrap();
        let app = build_router(state);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        // No Redis configured.
        assert_eq!(body["sequence_ready"], false);
        assert_eq!(body["persistence"], "degraded");
    }

    #[tokio::test]
    async fn test_file_backend_serves_validation() {
        let app = build_router(build_state(&config_with_rules()).await.unwrap());
        let req = Request::builder()
            .method("POST")
            .uri("/validate/selective")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"content":"Draft","platform":"linkedin","checkpoint":"post-writing"}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_rules_file_reports_degraded() {
        let mut config = EditorialConfig::default();
        config.rules.file = std::path::PathBuf::from("/nonexistent/rules.yaml");
        config.server.role = ServiceRole::Editorial;
        let app = build_router(build_state(&config).await.unwrap());
        let req = Request::builder().uri("/editorial/health").body(Body::empty()).unwrap();
        let body = json_body(app.oneshot(req).await.unwrap()).await;
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_orchestrator_role_uses_http_client() {
        let mut config = EditorialConfig::default();
        config.server.role = ServiceRole::Orchestrator;
        let state = build_state(&config).await.unwrap();
        assert!(state.editorial.is_none());
        let orchestration = state.orchestration.as_ref().unwrap();
        assert_eq!(orchestration.validator.name(), "http");
    }
}
