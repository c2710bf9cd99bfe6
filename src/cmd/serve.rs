//! HTTP service command (`editorial serve`).

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use editorial_orchestrator::config::EditorialConfig;

use super::super::ServeArgs;

/// Layer CLI flags over the file + environment configuration.
fn apply_flags(config: &mut EditorialConfig, args: &ServeArgs) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(role) = args.role {
        config.server.role = role;
    }
    if let Some(url) = &args.redis_url {
        config.state.redis_url = Some(url.clone());
    }
    if let Some(file) = &args.rules_file {
        config.rules.file = file.clone();
    }
    if let Some(url) = &args.editorial_url {
        config.editorial.service_url = url.clone();
    }
    if args.dev {
        config.server.dev_mode = true;
    }
    if args.json_logs {
        config.logging.json = true;
    }
}

pub async fn cmd_serve(config_path: Option<&Path>, cwd: &Path, args: &ServeArgs) -> Result<()> {
    let mut config = EditorialConfig::resolve(config_path, cwd)?;
    apply_flags(&mut config, args);

    let _guard = editorial_orchestrator::telemetry::init(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = %config.server.role,
        "Starting editorial service"
    );
    for warning in config.validate() {
        warn!(warning = %warning, "Configuration warning");
    }

    editorial_orchestrator::server::start_server(config).await
}
