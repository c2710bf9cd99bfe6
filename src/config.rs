//! Layered configuration for the editorial service.
//!
//! Settings are read from `editorial.toml`, then overridden by environment
//! variables, then by CLI flags (applied by the `serve` command).
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8040
//! role = "all"            # all | editorial | orchestrator
//!
//! [editorial]
//! service_url = "http://localhost:8040"
//! request_timeout_ms = 5000
//! max_retries = 3
//! breaker_failure_threshold = 5
//! breaker_cooldown_secs = 30
//!
//! [rules]
//! backend = "file"        # file | chroma
//! file = "rules.yaml"
//! host = "localhost"
//! port = 8000
//! collection = "editorial_rules"
//!
//! [cache]
//! enabled = true
//! ttl_seconds = 300
//! max_entries = 1024
//!
//! [state]
//! redis_url = "redis://127.0.0.1:6379"
//! key_prefix = "editorial"
//!
//! [sequence]
//! step_timeout_secs = 120
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "editorial.toml";

/// Which halves of the service a process exposes.
///
/// | Role           | Routes                                   | Validator           |
/// |----------------|------------------------------------------|---------------------|
/// | `All`          | validation + cache + checkpoints + flows | in-process service  |
/// | `Editorial`    | validation + cache                       | n/a                 |
/// | `Orchestrator` | checkpoints + flows                      | HTTP client         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    #[default]
    All,
    Editorial,
    Orchestrator,
}

impl ServiceRole {
    pub fn serves_editorial(&self) -> bool {
        matches!(self, Self::All | Self::Editorial)
    }

    pub fn serves_orchestrator(&self) -> bool {
        matches!(self, Self::All | Self::Orchestrator)
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceRole::All => write!(f, "all"),
            ServiceRole::Editorial => write!(f, "editorial"),
            ServiceRole::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

impl FromStr for ServiceRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(ServiceRole::All),
            "editorial" => Ok(ServiceRole::Editorial),
            "orchestrator" => Ok(ServiceRole::Orchestrator),
            _ => anyhow::bail!(
                "Invalid service role '{}'. Valid values: all, editorial, orchestrator",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleBackend {
    /// YAML/JSON export of the rule collection.
    #[default]
    File,
    /// ChromaDB REST endpoint.
    Chroma,
}

impl fmt::Display for RuleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleBackend::File => write!(f, "file"),
            RuleBackend::Chroma => write!(f, "chroma"),
        }
    }
}

impl FromStr for RuleBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(RuleBackend::File),
            "chroma" | "chromadb" => Ok(RuleBackend::Chroma),
            _ => anyhow::bail!("Invalid rule backend '{}'. Valid values: file, chroma", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub role: ServiceRole,
    /// Permissive CORS for local UI development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8040
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            role: ServiceRole::default(),
            dev_mode: false,
        }
    }
}

/// How the orchestrator reaches the editorial service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorialSection {
    #[serde(default = "default_service_url")]
    pub service_url: String,
    /// Hard ceiling on a single validation call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    /// Bound on each dependency check in `/health`.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

fn default_service_url() -> String {
    "http://localhost:8040".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

impl Default for EditorialSection {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            health_timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl EditorialSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Worst case for one validation: every attempt times out and every
    /// backoff waits the maximum.
    pub fn retry_budget(&self) -> Duration {
        let attempts = self.max_retries as u64 + 1;
        Duration::from_millis(
            attempts * self.request_timeout_ms + self.max_retries as u64 * self.max_backoff_ms,
        )
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesSection {
    #[serde(default)]
    pub backend: RuleBackend,
    #[serde(default = "default_rules_file")]
    pub file: PathBuf,
    #[serde(default = "default_rule_store_host")]
    pub host: String,
    #[serde(default = "default_rule_store_port")]
    pub port: u16,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_rule_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_rules_file() -> PathBuf {
    PathBuf::from("rules.yaml")
}

fn default_rule_store_host() -> String {
    "localhost".to_string()
}

fn default_rule_store_port() -> u16 {
    8000
}

fn default_collection() -> String {
    "editorial_rules".to_string()
}

fn default_rule_store_timeout_ms() -> u64 {
    2_000
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            backend: RuleBackend::default(),
            file: default_rules_file(),
            host: default_rule_store_host(),
            port: default_rule_store_port(),
            collection: default_collection(),
            timeout_ms: default_rule_store_timeout_ms(),
        }
    }
}

impl RulesSection {
    pub fn chroma_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1_024
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Checkpoint/sequence persistence. Without `redis_url` the service runs
/// with in-memory state (degraded mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Expiry applied to every persisted record.
    #[serde(default = "default_state_ttl")]
    pub ttl_seconds: u64,
}

fn default_key_prefix() -> String {
    "editorial".to_string()
}

fn default_state_ttl() -> u64 {
    24 * 60 * 60
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_seconds: default_state_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSection {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Skip the research step for every flow unless a request says otherwise.
    #[serde(default)]
    pub skip_research: bool,
}

fn default_step_timeout() -> u64 {
    120
}

impl Default for SequenceSection {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            skip_research: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

/// The complete `editorial.toml` structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EditorialConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub editorial: EditorialSection,
    #[serde(default)]
    pub rules: RulesSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub sequence: SequenceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl EditorialConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse editorial.toml")
    }

    /// Load `path` if given, else `editorial.toml` in `dir` if present,
    /// else defaults. Environment overrides are applied afterwards.
    pub fn resolve(path: Option<&Path>, dir: &Path) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = dir.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize editorial.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("EDITORIAL_SERVICE_URL") {
            self.editorial.service_url = url;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.state.redis_url = if url.trim().is_empty() { None } else { Some(url) };
        }
        if let Some(backend) = lookup("RULE_STORE_BACKEND") {
            self.rules.backend = backend.parse()?;
        }
        if let Some(host) = lookup("RULE_STORE_HOST") {
            self.rules.host = host;
        }
        if let Some(port) = lookup("RULE_STORE_PORT") {
            self.rules.port = port
                .parse()
                .with_context(|| format!("Invalid RULE_STORE_PORT '{}'", port))?;
        }
        if let Some(collection) = lookup("RULE_STORE_COLLECTION") {
            self.rules.collection = collection;
        }
        if let Some(file) = lookup("RULES_FILE") {
            self.rules.file = PathBuf::from(file);
        }
        if let Some(ttl) = lookup("CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = ttl
                .parse()
                .with_context(|| format!("Invalid CACHE_TTL_SECONDS '{}'", ttl))?;
        }
        if let Some(port) = lookup("EDITORIAL_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid EDITORIAL_PORT '{}'", port))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !is_http_url(&self.editorial.service_url) {
            warnings.push(format!(
                "editorial.service_url '{}' should start with http:// or https://",
                self.editorial.service_url
            ));
        }
        if let Some(ref url) = self.state.redis_url
            && !(url.starts_with("redis://") || url.starts_with("rediss://"))
        {
            warnings.push(format!(
                "state.redis_url '{}' should start with redis:// or rediss://",
                url
            ));
        }
        if self.editorial.request_timeout_ms == 0 {
            warnings.push("editorial.request_timeout_ms must be greater than 0".to_string());
        }
        if self.editorial.breaker_failure_threshold == 0 {
            warnings.push(
                "editorial.breaker_failure_threshold of 0 never opens the breaker".to_string(),
            );
        }
        if self.editorial.initial_backoff_ms > self.editorial.max_backoff_ms {
            warnings.push(format!(
                "editorial.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.editorial.initial_backoff_ms, self.editorial.max_backoff_ms
            ));
        }
        if self.cache.enabled && self.cache.ttl_seconds == 0 {
            warnings.push("cache.ttl_seconds is 0; every entry expires immediately".to_string());
        }
        if self.sequence.step_timeout_secs == 0 {
            warnings.push("sequence.step_timeout_secs must be greater than 0".to_string());
        } else {
            let budget_ms = self.editorial.retry_budget().as_millis();
            if u128::from(self.sequence.step_timeout_secs) * 1000 < budget_ms {
                warnings.push(format!(
                    "sequence.step_timeout_secs ({}) is shorter than the editorial retry \
                     budget ({}ms); steps will time out before their last retry",
                    self.sequence.step_timeout_secs, budget_ms
                ));
            }
        }
        if self.rules.backend == RuleBackend::File && !self.rules.file.exists() {
            warnings.push(format!(
                "rules.file '{}' does not exist; validation will report the repository \
                 as unavailable",
                self.rules.file.display()
            ));
        }
        if !is_valid_log_level(&self.logging.level) {
            warnings.push(format!(
                "Invalid logging.level '{}': expected trace, debug, info, warn or error",
                self.logging.level
            ));
        }

        warnings
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_valid_log_level(level: &str) -> bool {
    // Allow full filter directives such as "info,tower_http=debug".
    level.contains('=')
        || matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        )
}
