//! Rule repository: the only source of [`ValidationRule`]s.
//!
//! Backends convert raw records through the validating rule constructor, so
//! a rule without complete origin metadata can never leave this module.
//! Records that fail validation are dropped and logged, never patched.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use editorial_common::{RuleCategory, RuleRecord, ValidationMode, ValidationRule};

use crate::errors::ValidationError;

/// Query passed to [`RuleRepository::get_rules`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFilter {
    /// Keep rules scoped to this platform plus unscoped rules.
    pub platform: Option<String>,
    pub category: Option<RuleCategory>,
    pub mode: ValidationMode,
}

impl RuleFilter {
    pub fn for_mode(mode: ValidationMode) -> Self {
        Self {
            platform: None,
            category: None,
            mode,
        }
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    pub fn matches(&self, rule: &ValidationRule) -> bool {
        if let Some(category) = self.category
            && rule.category() != category
        {
            return false;
        }
        match (&self.platform, rule.platform()) {
            (Some(wanted), Some(scope)) => wanted == scope,
            _ => true,
        }
    }
}

/// Access to the backing rule store.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Fetch rules matching `filter`.
    ///
    /// An unreachable store is `RepositoryUnavailable`, never an empty list.
    async fn get_rules(&self, filter: &RuleFilter) -> Result<Vec<ValidationRule>, ValidationError>;

    /// Cheap reachability check used by `/health`.
    async fn ping(&self) -> Result<(), ValidationError>;
}

/// Convert raw records, dropping (and logging) any that fail validation.
fn accept_records(records: Vec<RuleRecord>, source: &str) -> Vec<ValidationRule> {
    let mut rules = Vec::with_capacity(records.len());
    for record in records {
        let id = record.id.clone();
        match ValidationRule::try_from(record) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!(source, rule_id = %id, error = %e, "Rejected rule record"),
        }
    }
    rules
}

// ── File-backed repository ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Wrapped { rules: Vec<RuleRecord> },
    List(Vec<RuleRecord>),
}

/// Reads an exported rule collection (YAML or JSON) on every query.
pub struct FileRuleRepository {
    path: PathBuf,
}

impl FileRuleRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<ValidationRule>, ValidationError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ValidationError::RepositoryUnavailable(format!(
                "Cannot read rule file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        // serde_yaml also accepts JSON documents.
        let file: RuleFile = serde_yaml::from_str(&content).map_err(|e| {
            ValidationError::RepositoryUnavailable(format!(
                "Cannot parse rule file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let records = match file {
            RuleFile::Wrapped { rules } => rules,
            RuleFile::List(rules) => rules,
        };
        Ok(accept_records(records, "file"))
    }
}

#[async_trait]
impl RuleRepository for FileRuleRepository {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get_rules(&self, filter: &RuleFilter) -> Result<Vec<ValidationRule>, ValidationError> {
        let rules = self.load().await?;
        let total = rules.len();
        let matched: Vec<ValidationRule> =
            rules.into_iter().filter(|r| filter.matches(r)).collect();
        debug!(
            path = %self.path.display(),
            total,
            matched = matched.len(),
            mode = %filter.mode,
            "Loaded rules from file"
        );
        Ok(matched)
    }

    async fn ping(&self) -> Result<(), ValidationError> {
        tokio::fs::metadata(&self.path).await.map(|_| ()).map_err(|e| {
            ValidationError::RepositoryUnavailable(format!(
                "Rule file {} not accessible: {}",
                self.path.display(),
                e
            ))
        })
    }
}

// ── In-memory repository ──────────────────────────────────────────────

/// Holds an already-validated rule set. Used when rules are loaded once by
/// an embedding application, and as a test double (`set_available(false)`
/// simulates an outage).
pub struct StaticRuleRepository {
    rules: Vec<ValidationRule>,
    available: AtomicBool,
}

impl StaticRuleRepository {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self {
            rules,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ValidationError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ValidationError::RepositoryUnavailable(
                "static rule set marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl RuleRepository for StaticRuleRepository {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_rules(&self, filter: &RuleFilter) -> Result<Vec<ValidationRule>, ValidationError> {
        self.check_available()?;
        Ok(self.rules.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn ping(&self) -> Result<(), ValidationError> {
        self.check_available()
    }
}

// ── ChromaDB repository ───────────────────────────────────────────────

/// Upper bound on documents fetched per query.
const CHROMA_FETCH_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
struct ChromaCollection {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChromaGetResponse {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Vec<Option<String>>,
    #[serde(default)]
    metadatas: Vec<Option<serde_json::Map<String, Value>>>,
}

/// Reads rules from a ChromaDB collection over its REST API.
///
/// Each document's text is the rule statement; its metadata carries
/// `rule_id`, `category`, `severity`, `timestamp` and optionally `platform`
/// and `content_type`. The collection name and Chroma document id complete
/// the origin.
pub struct ChromaRuleRepository {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    collection_id: OnceCell<String>,
}

impl ChromaRuleRepository {
    pub fn new(
        base_url: &str,
        collection: &str,
        timeout: Duration,
    ) -> Result<Self, ValidationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ValidationError::RepositoryUnavailable(format!("HTTP client setup failed: {}", e))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            collection_id: OnceCell::new(),
        })
    }

    fn unavailable(&self, what: &str, err: impl std::fmt::Display) -> ValidationError {
        ValidationError::RepositoryUnavailable(format!(
            "ChromaDB at {} {}: {}",
            self.base_url, what, err
        ))
    }

    async fn collection_id(&self) -> Result<&str, ValidationError> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let url = format!("{}/api/v1/collections/{}", self.base_url, self.collection);
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| self.unavailable("unreachable", e))?;
                if !resp.status().is_success() {
                    return Err(self.unavailable(
                        &format!("has no collection '{}'", self.collection),
                        resp.status(),
                    ));
                }
                let collection: ChromaCollection = resp
                    .json()
                    .await
                    .map_err(|e| self.unavailable("returned an invalid collection", e))?;
                Ok(collection.id)
            })
            .await?;
        Ok(id.as_str())
    }

    fn where_clause(filter: &RuleFilter) -> Option<Value> {
        filter
            .category
            .map(|category| json!({ "category": { "$eq": category.as_str() } }))
    }

    fn to_records(&self, response: ChromaGetResponse) -> Vec<RuleRecord> {
        let ChromaGetResponse {
            ids,
            documents,
            metadatas,
        } = response;
        ids.into_iter()
            .enumerate()
            .map(|(idx, doc_id)| {
                let text = documents.get(idx).cloned().flatten().unwrap_or_default();
                let meta = metadatas.get(idx).cloned().flatten().unwrap_or_default();
                let field = |key: &str| meta.get(key).and_then(|v| v.as_str()).map(str::to_string);
                RuleRecord {
                    id: field("rule_id").unwrap_or_else(|| doc_id.clone()),
                    text,
                    category: field("category").unwrap_or_default(),
                    platform: field("platform"),
                    content_type: field("content_type"),
                    severity: field("severity").unwrap_or_default(),
                    origin: Some(editorial_common::OriginRecord {
                        collection_name: Some(self.collection.clone()),
                        document_id: Some(doc_id),
                        timestamp: field("timestamp").or_else(|| field("created_at")),
                    }),
                }
            })
            .collect()
    }
}

#[async_trait]
impl RuleRepository for ChromaRuleRepository {
    fn name(&self) -> &'static str {
        "chroma"
    }

    async fn get_rules(&self, filter: &RuleFilter) -> Result<Vec<ValidationRule>, ValidationError> {
        let collection_id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{}/get", self.base_url, collection_id);
        let mut body = json!({
            "include": ["documents", "metadatas"],
            "limit": CHROMA_FETCH_LIMIT,
        });
        if let Some(clause) = Self::where_clause(filter) {
            body["where"] = clause;
        }

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable("unreachable", e))?;
        if !resp.status().is_success() {
            return Err(self.unavailable("rejected rule query", resp.status()));
        }
        let payload: ChromaGetResponse = resp
            .json()
            .await
            .map_err(|e| self.unavailable("returned an invalid query result", e))?;

        let rules = accept_records(self.to_records(payload), "chroma");
        Ok(rules.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn ping(&self) -> Result<(), ValidationError> {
        let url = format!("{}/api/v1/heartbeat", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unavailable("unreachable", e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.unavailable("heartbeat failed", resp.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use editorial_common::{RuleOrigin, Severity};
    use tempfile::tempdir;

    const RULES_YAML: &str = r#"
rules:
  - id: r1
    text: Open with a hook
    category: structure
    severity: critical
    platform: linkedin
    origin: { collection_name: editorial_rules, document_id: d1, timestamp: "2025-01-01T00:00:00Z" }
  - id: r2
    text: Keep sentences short
    category: style
    severity: info
    origin: { collection_name: editorial_rules, document_id: d2, timestamp: "2025-01-01T00:00:00Z" }
  - id: r3
    text: Use at most three hashtags
    category: platform-specific
    severity: warning
    platform: twitter
    origin: { collection_name: editorial_rules, document_id: d3, timestamp: "2025-01-01T00:00:00Z" }
  - id: hardcoded
    text: This rule has no provenance
    category: tone
    severity: info
"#;

    fn rule(id: &str, platform: Option<&str>) -> ValidationRule {
        let rule = ValidationRule::new(
            id,
            "text",
            RuleCategory::Tone,
            Severity::Info,
            RuleOrigin::new("c", id, "2025-01-01"),
        )
        .unwrap();
        match platform {
            Some(p) => rule.with_platform(p),
            None => rule,
        }
    }

    #[test]
    fn test_filter_keeps_unscoped_and_matching_platform() {
        let filter = RuleFilter::for_mode(ValidationMode::Comprehensive)
            .with_platform(Some("linkedin".into()));
        assert!(filter.matches(&rule("a", None)));
        assert!(filter.matches(&rule("b", Some("linkedin"))));
        assert!(!filter.matches(&rule("c", Some("twitter"))));
    }

    #[test]
    fn test_filter_by_category() {
        let mut filter = RuleFilter::for_mode(ValidationMode::Selective);
        filter.category = Some(RuleCategory::Grammar);
        assert!(!filter.matches(&rule("a", None)));
    }

    #[tokio::test]
    async fn test_file_repository_drops_rules_without_origin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, RULES_YAML).unwrap();

        let repo = FileRuleRepository::new(&path);
        let rules = repo
            .get_rules(&RuleFilter::for_mode(ValidationMode::Comprehensive))
            .await
            .unwrap();
        let ids: Vec<&str> = rules.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert!(rules.iter().all(|r| !r.origin().document_id.is_empty()));
    }

    #[tokio::test]
    async fn test_file_repository_applies_platform_filter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, RULES_YAML).unwrap();

        let repo = FileRuleRepository::new(&path);
        let filter = RuleFilter::for_mode(ValidationMode::Comprehensive)
            .with_platform(Some("linkedin".into()));
        let rules = repo.get_rules(&filter).await.unwrap();
        let ids: Vec<&str> = rules.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_file_repository_accepts_json_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"[{"id":"j1","text":"Avoid passive voice","category":"grammar","severity":"warning",
                "origin":{"collection_name":"c","document_id":"x","timestamp":"t"}}]"#,
        )
        .unwrap();
        let rules = FileRuleRepository::new(&path)
            .get_rules(&RuleFilter::for_mode(ValidationMode::Selective))
            .await
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].category(), RuleCategory::Grammar);
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable_not_empty() {
        let repo = FileRuleRepository::new("/nonexistent/rules.yaml");
        let err = repo
            .get_rules(&RuleFilter::for_mode(ValidationMode::Comprehensive))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::RepositoryUnavailable(_)));
        assert!(repo.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_static_repository_outage() {
        let repo = StaticRuleRepository::new(vec![rule("a", None)]);
        assert_eq!(
            repo.get_rules(&RuleFilter::for_mode(ValidationMode::Comprehensive))
                .await
                .unwrap()
                .len(),
            1
        );
        repo.set_available(false);
        assert!(matches!(
            repo.get_rules(&RuleFilter::for_mode(ValidationMode::Comprehensive)).await,
            Err(ValidationError::RepositoryUnavailable(_))
        ));
    }

    #[test]
    fn test_chroma_records_take_origin_from_collection_and_document() {
        let timeout = Duration::from_secs(1);
        let repo = ChromaRuleRepository::new("http://localhost:8000/", "editorial_rules", timeout)
            .unwrap();
        let response: ChromaGetResponse = serde_json::from_value(json!({
            "ids": ["doc-1", "doc-2"],
            "documents": ["Write in active voice", "Untimestamped rule"],
            "metadatas": [
                {
                    "rule_id": "grammar-active",
                    "category": "grammar",
                    "severity": "warning",
                    "timestamp": "2025-03-01"
                },
                {"rule_id": "no-ts", "category": "tone", "severity": "info"}
            ]
        }))
        .unwrap();
        let rules = accept_records(repo.to_records(response), "chroma");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id(), "grammar-active");
        assert_eq!(rules[0].origin().collection_name, "editorial_rules");
        assert_eq!(rules[0].origin().document_id, "doc-1");
    }

    #[tokio::test]
    async fn test_chroma_unreachable_is_unavailable() {
        let timeout = Duration::from_millis(200);
        let repo =
            ChromaRuleRepository::new("http://127.0.0.1:1", "editorial_rules", timeout).unwrap();
        let err = repo
            .get_rules(&RuleFilter::for_mode(ValidationMode::Comprehensive))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::RepositoryUnavailable(_)));
    }
}
