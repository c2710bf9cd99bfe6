//! Validation request/response envelope shared by the service and its clients.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::rule::ValidationRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Comprehensive,
    Selective,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comprehensive => "comprehensive",
            Self::Selective => "selective",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "comprehensive" => Ok(Self::Comprehensive),
            "selective" => Ok(Self::Selective),
            _ => Err(format!(
                "Unsupported validation mode '{}'. Valid values: comprehensive, selective",
                s
            )),
        }
    }
}

/// Writing stage a selective validation (or a human checkpoint) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointType {
    PreWriting,
    MidWriting,
    PostWriting,
}

impl CheckpointType {
    pub const ALL: [CheckpointType; 3] = [Self::PreWriting, Self::MidWriting, Self::PostWriting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreWriting => "pre-writing",
            Self::MidWriting => "mid-writing",
            Self::PostWriting => "post-writing",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "pre-writing" | "pre" => Ok(Self::PreWriting),
            "mid-writing" | "mid" => Ok(Self::MidWriting),
            "post-writing" | "post" => Ok(Self::PostWriting),
            _ => Err(format!(
                "Invalid checkpoint '{}'. Valid values: pre-writing, mid-writing, post-writing",
                s
            )),
        }
    }
}

/// Input to a validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub mode: ValidationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ValidationRequest {
    pub fn comprehensive(
        content: impl Into<String>,
        platform: Option<&str>,
        content_type: Option<&str>,
    ) -> Self {
        Self {
            content: content.into(),
            platform: platform.map(str::to_string),
            content_type: content_type.map(str::to_string),
            mode: ValidationMode::Comprehensive,
            checkpoint: None,
            context: BTreeMap::new(),
        }
    }

    pub fn selective(
        content: impl Into<String>,
        platform: Option<&str>,
        checkpoint: CheckpointType,
    ) -> Self {
        Self {
            content: content.into(),
            platform: platform.map(str::to_string),
            content_type: None,
            mode: ValidationMode::Selective,
            checkpoint: Some(checkpoint),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Platform lowercased and trimmed, `None` when unset or blank.
    pub fn normalized_platform(&self) -> Option<String> {
        normalize(self.platform.as_deref())
    }

    pub fn normalized_content_type(&self) -> Option<String> {
        normalize(self.content_type.as_deref())
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// Standard validation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub mode: ValidationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointType>,
    #[serde(alias = "rules")]
    pub rules_applied: Vec<ValidationRule>,
    pub rule_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ValidationResponse {
    /// Build an envelope; `rule_count` is always derived from `rules`.
    pub fn new(
        mode: ValidationMode,
        checkpoint: Option<CheckpointType>,
        rules: Vec<ValidationRule>,
    ) -> Self {
        Self {
            mode,
            checkpoint,
            rule_count: rules.len(),
            rules_applied: rules,
            suggestions: Vec::new(),
            processing_time_ms: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.rule_count == self.rules_applied.len()
    }

    pub fn cache_hit(&self) -> bool {
        self.metadata
            .get("cache_hit")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleCategory, RuleOrigin, Severity};

    fn rule(id: &str) -> ValidationRule {
        ValidationRule::new(
            id,
            "Lead with the outcome",
            RuleCategory::Structure,
            Severity::Warning,
            RuleOrigin::new("editorial_rules", id, "2025-01-01T00:00:00Z"),
        )
        .unwrap()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Selective".parse::<ValidationMode>().unwrap(), ValidationMode::Selective);
        let err = "fast".parse::<ValidationMode>().unwrap_err();
        assert!(err.contains("fast"));
    }

    #[test]
    fn test_checkpoint_type_serde_is_kebab_case() {
        let json = serde_json::to_string(&CheckpointType::PreWriting).unwrap();
        assert_eq!(json, "\"pre-writing\"");
        assert_eq!("post_writing".parse::<CheckpointType>().unwrap(), CheckpointType::PostWriting);
    }

    #[test]
    fn test_response_rule_count_tracks_rules() {
        let response = ValidationResponse::new(
            ValidationMode::Selective,
            Some(CheckpointType::MidWriting),
            vec![rule("a"), rule("b"), rule("c")],
        );
        assert_eq!(response.rule_count, 3);
        assert!(response.is_consistent());
        assert!(!response.cache_hit());
    }

    #[test]
    fn test_response_accepts_rules_alias() {
        let json = serde_json::json!({
            "mode": "selective",
            "checkpoint": "pre-writing",
            "rules": [serde_json::to_value(rule("a")).unwrap()],
            "rule_count": 1
        });
        let response: ValidationResponse = serde_json::from_value(json).unwrap();
        assert_eq!(response.rules_applied.len(), 1);
        assert_eq!(response.checkpoint, Some(CheckpointType::PreWriting));
    }

    #[test]
    fn test_request_normalizes_platform() {
        let request = ValidationRequest::comprehensive("Hello", Some(" LinkedIn "), Some(""));
        assert_eq!(request.normalized_platform().as_deref(), Some("linkedin"));
        assert_eq!(request.normalized_content_type(), None);
    }
}
