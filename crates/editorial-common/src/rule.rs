//! Validation rules and their provenance.
//!
//! A [`ValidationRule`] can only be obtained through [`ValidationRule::new`]
//! or deserialization, and both paths reject rules whose [`RuleOrigin`] is
//! incomplete. There is no way to construct a rule that did not come from
//! the rule store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing a [`ValidationRule`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("Rule id must not be empty")]
    EmptyId,

    #[error("Rule {rule_id} has empty text")]
    EmptyText { rule_id: String },

    #[error("Rule {rule_id} is missing origin field '{field}'")]
    MissingOrigin { rule_id: String, field: &'static str },

    #[error("Invalid rule category: {0}")]
    InvalidCategory(String),

    #[error("Invalid rule severity: {0}")]
    InvalidSeverity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCategory {
    Tone,
    Structure,
    Grammar,
    Brand,
    PlatformSpecific,
    Style,
    Engagement,
    Compliance,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tone => "tone",
            Self::Structure => "structure",
            Self::Grammar => "grammar",
            Self::Brand => "brand",
            Self::PlatformSpecific => "platform-specific",
            Self::Style => "style",
            Self::Engagement => "engagement",
            Self::Compliance => "compliance",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleCategory {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "tone" => Ok(Self::Tone),
            "structure" => Ok(Self::Structure),
            "grammar" => Ok(Self::Grammar),
            "brand" => Ok(Self::Brand),
            "platform-specific" | "platform" => Ok(Self::PlatformSpecific),
            "style" => Ok(Self::Style),
            "engagement" => Ok(Self::Engagement),
            "compliance" => Ok(Self::Compliance),
            _ => Err(RuleError::InvalidCategory(s.to_string())),
        }
    }
}

/// Rule severity. Ordering is `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" | "low" => Ok(Self::Info),
            "warning" | "medium" => Ok(Self::Warning),
            "critical" | "high" => Ok(Self::Critical),
            _ => Err(RuleError::InvalidSeverity(s.to_string())),
        }
    }
}

/// Where a rule was read from in the rule store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleOrigin {
    pub collection_name: String,
    pub document_id: String,
    pub timestamp: String,
}

impl RuleOrigin {
    pub fn new(
        collection_name: impl Into<String>,
        document_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            collection_name: collection_name.into(),
            document_id: document_id.into(),
            timestamp: timestamp.into(),
        }
    }

    fn check(&self, rule_id: &str) -> Result<(), RuleError> {
        let fields = [
            ("collection_name", &self.collection_name),
            ("document_id", &self.document_id),
            ("timestamp", &self.timestamp),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(RuleError::MissingOrigin {
                    rule_id: rule_id.to_string(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// An immutable editorial rule sourced from the rule store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleRecord")]
pub struct ValidationRule {
    id: String,
    text: String,
    category: RuleCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    severity: Severity,
    origin: RuleOrigin,
}

impl ValidationRule {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        category: RuleCategory,
        severity: Severity,
        origin: RuleOrigin,
    ) -> Result<Self, RuleError> {
        let id = id.into();
        let text = text.into();
        if id.trim().is_empty() {
            return Err(RuleError::EmptyId);
        }
        if text.trim().is_empty() {
            return Err(RuleError::EmptyText { rule_id: id });
        }
        origin.check(&id)?;
        Ok(Self {
            id,
            text,
            category,
            platform: None,
            content_type: None,
            severity,
            origin,
        })
    }

    /// Scope the rule to a single platform (e.g. `linkedin`).
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = normalize_scope(platform.into());
        self
    }

    /// Scope the rule to a single content type (e.g. `article`).
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = normalize_scope(content_type.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn category(&self) -> RuleCategory {
        self.category
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn origin(&self) -> &RuleOrigin {
        &self.origin
    }
}

fn normalize_scope(value: String) -> Option<String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() || trimmed == "all" || trimmed == "*" {
        None
    } else {
        Some(trimmed)
    }
}

/// Loosely typed rule as it appears on the wire or in an export file.
///
/// Every origin field is optional here so that an incomplete record is
/// reported as [`RuleError::MissingOrigin`] instead of a generic serde error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub category: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub severity: String,
    #[serde(default)]
    pub origin: Option<OriginRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OriginRecord {
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TryFrom<RuleRecord> for ValidationRule {
    type Error = RuleError;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let category: RuleCategory = record.category.parse()?;
        let severity: Severity = record.severity.parse()?;
        let origin = record.origin.unwrap_or_default();
        let origin = RuleOrigin {
            collection_name: origin.collection_name.unwrap_or_default(),
            document_id: origin.document_id.unwrap_or_default(),
            timestamp: origin.timestamp.unwrap_or_default(),
        };
        let mut rule = ValidationRule::new(record.id, record.text, category, severity, origin)?;
        if let Some(platform) = record.platform {
            rule = rule.with_platform(platform);
        }
        if let Some(content_type) = record.content_type {
            rule = rule.with_content_type(content_type);
        }
        Ok(rule)
    }
}
