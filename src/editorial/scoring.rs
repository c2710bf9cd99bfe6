//! Relevance scoring of candidate rules against a request.

use editorial_common::{ValidationRequest, ValidationRule};

/// Scores how relevant a rule is to a request.
///
/// `None` means the rule does not apply at all and must be excluded.
pub trait RelevanceScorer: Send + Sync + std::fmt::Debug {
    fn score(&self, rule: &ValidationRule, request: &ValidationRequest) -> Option<u32>;
}

const PLATFORM_EXACT: u32 = 4;
const CONTENT_TYPE_EXACT: u32 = 2;
const UNSCOPED: u32 = 1;

/// Scores on platform and content-type scope metadata.
///
/// A rule scoped to a platform or content type other than the requested one
/// is excluded. Exact scope matches outrank unscoped rules, and a platform
/// match outweighs a content-type match.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataScorer;

impl MetadataScorer {
    fn dimension(scope: Option<&str>, wanted: Option<&str>, exact: u32) -> Option<u32> {
        match (scope, wanted) {
            (None, _) => Some(UNSCOPED),
            (Some(scope), Some(wanted)) if scope == wanted => Some(exact),
            _ => None,
        }
    }
}

impl RelevanceScorer for MetadataScorer {
    fn score(&self, rule: &ValidationRule, request: &ValidationRequest) -> Option<u32> {
        let platform = request.normalized_platform();
        let content_type = request.normalized_content_type();
        let p = Self::dimension(rule.platform(), platform.as_deref(), PLATFORM_EXACT)?;
        let c = Self::dimension(rule.content_type(), content_type.as_deref(), CONTENT_TYPE_EXACT)?;
        Some(p + c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use editorial_common::{RuleCategory, RuleOrigin, Severity};

    fn rule(platform: Option<&str>, content_type: Option<&str>) -> ValidationRule {
        let mut rule = ValidationRule::new(
            "r",
            "text",
            RuleCategory::Brand,
            Severity::Info,
            RuleOrigin::new("c", "d", "t"),
        )
        .unwrap();
        if let Some(p) = platform {
            rule = rule.with_platform(p);
        }
        if let Some(c) = content_type {
            rule = rule.with_content_type(c);
        }
        rule
    }

    #[test]
    fn test_exact_platform_beats_unscoped() {
        let request = ValidationRequest::comprehensive("x", Some("LinkedIn"), None);
        let scorer = MetadataScorer;
        let exact = scorer.score(&rule(Some("linkedin"), None), &request).unwrap();
        let unscoped = scorer.score(&rule(None, None), &request).unwrap();
        assert!(exact > unscoped);
    }

    #[test]
    fn test_other_platform_is_excluded() {
        let request = ValidationRequest::comprehensive("x", Some("linkedin"), None);
        assert_eq!(MetadataScorer.score(&rule(Some("twitter"), None), &request), None);
    }

    #[test]
    fn test_scoped_rule_excluded_when_request_has_no_scope() {
        let request = ValidationRequest::comprehensive("x", None, None);
        assert_eq!(MetadataScorer.score(&rule(Some("linkedin"), None), &request), None);
        assert_eq!(MetadataScorer.score(&rule(None, Some("article")), &request), None);
        assert!(MetadataScorer.score(&rule(None, None), &request).is_some());
    }

    #[test]
    fn test_content_type_match_adds_to_score() {
        let request = ValidationRequest::comprehensive("x", Some("linkedin"), Some("article"));
        let both = MetadataScorer
            .score(&rule(Some("linkedin"), Some("article")), &request)
            .unwrap();
        let platform_only = MetadataScorer.score(&rule(Some("linkedin"), None), &request).unwrap();
        assert!(both > platform_only);
    }
}
