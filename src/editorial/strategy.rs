//! Validation strategies: how many rules a mode applies, and which.
//!
//! Each mode is its own type behind [`ValidationStrategy`]. The service never
//! branches on the mode itself; it asks [`StrategyFactory`] for the strategy
//! and delegates rule selection to it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use editorial_common::{
    CheckpointType, RuleCategory, ValidationMode, ValidationRequest, ValidationRule,
};

use super::repository::RuleFilter;
use super::scoring::{MetadataScorer, RelevanceScorer};
use crate::errors::ValidationError;

/// Inclusive bounds on the number of rules a strategy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleBounds {
    pub min: usize,
    pub max: usize,
}

pub const COMPREHENSIVE_BOUNDS: RuleBounds = RuleBounds { min: 8, max: 12 };
pub const SELECTIVE_BOUNDS: RuleBounds = RuleBounds { min: 3, max: 4 };

pub trait ValidationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn mode(&self) -> ValidationMode;

    fn bounds(&self) -> RuleBounds;

    /// Reject requests this mode cannot serve before any rule is read.
    fn check_request(&self, request: &ValidationRequest) -> Result<(), ValidationError>;

    /// Checkpoint echoed in the response.
    fn response_checkpoint(&self, request: &ValidationRequest) -> Option<CheckpointType>;

    /// Repository query for this request.
    fn rule_filter(&self, request: &ValidationRequest) -> RuleFilter {
        RuleFilter::for_mode(self.mode()).with_platform(request.normalized_platform())
    }

    /// Pick the rules to apply from `candidates`, best first.
    fn select_rules(
        &self,
        candidates: Vec<ValidationRule>,
        request: &ValidationRequest,
    ) -> Result<Vec<ValidationRule>, ValidationError>;
}

/// Score, deduplicate and order candidates.
///
/// Order is score descending, then severity descending, then id ascending,
/// so the same candidate set always yields the same ranking.
fn rank(
    scorer: &dyn RelevanceScorer,
    candidates: Vec<ValidationRule>,
    request: &ValidationRequest,
    in_scope: impl Fn(&ValidationRule) -> bool,
) -> Vec<ValidationRule> {
    let mut seen = HashSet::new();
    let mut scored: Vec<(u32, ValidationRule)> = candidates
        .into_iter()
        .filter(|rule| in_scope(rule))
        .filter_map(|rule| scorer.score(&rule, request).map(|score| (score, rule)))
        .filter(|(_, rule)| seen.insert(rule.id().to_string()))
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.cmp(sa)
            .then_with(|| b.severity().cmp(&a.severity()))
            .then_with(|| a.id().cmp(b.id()))
    });
    scored.into_iter().map(|(_, rule)| rule).collect()
}

fn take_within(
    mode: ValidationMode,
    bounds: RuleBounds,
    mut ranked: Vec<ValidationRule>,
) -> Result<Vec<ValidationRule>, ValidationError> {
    if ranked.len() < bounds.min {
        return Err(ValidationError::InsufficientRules {
            mode,
            required: bounds.min,
            available: ranked.len(),
        });
    }
    ranked.truncate(bounds.max);
    Ok(ranked)
}

/// Full rule-set check for automated workflows.
#[derive(Debug, Clone)]
pub struct ComprehensiveStrategy {
    scorer: Arc<dyn RelevanceScorer>,
}

impl ComprehensiveStrategy {
    pub fn new(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self { scorer }
    }
}

impl ValidationStrategy for ComprehensiveStrategy {
    fn name(&self) -> &'static str {
        "comprehensive"
    }

    fn mode(&self) -> ValidationMode {
        ValidationMode::Comprehensive
    }

    fn bounds(&self) -> RuleBounds {
        COMPREHENSIVE_BOUNDS
    }

    fn check_request(&self, request: &ValidationRequest) -> Result<(), ValidationError> {
        match request.checkpoint {
            Some(_) => Err(ValidationError::InvalidModeCheckpointCombination { mode: self.mode() }),
            None => Ok(()),
        }
    }

    fn response_checkpoint(&self, _request: &ValidationRequest) -> Option<CheckpointType> {
        None
    }

    fn select_rules(
        &self,
        candidates: Vec<ValidationRule>,
        request: &ValidationRequest,
    ) -> Result<Vec<ValidationRule>, ValidationError> {
        let ranked = rank(self.scorer.as_ref(), candidates, request, |_| true);
        take_within(self.mode(), self.bounds(), ranked)
    }
}

/// Categories that matter at each writing stage.
pub fn checkpoint_categories(checkpoint: CheckpointType) -> &'static [RuleCategory] {
    use RuleCategory::*;
    match checkpoint {
        CheckpointType::PreWriting => &[Structure, Brand, PlatformSpecific, Engagement],
        CheckpointType::MidWriting => &[Tone, Style, Brand, Structure],
        CheckpointType::PostWriting => &[Grammar, Tone, Style, Compliance, PlatformSpecific],
    }
}

/// Narrow, checkpoint-scoped check for human-assisted workflows.
#[derive(Debug, Clone)]
pub struct SelectiveStrategy {
    scorer: Arc<dyn RelevanceScorer>,
}

impl SelectiveStrategy {
    pub fn new(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self { scorer }
    }
}

impl ValidationStrategy for SelectiveStrategy {
    fn name(&self) -> &'static str {
        "selective"
    }

    fn mode(&self) -> ValidationMode {
        ValidationMode::Selective
    }

    fn bounds(&self) -> RuleBounds {
        SELECTIVE_BOUNDS
    }

    fn check_request(&self, request: &ValidationRequest) -> Result<(), ValidationError> {
        request.checkpoint.map(|_| ()).ok_or(ValidationError::MissingCheckpoint)
    }

    fn response_checkpoint(&self, request: &ValidationRequest) -> Option<CheckpointType> {
        request.checkpoint
    }

    fn select_rules(
        &self,
        candidates: Vec<ValidationRule>,
        request: &ValidationRequest,
    ) -> Result<Vec<ValidationRule>, ValidationError> {
        let checkpoint = request.checkpoint.ok_or(ValidationError::MissingCheckpoint)?;
        let categories = checkpoint_categories(checkpoint);
        let ranked = rank(self.scorer.as_ref(), candidates, request, |rule| {
            categories.contains(&rule.category())
        });
        take_within(self.mode(), self.bounds(), ranked)
    }
}

/// Maps a mode to its strategy.
#[derive(Debug, Clone)]
pub struct StrategyFactory {
    scorer: Arc<dyn RelevanceScorer>,
}

impl Default for StrategyFactory {
    fn default() -> Self {
        Self::with_scorer(Arc::new(MetadataScorer))
    }
}

impl StrategyFactory {
    pub fn with_scorer(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self { scorer }
    }

    /// Resolve a mode name; unknown names are `UnsupportedMode`.
    pub fn create(&self, mode: &str) -> Result<Box<dyn ValidationStrategy>, ValidationError> {
        let mode: ValidationMode = mode
            .parse()
            .map_err(|_| ValidationError::UnsupportedMode(mode.to_string()))?;
        Ok(self.for_mode(mode))
    }

    pub fn for_mode(&self, mode: ValidationMode) -> Box<dyn ValidationStrategy> {
        match mode {
            ValidationMode::Comprehensive => {
                Box::new(ComprehensiveStrategy::new(self.scorer.clone()))
            }
            ValidationMode::Selective => Box::new(SelectiveStrategy::new(self.scorer.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use editorial_common::{RuleOrigin, Severity};

    fn rule(id: &str, category: RuleCategory, severity: Severity) -> ValidationRule {
        ValidationRule::new(
            id,
            format!("rule {}", id),
            category,
            severity,
            RuleOrigin::new("editorial_rules", format!("doc-{}", id), "2025-01-01T00:00:00Z"),
        )
        .unwrap()
    }

    fn many(n: usize, category: RuleCategory) -> Vec<ValidationRule> {
        (0..n)
            .map(|i| rule(&format!("{}-{:02}", category, i), category, Severity::Info))
            .collect()
    }

    #[test]
    fn test_factory_returns_distinct_strategies() {
        let factory = StrategyFactory::default();
        let c = factory.create("comprehensive").unwrap();
        let s = factory.create("selective").unwrap();
        assert_eq!(c.name(), "comprehensive");
        assert_eq!(s.name(), "selective");
        assert_ne!(c.bounds(), s.bounds());
    }

    #[test]
    fn test_factory_rejects_unknown_mode() {
        let err = StrategyFactory::default().create("exhaustive").unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedMode(ref m) if m == "exhaustive"));
    }

    #[test]
    fn test_comprehensive_caps_at_twelve() {
        let request = ValidationRequest::comprehensive("x", None, None);
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Comprehensive);
        let rules = strategy.select_rules(many(20, RuleCategory::Tone), &request).unwrap();
        assert_eq!(rules.len(), 12);
    }

    #[test]
    fn test_comprehensive_below_minimum_is_error_not_padding() {
        let request = ValidationRequest::comprehensive("x", None, None);
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Comprehensive);
        let err = strategy.select_rules(many(7, RuleCategory::Tone), &request).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InsufficientRules { required: 8, available: 7, .. }
        ));
    }

    #[test]
    fn test_ranking_is_score_then_severity_then_id() {
        let request = ValidationRequest::comprehensive("x", Some("linkedin"), None);
        let mut candidates = many(6, RuleCategory::Style);
        candidates.push(rule("b-critical", RuleCategory::Tone, Severity::Critical));
        candidates.push(rule("a-critical", RuleCategory::Tone, Severity::Critical));
        let linkedin = rule("z-linkedin", RuleCategory::Brand, Severity::Info);
        candidates.push(linkedin.with_platform("linkedin"));
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Comprehensive);
        let rules = strategy.select_rules(candidates, &request).unwrap();
        let ids: Vec<&str> = rules.iter().map(|r| r.id()).collect();
        assert_eq!(&ids[..3], &["z-linkedin", "a-critical", "b-critical"]);
    }

    #[test]
    fn test_ranking_is_deterministic_regardless_of_input_order() {
        let request = ValidationRequest::comprehensive("x", None, None);
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Comprehensive);
        let forward = many(10, RuleCategory::Grammar);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            strategy.select_rules(forward, &request).unwrap(),
            strategy.select_rules(reversed, &request).unwrap()
        );
    }

    #[test]
    fn test_duplicate_ids_count_once() {
        let request = ValidationRequest::comprehensive("x", None, None);
        let mut candidates = many(7, RuleCategory::Tone);
        candidates.push(candidates[0].clone());
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Comprehensive);
        assert!(strategy.select_rules(candidates, &request).is_err());
    }

    #[test]
    fn test_selective_scopes_by_checkpoint() {
        let request = ValidationRequest::selective("x", None, CheckpointType::PostWriting);
        let mut candidates = many(5, RuleCategory::Engagement);
        candidates.extend(many(2, RuleCategory::Grammar));
        candidates.extend(many(1, RuleCategory::Compliance));
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Selective);
        let rules = strategy.select_rules(candidates, &request).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.category() != RuleCategory::Engagement));
    }

    #[test]
    fn test_selective_truncates_to_four() {
        let request = ValidationRequest::selective("x", None, CheckpointType::MidWriting);
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Selective);
        let rules = strategy.select_rules(many(9, RuleCategory::Tone), &request).unwrap();
        assert_eq!(rules.len(), 4);
    }

    #[test]
    fn test_selective_requires_checkpoint() {
        let mut request = ValidationRequest::selective("x", None, CheckpointType::MidWriting);
        request.checkpoint = None;
        let strategy = StrategyFactory::default().for_mode(ValidationMode::Selective);
        assert!(matches!(
            strategy.select_rules(many(4, RuleCategory::Tone), &request),
            Err(ValidationError::MissingCheckpoint)
        ));
    }

    #[test]
    fn test_strategies_own_checkpoint_rules() {
        let factory = StrategyFactory::default();
        let comprehensive = factory.create("comprehensive").unwrap();
        let selective = factory.create("selective").unwrap();

        let plain = ValidationRequest::comprehensive("x", None, None);
        let staged = ValidationRequest::selective("x", None, CheckpointType::MidWriting);
        assert!(comprehensive.check_request(&plain).is_ok());
        assert!(matches!(
            comprehensive.check_request(&staged),
            Err(ValidationError::InvalidModeCheckpointCombination { .. })
        ));
        assert!(selective.check_request(&staged).is_ok());
        assert!(matches!(
            selective.check_request(&plain),
            Err(ValidationError::MissingCheckpoint)
        ));

        assert_eq!(comprehensive.response_checkpoint(&staged), None);
        assert_eq!(selective.response_checkpoint(&staged), Some(CheckpointType::MidWriting));
    }

    #[test]
    fn test_every_checkpoint_has_categories() {
        for checkpoint in CheckpointType::ALL {
            assert!(checkpoint_categories(checkpoint).len() >= 4);
        }
    }
}
