//! Dual-mode editorial validation: rule sourcing, selection, caching.

pub mod cache;
pub mod metrics;
pub mod repository;
pub mod scoring;
pub mod service;
pub mod strategy;

#[cfg(test)]
pub(crate) mod fixtures;

pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use metrics::{MetricsSummary, ValidationMetrics};
pub use repository::{
    ChromaRuleRepository, FileRuleRepository, RuleFilter, RuleRepository, StaticRuleRepository,
};
pub use scoring::{MetadataScorer, RelevanceScorer};
pub use service::{HealthStatus, ServiceHealth, ValidationService};
pub use strategy::{StrategyFactory, ValidationStrategy};
