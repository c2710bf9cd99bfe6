//! Shared domain types for the editorial validation service and the
//! orchestrator that calls it.

pub mod rule;
pub mod validation;

pub use rule::{
    OriginRecord, RuleCategory, RuleError, RuleOrigin, RuleRecord, Severity, ValidationRule,
};
pub use validation::{CheckpointType, ValidationMode, ValidationRequest, ValidationResponse};
