//! Checkpoint and sequence orchestration on top of the validation service.

pub mod breaker;
pub mod checkpoint;
pub mod client;
pub mod sequence;
pub mod store;

pub use breaker::{CircuitBreaker, CircuitState};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStatus, Intervention, NewCheckpoint};
pub use client::{EditorialClient, LocalValidator, RetryPolicy, Validator};
pub use sequence::{
    ActiveFlow, PipelineStep, Sequence, SequenceStatus, SequenceTracker, SequenceView,
    StartSequence, StepAgent, ValidationGateAgent,
};
pub use store::{InMemoryStateStore, RedisStateStore, StateStore};
