//! Merge completion orchestration
//!
//! A candidate moves through readiness evaluation, a single merge, the
//! post-merge action pipeline and a completion checkpoint. [`Orchestrator`]
//! owns the state machine; the other modules are its stages.

pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod readiness;
pub mod timer;
pub mod types;

pub use checkpoint::{
    CompletionCheckpoint, CompletionError, CompletionErrorKind, CompletionOutcome,
    CompletionTiming, RollbackStep,
};
pub use config::{
    ActionConfig, CheckpointConfig, ConfigError, OrchestratorConfig, PipelineConfig,
    RequirementsConfig, TimeoutConfig,
};
pub use executor::MergeExecutor;
pub use lock::{CandidateFileLock, CandidateGuard, CandidateLocks};
pub use orchestrator::{
    Collaborators, Completion, FailureKind, FailureSummary, OrchestrationReport, OrchestrationState,
    Orchestrator, OrchestratorError, OrchestratorPaths, StateTransitionRecord,
};
pub use pipeline::{
    ActionEffect, ActionKind, ActionPipeline, ActionStatus, PipelineDeps, PipelineReport,
    PostMergeAction,
};
pub use readiness::ReadinessEvaluator;
pub use timer::{CancellationToken, Clock, ManualClock, SystemClock, Ticker, WaitOutcome};
pub use types::{
    BlockingIssue, ErrorKind, MergeCandidate, MergeError, MergeOutcome, ReadinessVerdict,
    Requirement, RequirementKind, RequirementStatus,
};
