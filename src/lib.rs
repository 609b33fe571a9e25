// merge-conductor library - merge completion orchestration
// This exposes the core components for testing and integration

pub mod cli;
pub mod config;
pub mod events;
pub mod external;
pub mod fs;
pub mod github;
pub mod merge;
pub mod observability;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use config::MergeConductorConfig;
pub use events::{EventEmitter, EventSink, EventType, OrchestrationEvent};
pub use external::{CiProvider, CollaboratorError, Deployer, GitHost, Notifier};
pub use github::{GitHubClient, GitHubError};
pub use merge::{
    CancellationToken, Collaborators, CompletionOutcome, MergeCandidate, OrchestrationReport,
    OrchestrationState, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorPaths,
    ReadinessVerdict,
};
pub use telemetry::{create_orchestration_span, generate_correlation_id, init_telemetry};
