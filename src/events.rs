//! Orchestration events and the sinks that receive them
//!
//! The orchestrator reports every state transition, readiness evaluation,
//! merge attempt, pipeline action, verification, rollback and completion as
//! an [`OrchestrationEvent`]. Sinks are best effort: [`EventEmitter`] logs a
//! sink failure and moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::external::git_host::{IssueNumber, PullNumber};
use crate::fs::FileSystemOperations;
use crate::merge::timer::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OrchestrationStarted,
    StateTransition,
    ReadinessEvaluated,
    MergeAttempted,
    MergeAdopted,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    ActionSkipped,
    VerificationCompleted,
    RollbackPerformed,
    OrchestrationCompleted,
    NextWorkRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub event_type: EventType,
    pub candidate_id: PullNumber,
    pub work_item: Option<IssueNumber>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum EventSinkError {
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to write event: {0}")]
    Io(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &OrchestrationEvent) -> Result<(), EventSinkError>;
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &OrchestrationEvent) -> Result<(), EventSinkError> {
        info!(
            event_type = ?event.event_type,
            candidate = event.candidate_id,
            work_item = ?event.work_item,
            correlation.id = %event.correlation_id,
            payload = %event.payload,
            "Orchestration event"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to an audit log
pub struct JsonlEventSink {
    fs: Arc<dyn FileSystemOperations>,
    path: String,
}

impl JsonlEventSink {
    pub fn new(fs: Arc<dyn FileSystemOperations>, path: impl Into<String>) -> Self {
        Self { fs, path: path.into() }
    }
}

impl std::fmt::Debug for JsonlEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlEventSink").field("path", &self.path).finish()
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn emit(&self, event: &OrchestrationEvent) -> Result<(), EventSinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.fs
            .append(&self.path, &line)
            .await
            .map_err(|e| EventSinkError::Io(e.to_string()))
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<OrchestrationEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: &OrchestrationEvent) -> Result<(), EventSinkError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Sends each event to every inner sink, reporting the first failure
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &OrchestrationEvent) -> Result<(), EventSinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Upper bound on a single sink call unless the run says otherwise
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(30);

/// Stamps events for one orchestration run and swallows sink failures
/// and hung sinks
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    correlation_id: String,
    candidate_id: PullNumber,
    work_item: Option<IssueNumber>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("correlation_id", &self.correlation_id)
            .field("candidate_id", &self.candidate_id)
            .field("work_item", &self.work_item)
            .finish()
    }
}

impl EventEmitter {
    pub fn new(
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        correlation_id: impl Into<String>,
        candidate_id: PullNumber,
        work_item: Option<IssueNumber>,
    ) -> Self {
        Self {
            sink,
            clock,
            timeout: DEFAULT_SINK_TIMEOUT,
            correlation_id: correlation_id.into(),
            candidate_id,
            work_item,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        let event = OrchestrationEvent {
            event_type,
            candidate_id: self.candidate_id,
            work_item: self.work_item,
            timestamp: self.clock.now(),
            correlation_id: self.correlation_id.clone(),
            payload,
        };
        match tokio::time::timeout(self.timeout, self.sink.emit(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                event_type = ?event_type,
                candidate = self.candidate_id,
                error = %e,
                "Event sink rejected event, continuing"
            ),
            Err(_) => warn!(
                event_type = ?event_type,
                candidate = self.candidate_id,
                timeout_ms = self.timeout.as_millis() as u64,
                "Event sink timed out, continuing"
            ),
        }
    }
}
