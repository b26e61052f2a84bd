//! Storage providers.
//!
//! A [`HistoryStore`] owns everything durable: per-instance, per-execution
//! append-only histories, the three peek-lock work queues the runtime's
//! dispatchers poll, entity state documents, and single-use correlation
//! token records. The runtime keeps no state of its own that survives a
//! restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::HistoryEvent;

pub mod fs;
pub mod in_memory;

pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;

/// Error surface of provider operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("an active execution already exists for instance '{0}'")]
    DuplicateExecution(String),
    #[error("history capacity exceeded: have {have}, appending {append}, cap {cap}")]
    CapacityExceeded { have: usize, append: usize, cap: usize },
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProviderError {
    pub fn storage(e: impl std::fmt::Display) -> Self {
        ProviderError::Storage(e.to_string())
    }
}

/// Which of the provider queues a work item rides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Orchestrator => "orchestrator",
            QueueKind::Worker => "worker",
            QueueKind::Timer => "timer",
        }
    }
}

/// A unit of work on one of the provider queues.
///
/// Completion items carry the execution id they belong to so stale
/// deliveries from a previous execution can be dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        error: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

/// Persistent record behind a callback correlation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub instance: String,
    pub event_name: String,
    pub consumed: bool,
}

/// Result of the atomic token-consume operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Token existed and was unconsumed; it is now consumed.
    Consumed(CorrelationRecord),
    /// Token existed but a previous delivery already consumed it.
    AlreadyConsumed,
    /// No record for this token.
    Unknown,
}

/// Durable storage behind the runtime: histories, queues, entity documents,
/// and correlation tokens.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the latest execution's history; empty when the instance is
    /// unknown.
    async fn read(&self, instance: &str) -> Vec<HistoryEvent>;

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent>;

    /// Append to the latest execution. Appends are idempotent per
    /// correlation id and kind; re-delivered completions are dropped.
    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<(), ProviderError>;

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<(), ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    async fn list_executions(&self, instance: &str) -> Vec<u64>;

    /// Create a new execution seeded with `OrchestrationStarted`.
    ///
    /// Fails with [`ProviderError::DuplicateExecution`] when the latest
    /// execution of `instance` exists and is not terminal; a terminal
    /// instance id may be reused, getting a fresh execution.
    async fn create_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        parent_id: Option<u64>,
    ) -> Result<u64, ProviderError>;

    async fn list_instances(&self) -> Vec<String>;

    /// Drop all state. Test support.
    async fn reset(&self);

    // Peek-lock queues. `dequeue_peek_lock` hides the item until it is acked
    // or abandoned; an abandoned item becomes visible again.

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    // Entity state documents, keyed by "{type}/{key}".

    async fn read_entity(&self, key: &str) -> Option<String>;

    async fn write_entity(&self, key: &str, state: &str) -> Result<(), ProviderError>;

    async fn list_entities(&self) -> Vec<String>;

    // Correlation tokens for the callback gateway.

    async fn put_correlation(
        &self,
        token: &str,
        instance: &str,
        event_name: &str,
    ) -> Result<(), ProviderError>;

    async fn get_correlation(&self, token: &str) -> Option<CorrelationRecord>;

    /// Atomically consume a token; at most one caller ever observes
    /// [`ConsumeOutcome::Consumed`].
    async fn consume_correlation(&self, token: &str) -> Result<ConsumeOutcome, ProviderError>;
}

/// Dedup key for idempotent history appends.
pub(crate) fn event_dedup_key(e: &HistoryEvent) -> Option<(u64, &'static str)> {
    match e {
        HistoryEvent::ActivityScheduled { id, .. } => Some((*id, "activity_scheduled")),
        HistoryEvent::ActivityCompleted { id, .. } => Some((*id, "activity_completed")),
        HistoryEvent::ActivityFailed { id, .. } => Some((*id, "activity_failed")),
        HistoryEvent::TimerCreated { id, .. } => Some((*id, "timer_created")),
        HistoryEvent::TimerFired { id, .. } => Some((*id, "timer_fired")),
        HistoryEvent::ExternalSubscribed { id, .. } => Some((*id, "external_subscribed")),
        HistoryEvent::ExternalRaised { id, .. } => Some((*id, "external_raised")),
        HistoryEvent::SubOrchestrationScheduled { id, .. } => Some((*id, "sub_scheduled")),
        HistoryEvent::SubOrchestrationCompleted { id, .. } => Some((*id, "sub_completed")),
        HistoryEvent::SubOrchestrationFailed { id, .. } => Some((*id, "sub_failed")),
        HistoryEvent::CustomStatusSet { id, .. } => Some((*id, "custom_status")),
        HistoryEvent::OrchestrationStarted { .. }
        | HistoryEvent::OrchestrationCompleted { .. }
        | HistoryEvent::OrchestrationFailed { .. }
        | HistoryEvent::OrchestrationTerminated { .. } => None,
    }
}
