//! Instance status derived from history. Status is never stored separately;
//! the history is the only source of truth.

use serde::{Deserialize, Serialize};

use crate::HistoryEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    NotFound,
    /// Created but no turn has run yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed { .. } | InstanceStatus::Failed { .. } | InstanceStatus::Terminated { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::NotFound => "NotFound",
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed { .. } => "Completed",
            InstanceStatus::Failed { .. } => "Failed",
            InstanceStatus::Terminated { .. } => "Terminated",
        }
    }

    /// Terminal payload, if any: the output, error, or termination reason.
    pub fn detail(&self) -> Option<&str> {
        match self {
            InstanceStatus::Completed { output } => Some(output),
            InstanceStatus::Failed { error } => Some(error),
            InstanceStatus::Terminated { reason } => Some(reason),
            _ => None,
        }
    }
}

pub fn status_from_history(history: &[HistoryEvent]) -> InstanceStatus {
    if history.is_empty() {
        return InstanceStatus::NotFound;
    }
    match history.last() {
        Some(HistoryEvent::OrchestrationCompleted { output }) => {
            InstanceStatus::Completed { output: output.clone() }
        }
        Some(HistoryEvent::OrchestrationFailed { error }) => InstanceStatus::Failed { error: error.clone() },
        Some(HistoryEvent::OrchestrationTerminated { reason }) => {
            InstanceStatus::Terminated { reason: reason.clone() }
        }
        Some(HistoryEvent::OrchestrationStarted { .. }) if history.len() == 1 => InstanceStatus::Pending,
        _ => InstanceStatus::Running,
    }
}

/// Most recent custom status set by the orchestration, if any.
pub fn custom_status_from_history(history: &[HistoryEvent]) -> Option<String> {
    history.iter().rev().find_map(|e| match e {
        HistoryEvent::CustomStatusSet { status, .. } => Some(status.clone()),
        _ => None,
    })
}
