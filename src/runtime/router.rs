//! Per-instance completion routing.
//!
//! Each active instance registers an unbounded inbox; dispatchers forward
//! completion messages into it. A message carries the provider's lock token
//! so the run loop acks only after the completion is persisted. Delivery to
//! an inactive instance fails and the caller rehydrates it first.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
        ack_token: Option<String>,
    },
    SubOrchCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    SubOrchFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TerminateRequested {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalRaised { instance, .. }
            | OrchestratorMsg::SubOrchCompleted { instance, .. }
            | OrchestratorMsg::SubOrchFailed { instance, .. }
            | OrchestratorMsg::TerminateRequested { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalRaised { ack_token, .. }
            | OrchestratorMsg::SubOrchCompleted { ack_token, .. }
            | OrchestratorMsg::SubOrchFailed { ack_token, .. }
            | OrchestratorMsg::TerminateRequested { ack_token, .. } => ack_token.as_deref(),
        }
    }

    /// Execution the message targets, when it is execution-scoped.
    pub fn execution_id(&self) -> Option<u64> {
        match self {
            OrchestratorMsg::ActivityCompleted { execution_id, .. }
            | OrchestratorMsg::ActivityFailed { execution_id, .. }
            | OrchestratorMsg::TimerFired { execution_id, .. }
            | OrchestratorMsg::SubOrchCompleted { execution_id, .. }
            | OrchestratorMsg::SubOrchFailed { execution_id, .. } => Some(*execution_id),
            OrchestratorMsg::ExternalRaised { .. } | OrchestratorMsg::TerminateRequested { .. } => None,
        }
    }
}

#[derive(Default)]
pub struct InstanceRouter {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox for an activating instance, replacing any stale one.
    pub fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().unwrap().insert(instance.to_string(), tx);
        rx
    }

    pub fn unregister(&self, instance: &str) {
        self.inboxes.lock().unwrap().remove(instance);
    }

    /// Forward a message to the instance's inbox. Returns the message when
    /// the instance has no live inbox so the caller can rehydrate and retry.
    pub fn try_send(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let inboxes = self.inboxes.lock().unwrap();
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => Err(msg),
        }
    }
}
