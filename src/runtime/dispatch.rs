//! Decision application: turn a replay's [`Action`]s into queue items.
//!
//! Each dispatch is guarded by history so a rehydrated instance does not
//! double-dispatch work that already completed.

use std::sync::Arc;

use tracing::warn;

use super::completions::has_completion;
use super::StartError;
use crate::providers::{QueueKind, WorkItem};
use crate::{Action, HistoryEvent, Runtime};

impl Runtime {
    pub(crate) async fn apply_actions(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &[HistoryEvent],
        actions: Vec<Action>,
    ) {
        for action in actions {
            match action {
                Action::CallActivity { id, name, input } => {
                    self.dispatch_call_activity(instance, execution_id, history, id, name, input).await;
                }
                Action::CreateTimer { id, fire_at_ms } => {
                    self.dispatch_create_timer(instance, execution_id, history, id, fire_at_ms).await;
                }
                Action::WaitExternal { .. } => {
                    // The subscription lives in history; nothing to enqueue.
                }
                Action::StartSubOrchestration { id, name, instance: child, input } => {
                    self.dispatch_start_sub_orchestration(instance, execution_id, history, id, name, child, input)
                        .await;
                }
            }
        }
    }

    async fn dispatch_call_activity(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &[HistoryEvent],
        id: u64,
        name: String,
        input: String,
    ) {
        if has_completion(history, id) {
            return;
        }
        let item = WorkItem::ActivityExecute {
            instance: instance.to_string(),
            execution_id,
            id,
            name,
            input,
            attempt: 1,
        };
        if let Err(e) = self.store().enqueue_work(QueueKind::Worker, item).await {
            warn!(instance = %instance, id, error = %e, "failed to enqueue activity");
        }
    }

    async fn dispatch_create_timer(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &[HistoryEvent],
        id: u64,
        fire_at_ms: u64,
    ) {
        if has_completion(history, id) {
            return;
        }
        let item = WorkItem::TimerSchedule { instance: instance.to_string(), execution_id, id, fire_at_ms };
        if let Err(e) = self.store().enqueue_work(QueueKind::Timer, item).await {
            warn!(instance = %instance, id, error = %e, "failed to enqueue timer");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_start_sub_orchestration(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &[HistoryEvent],
        id: u64,
        name: String,
        child: String,
        input: String,
    ) {
        if has_completion(history, id) {
            return;
        }
        // A rehydrated parent may re-dispatch a child that already exists.
        // Re-deliver a terminal child's result instead of starting it again.
        if self.store().latest_execution_id(&child).await.is_some() {
            let child_history = self.store().read(&child).await;
            match super::status::status_from_history(&child_history) {
                super::status::InstanceStatus::Completed { output } => {
                    self.enqueue_orchestrator(WorkItem::SubOrchCompleted {
                        parent_instance: instance.to_string(),
                        parent_execution_id: execution_id,
                        parent_id: id,
                        result: output,
                    })
                    .await;
                }
                super::status::InstanceStatus::Failed { error } => {
                    self.enqueue_orchestrator(WorkItem::SubOrchFailed {
                        parent_instance: instance.to_string(),
                        parent_execution_id: execution_id,
                        parent_id: id,
                        error,
                    })
                    .await;
                }
                super::status::InstanceStatus::Terminated { reason } => {
                    self.enqueue_orchestrator(WorkItem::SubOrchFailed {
                        parent_instance: instance.to_string(),
                        parent_execution_id: execution_id,
                        parent_id: id,
                        error: format!("terminated: {reason}"),
                    })
                    .await;
                }
                _ => self.ensure_instance_active(&child),
            }
            return;
        }
        match self
            .start_orchestration_with_parent(&child, &name, &input, instance, id)
            .await
        {
            Ok(()) => {}
            // Already started on an earlier activation; its terminal event
            // will reach us through the queue.
            Err(StartError::DuplicateInstance(_)) => {}
            Err(e) => {
                warn!(instance = %instance, child = %child, error = %e, "failed to start sub-orchestration");
                self.enqueue_orchestrator(WorkItem::SubOrchFailed {
                    parent_instance: instance.to_string(),
                    parent_execution_id: execution_id,
                    parent_id: id,
                    error: format!("failed to start sub-orchestration '{name}': {e}"),
                })
                .await;
            }
        }
    }
}
