//! Idempotent completion application.
//!
//! Queue items are at-least-once, so a completion may arrive twice; the
//! second append is a no-op. A completion is matched to its scheduling event
//! by correlation id, or for external events by subscription name.

use tracing::warn;

use super::router::OrchestratorMsg;
use crate::HistoryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A completion for this id is already recorded.
    Duplicate,
    /// No matching scheduling event; the item is dropped.
    Unmatched,
}

pub fn has_completion(history: &[HistoryEvent], id: u64) -> bool {
    history.iter().any(|e| match e {
        HistoryEvent::ActivityCompleted { id: cid, .. }
        | HistoryEvent::ActivityFailed { id: cid, .. }
        | HistoryEvent::TimerFired { id: cid, .. }
        | HistoryEvent::ExternalRaised { id: cid, .. }
        | HistoryEvent::SubOrchestrationCompleted { id: cid, .. }
        | HistoryEvent::SubOrchestrationFailed { id: cid, .. } => *cid == id,
        _ => false,
    })
}

fn has_schedule(history: &[HistoryEvent], id: u64) -> bool {
    history.iter().any(|e| match e {
        HistoryEvent::ActivityScheduled { id: sid, .. }
        | HistoryEvent::TimerCreated { id: sid, .. }
        | HistoryEvent::ExternalSubscribed { id: sid, .. }
        | HistoryEvent::SubOrchestrationScheduled { id: sid, .. } => *sid == id,
        _ => false,
    })
}

/// Earliest subscription to `name` that has not yet received an event.
pub fn open_subscription(history: &[HistoryEvent], name: &str) -> Option<u64> {
    history.iter().find_map(|e| match e {
        HistoryEvent::ExternalSubscribed { id, name: n } if n == name && !has_completion(history, *id) => {
            Some(*id)
        }
        _ => None,
    })
}

/// Apply one completion message to a history. The caller persists the delta
/// and acks the queue item afterwards.
pub fn append_completion(history: &mut Vec<HistoryEvent>, msg: &OrchestratorMsg) -> AppendOutcome {
    match msg {
        OrchestratorMsg::ActivityCompleted { instance, id, result, .. } => {
            if !has_schedule(history, *id) {
                warn!(instance = %instance, id, "activity completion without a schedule");
                return AppendOutcome::Unmatched;
            }
            if has_completion(history, *id) {
                return AppendOutcome::Duplicate;
            }
            history.push(HistoryEvent::ActivityCompleted { id: *id, result: result.clone() });
            AppendOutcome::Appended
        }
        OrchestratorMsg::ActivityFailed { instance, id, error, .. } => {
            if !has_schedule(history, *id) {
                warn!(instance = %instance, id, "activity failure without a schedule");
                return AppendOutcome::Unmatched;
            }
            if has_completion(history, *id) {
                return AppendOutcome::Duplicate;
            }
            history.push(HistoryEvent::ActivityFailed { id: *id, error: error.clone() });
            AppendOutcome::Appended
        }
        OrchestratorMsg::TimerFired { instance, id, fire_at_ms, .. } => {
            if !has_schedule(history, *id) {
                warn!(instance = %instance, id, "timer fired without a schedule");
                return AppendOutcome::Unmatched;
            }
            if has_completion(history, *id) {
                return AppendOutcome::Duplicate;
            }
            history.push(HistoryEvent::TimerFired { id: *id, fire_at_ms: *fire_at_ms });
            AppendOutcome::Appended
        }
        OrchestratorMsg::ExternalRaised { instance, name, data, .. } => match open_subscription(history, name) {
            Some(id) => {
                history.push(HistoryEvent::ExternalRaised { id, name: name.clone(), data: data.clone() });
                AppendOutcome::Appended
            }
            None => {
                warn!(instance = %instance, name = %name, "external event without an open subscription");
                AppendOutcome::Unmatched
            }
        },
        OrchestratorMsg::SubOrchCompleted { instance, id, result, .. } => {
            if !has_schedule(history, *id) {
                warn!(instance = %instance, id, "sub-orchestration completion without a schedule");
                return AppendOutcome::Unmatched;
            }
            if has_completion(history, *id) {
                return AppendOutcome::Duplicate;
            }
            history.push(HistoryEvent::SubOrchestrationCompleted { id: *id, result: result.clone() });
            AppendOutcome::Appended
        }
        OrchestratorMsg::SubOrchFailed { instance, id, error, .. } => {
            if !has_schedule(history, *id) {
                warn!(instance = %instance, id, "sub-orchestration failure without a schedule");
                return AppendOutcome::Unmatched;
            }
            if has_completion(history, *id) {
                return AppendOutcome::Duplicate;
            }
            history.push(HistoryEvent::SubOrchestrationFailed { id: *id, error: error.clone() });
            AppendOutcome::Appended
        }
        // Termination is handled by the run loop, not by history matching.
        OrchestratorMsg::TerminateRequested { .. } => AppendOutcome::Unmatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_activity_completion_is_dropped() {
        let mut hist = vec![
            HistoryEvent::ActivityScheduled { id: 1, name: "A".into(), input: String::new() },
        ];
        let msg = OrchestratorMsg::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            id: 1,
            result: "ok".into(),
            ack_token: None,
        };
        assert_eq!(append_completion(&mut hist, &msg), AppendOutcome::Appended);
        assert_eq!(append_completion(&mut hist, &msg), AppendOutcome::Duplicate);
        assert_eq!(hist.len(), 2);
    }

    #[test]
    fn external_event_matches_earliest_open_subscription() {
        let mut hist = vec![
            HistoryEvent::ExternalSubscribed { id: 1, name: "Go".into() },
            HistoryEvent::ExternalSubscribed { id: 2, name: "Go".into() },
        ];
        let msg = OrchestratorMsg::ExternalRaised {
            instance: "i".into(),
            name: "Go".into(),
            data: "x".into(),
            ack_token: None,
        };
        assert_eq!(append_completion(&mut hist, &msg), AppendOutcome::Appended);
        assert!(matches!(hist.last(), Some(HistoryEvent::ExternalRaised { id: 1, .. })));
        assert_eq!(append_completion(&mut hist, &msg), AppendOutcome::Appended);
        assert!(matches!(hist.last(), Some(HistoryEvent::ExternalRaised { id: 2, .. })));
    }

    #[test]
    fn external_event_without_subscription_is_unmatched() {
        let mut hist = Vec::new();
        let msg = OrchestratorMsg::ExternalRaised {
            instance: "i".into(),
            name: "Go".into(),
            data: "x".into(),
            ack_token: None,
        };
        assert_eq!(append_completion(&mut hist, &msg), AppendOutcome::Unmatched);
        assert!(hist.is_empty());
    }
}
