//! Nondeterminism detection.
//!
//! A deterministic orchestrator re-claims every scheduling event already in
//! history when replayed. A schedule left unclaimed means the code changed
//! under a running instance; the instance is failed rather than allowed to
//! corrupt its history.

use crate::{ClaimedIds, HistoryEvent};

/// Scheduling events in history that the current code no longer awaits.
pub fn detect_await_mismatch(history: &[HistoryEvent], claims: &ClaimedIds) -> Option<String> {
    for e in history {
        let missing = match e {
            HistoryEvent::ActivityScheduled { id, name, .. } if !claims.activities.contains(id) => {
                Some(format!("activity '{name}' (id {id})"))
            }
            HistoryEvent::TimerCreated { id, .. } if !claims.timers.contains(id) => {
                Some(format!("timer (id {id})"))
            }
            HistoryEvent::ExternalSubscribed { id, name } if !claims.externals.contains(id) => {
                Some(format!("external subscription '{name}' (id {id})"))
            }
            HistoryEvent::SubOrchestrationScheduled { id, name, .. }
                if !claims.sub_orchestrations.contains(id) =>
            {
                Some(format!("sub-orchestration '{name}' (id {id})"))
            }
            _ => None,
        };
        if let Some(what) = missing {
            return Some(format!(
                "nondeterministic orchestration: history contains {what} the current code did not schedule"
            ));
        }
    }
    None
}

fn schedule_kind(history: &[HistoryEvent], id: u64) -> Option<&'static str> {
    history.iter().find_map(|e| match e {
        HistoryEvent::ActivityScheduled { id: sid, .. } if *sid == id => Some("activity"),
        HistoryEvent::TimerCreated { id: sid, .. } if *sid == id => Some("timer"),
        HistoryEvent::ExternalSubscribed { id: sid, .. } if *sid == id => Some("external"),
        HistoryEvent::SubOrchestrationScheduled { id: sid, .. } if *sid == id => Some("sub-orchestration"),
        _ => None,
    })
}

/// Completion events whose kind disagrees with their scheduling event.
pub fn detect_completion_kind_mismatch(history: &[HistoryEvent]) -> Option<String> {
    for e in history {
        let (id, kind) = match e {
            HistoryEvent::ActivityCompleted { id, .. } | HistoryEvent::ActivityFailed { id, .. } => {
                (*id, "activity")
            }
            HistoryEvent::TimerFired { id, .. } => (*id, "timer"),
            HistoryEvent::ExternalRaised { id, .. } => (*id, "external"),
            HistoryEvent::SubOrchestrationCompleted { id, .. }
            | HistoryEvent::SubOrchestrationFailed { id, .. } => (*id, "sub-orchestration"),
            _ => continue,
        };
        match schedule_kind(history, id) {
            Some(k) if k == kind => {}
            Some(k) => {
                return Some(format!(
                    "nondeterministic history: completion kind '{kind}' for id {id} does not match schedule kind '{k}'"
                ));
            }
            None => {
                return Some(format!(
                    "nondeterministic history: completion kind '{kind}' for id {id} has no scheduling event"
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn unclaimed_schedule_is_reported() {
        let history = vec![HistoryEvent::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        }];
        let claims = ClaimedIds::default();
        let err = detect_await_mismatch(&history, &claims).unwrap();
        assert!(err.contains("activity 'A'"));
    }

    #[test]
    fn claimed_schedules_pass() {
        let history = vec![HistoryEvent::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        }];
        let claims = ClaimedIds {
            activities: HashSet::from([1]),
            ..ClaimedIds::default()
        };
        assert!(detect_await_mismatch(&history, &claims).is_none());
    }

    #[test]
    fn mismatched_completion_kind_is_reported() {
        let history = vec![
            HistoryEvent::TimerCreated { id: 1, fire_at_ms: 0 },
            HistoryEvent::ActivityCompleted { id: 1, result: String::new() },
        ];
        assert!(detect_completion_kind_mismatch(&history).is_some());
    }
}
