//! In-process timer service.
//!
//! The timer dispatcher hands scheduled timers to this service; it sleeps
//! until the earliest deadline and enqueues `TimerFired` work items back on
//! the orchestrator queue. Firing order for identical deadlines follows
//! insertion order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::providers::{HistoryStore, QueueKind, WorkItem};

#[derive(Debug, Clone)]
pub(crate) struct PendingTimer {
    pub instance: String,
    pub execution_id: u64,
    pub id: u64,
    pub fire_at_ms: u64,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    entries: HashMap<u64, PendingTimer>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn push(&mut self, timer: PendingTimer) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((timer.fire_at_ms, seq)));
        self.entries.insert(seq, timer);
    }

    pub fn next_due_ms(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    /// Remove and return every timer due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<PendingTimer> {
        let mut due = Vec::new();
        while let Some(Reverse((fire_at, seq))) = self.heap.peek().copied() {
            if fire_at > now_ms {
                break;
            }
            self.heap.pop();
            if let Some(t) = self.entries.remove(&seq) {
                due.push(t);
            }
        }
        due
    }
}

const MAX_PARK_MS: u64 = 60_000;

pub(crate) fn start_timer_service(
    store: Arc<dyn HistoryStore>,
) -> (mpsc::UnboundedSender<PendingTimer>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PendingTimer>();
    let join = tokio::spawn(async move {
        let mut queue = TimerQueue::default();
        loop {
            let park_ms = queue
                .next_due_ms()
                .map(|due| due.saturating_sub(super::now_ms()))
                .unwrap_or(MAX_PARK_MS)
                .min(MAX_PARK_MS);
            tokio::select! {
                item = rx.recv() => match item {
                    Some(t) => queue.push(t),
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(park_ms)) => {}
            }
            for t in queue.pop_due(super::now_ms()) {
                let item = WorkItem::TimerFired {
                    instance: t.instance,
                    execution_id: t.execution_id,
                    id: t.id,
                    fire_at_ms: t.fire_at_ms,
                };
                if let Err(e) = store.enqueue_work(QueueKind::Orchestrator, item).await {
                    warn!(error = %e, "failed to enqueue fired timer");
                }
            }
        }
    });
    (tx, join)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(id: u64, fire_at_ms: u64) -> PendingTimer {
        PendingTimer { instance: "i".into(), execution_id: 1, id, fire_at_ms }
    }

    #[test]
    fn fires_due_timers_in_order() {
        let mut q = TimerQueue::default();
        q.push(timer(3, 300));
        q.push(timer(1, 100));
        q.push(timer(2, 200));
        let due: Vec<u64> = q.pop_due(250).into_iter().map(|t| t.id).collect();
        assert_eq!(due, vec![1, 2]);
        assert_eq!(q.next_due_ms(), Some(300));
    }

    #[test]
    fn identical_deadlines_fire_in_insertion_order() {
        let mut q = TimerQueue::default();
        q.push(timer(10, 100));
        q.push(timer(11, 100));
        let due: Vec<u64> = q.pop_due(100).into_iter().map(|t| t.id).collect();
        assert_eq!(due, vec![10, 11]);
    }
}
