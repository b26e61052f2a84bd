//! In-memory provider, the default store for tests and single-process runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    event_dedup_key, ConsumeOutcome, CorrelationRecord, HistoryStore, ProviderError, QueueKind, WorkItem,
};
use crate::{is_terminal_history, HistoryEvent};

const HISTORY_CAP: usize = 1024;

#[derive(Default)]
struct Queue {
    visible: VecDeque<WorkItem>,
    invisible: HashMap<String, WorkItem>,
}

#[derive(Default)]
struct Inner {
    /// instance -> executions, each an append-only event list.
    executions: HashMap<String, Vec<Vec<HistoryEvent>>>,
    orchestrator: Queue,
    worker: Queue,
    timer: Queue,
    entities: HashMap<String, String>,
    correlations: HashMap<String, CorrelationRecord>,
}

impl Inner {
    fn queue(&mut self, kind: QueueKind) -> &mut Queue {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator,
            QueueKind::Worker => &mut self.worker,
            QueueKind::Timer => &mut self.timer,
        }
    }
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<HistoryEvent> {
        let inner = self.inner.lock().unwrap();
        inner
            .executions
            .get(instance)
            .and_then(|execs| execs.last())
            .cloned()
            .unwrap_or_default()
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent> {
        let inner = self.inner.lock().unwrap();
        inner
            .executions
            .get(instance)
            .and_then(|execs| execs.get((execution_id as usize).saturating_sub(1)))
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<(), ProviderError> {
        let latest = {
            let inner = self.inner.lock().unwrap();
            inner.executions.get(instance).map(|e| e.len() as u64)
        };
        match latest {
            Some(id) if id > 0 => self.append_with_execution(instance, id, events).await,
            _ => Err(ProviderError::InstanceNotFound(instance.to_string())),
        }
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let hist = inner
            .executions
            .get_mut(instance)
            .and_then(|execs| execs.get_mut((execution_id as usize).saturating_sub(1)))
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        if is_terminal_history(hist) {
            // Late deliveries after a terminal event are dropped.
            return Ok(());
        }
        let seen: HashSet<_> = hist.iter().filter_map(event_dedup_key).collect();
        let fresh: Vec<_> = events
            .into_iter()
            .filter(|e| match event_dedup_key(e) {
                Some(k) => !seen.contains(&k),
                None => true,
            })
            .collect();
        if hist.len() + fresh.len() > HISTORY_CAP {
            return Err(ProviderError::CapacityExceeded {
                have: hist.len(),
                append: fresh.len(),
                cap: HISTORY_CAP,
            });
        }
        hist.extend(fresh);
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .executions
            .get(instance)
            .filter(|execs| !execs.is_empty())
            .map(|execs| execs.len() as u64)
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        let n = inner.executions.get(instance).map(|e| e.len()).unwrap_or(0);
        (1..=n as u64).collect()
    }

    async fn create_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        parent_id: Option<u64>,
    ) -> Result<u64, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let execs = inner.executions.entry(instance.to_string()).or_default();
        if let Some(latest) = execs.last() {
            if !is_terminal_history(latest) {
                return Err(ProviderError::DuplicateExecution(instance.to_string()));
            }
        }
        execs.push(vec![HistoryEvent::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            parent_instance: parent_instance.map(|s| s.to_string()),
            parent_id,
        }]);
        Ok(execs.len() as u64)
    }

    async fn list_instances(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<_> = inner.executions.keys().cloned().collect();
        names.sort();
        names
    }

    async fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.queue(kind).visible.push_back(item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner.queue(kind);
        let item = q.visible.pop_front()?;
        let token = Uuid::new_v4().to_string();
        q.invisible.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queue(kind)
            .invisible
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::Storage(format!("unknown {} lock token {token}", kind.as_str())))
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner.queue(kind);
        let item = q
            .invisible
            .remove(token)
            .ok_or_else(|| ProviderError::Storage(format!("unknown {} lock token {token}", kind.as_str())))?;
        q.visible.push_back(item);
        Ok(())
    }

    async fn read_entity(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.entities.get(key).cloned()
    }

    async fn write_entity(&self, key: &str, state: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entities.insert(key.to_string(), state.to_string());
        Ok(())
    }

    async fn list_entities(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<_> = inner.entities.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn put_correlation(
        &self,
        token: &str,
        instance: &str,
        event_name: &str,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.correlations.insert(
            token.to_string(),
            CorrelationRecord {
                instance: instance.to_string(),
                event_name: event_name.to_string(),
                consumed: false,
            },
        );
        Ok(())
    }

    async fn get_correlation(&self, token: &str) -> Option<CorrelationRecord> {
        let inner = self.inner.lock().unwrap();
        inner.correlations.get(token).cloned()
    }

    async fn consume_correlation(&self, token: &str) -> Result<ConsumeOutcome, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.correlations.get_mut(token) {
            None => Ok(ConsumeOutcome::Unknown),
            Some(rec) if rec.consumed => Ok(ConsumeOutcome::AlreadyConsumed),
            Some(rec) => {
                rec.consumed = true;
                Ok(ConsumeOutcome::Consumed(rec.clone()))
            }
        }
    }
}
