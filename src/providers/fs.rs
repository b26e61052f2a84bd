//! Filesystem provider: JSONL histories, queue files with atomic rewrites,
//! and lock sidecars for peek-lock tokens. Slow but durable; built for
//! crash/restart tests and local runs.
//!
//! Layout under the root directory:
//!   instances/{instance}/{execution}.jsonl   one event per line
//!   queues/{kind}.jsonl                      visible items, one per line
//!   queues/locks/{kind}/{token}.json         in-flight item per lock token
//!   entities/{type}/{key}.json               entity state document
//!   tokens/{token}.json                      correlation record

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use super::{
    event_dedup_key, ConsumeOutcome, CorrelationRecord, HistoryStore, ProviderError, QueueKind, WorkItem,
};
use crate::{is_terminal_history, HistoryEvent};

pub struct FsHistoryStore {
    root: PathBuf,
    // One lock for all read-modify-write sequences; individual files are
    // swapped in with tmp + rename so readers never see a torn file.
    io: Mutex<()>,
}

impl FsHistoryStore {
    pub fn new(root: &Path, reset: bool) -> Self {
        if reset {
            let _ = fs::remove_dir_all(root);
        }
        let store = Self { root: root.to_path_buf(), io: Mutex::new(()) };
        store.ensure_layout();
        store.recover_locked_items();
        store
    }

    // A lock sidecar left behind by a crash holds an item that was dequeued
    // but never acked or abandoned; return it to its queue on open.
    fn recover_locked_items(&self) {
        let _g = self.io.lock().unwrap();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let dir = self.root.join("queues").join("locks").join(kind.as_str());
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut recovered = Vec::new();
            for e in entries.flatten() {
                let path = e.path();
                match fs::read_to_string(&path).map_err(ProviderError::storage).and_then(|data| {
                    serde_json::from_str::<WorkItem>(&data).map_err(ProviderError::storage)
                }) {
                    Ok(item) => recovered.push(item),
                    Err(e) => warn!(path = %path.display(), error = %e, "dropping unreadable lock sidecar"),
                }
                let _ = fs::remove_file(&path);
            }
            if recovered.is_empty() {
                continue;
            }
            warn!(queue = kind.as_str(), count = recovered.len(), "requeueing items locked at last shutdown");
            let qpath = self.queue_path(kind);
            let mut items = Self::read_queue_file(&qpath);
            items.extend(recovered);
            if let Err(e) = Self::write_queue_file(&qpath, &items) {
                warn!(queue = kind.as_str(), error = %e, "failed to requeue recovered items");
            }
        }
    }

    fn ensure_layout(&self) {
        for sub in ["instances", "queues", "entities", "tokens"] {
            let _ = fs::create_dir_all(self.root.join(sub));
        }
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let _ = fs::create_dir_all(self.root.join("queues").join("locks").join(kind.as_str()));
        }
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }

    fn execution_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.instance_dir(instance).join(format!("{execution_id}.jsonl"))
    }

    fn queue_path(&self, kind: QueueKind) -> PathBuf {
        self.root.join("queues").join(format!("{}.jsonl", kind.as_str()))
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.root.join("queues").join("locks").join(kind.as_str()).join(format!("{token}.json"))
    }

    fn token_path(&self, token: &str) -> PathBuf {
        self.root.join("tokens").join(format!("{token}.json"))
    }

    fn read_history_file(path: &Path) -> Vec<HistoryEvent> {
        let Ok(data) = fs::read_to_string(path) else {
            return Vec::new();
        };
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable history line");
                    None
                }
            })
            .collect()
    }

    fn executions_on_disk(&self, instance: &str) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(self.instance_dir(instance)) else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = entries
            .flatten()
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    fn read_queue_file(path: &Path) -> Vec<WorkItem> {
        let Ok(data) = fs::read_to_string(path) else {
            return Vec::new();
        };
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<(), ProviderError> {
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).map_err(ProviderError::storage)?;
        f.write_all(contents.as_bytes()).map_err(ProviderError::storage)?;
        f.sync_all().map_err(ProviderError::storage)?;
        fs::rename(&tmp, path).map_err(ProviderError::storage)
    }

    fn write_queue_file(path: &Path, items: &[WorkItem]) -> Result<(), ProviderError> {
        let mut contents = String::new();
        for item in items {
            contents.push_str(&serde_json::to_string(item).map_err(ProviderError::storage)?);
            contents.push('\n');
        }
        Self::write_atomic(path, &contents)
    }

    fn append_events(
        &self,
        instance: &str,
        execution_id: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<(), ProviderError> {
        let path = self.execution_path(instance, execution_id);
        if !path.exists() {
            return Err(ProviderError::InstanceNotFound(instance.to_string()));
        }
        let existing = Self::read_history_file(&path);
        if is_terminal_history(&existing) {
            return Ok(());
        }
        let seen: std::collections::HashSet<_> = existing.iter().filter_map(event_dedup_key).collect();
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(ProviderError::storage)?;
        for e in events {
            if let Some(k) = event_dedup_key(&e) {
                if seen.contains(&k) {
                    continue;
                }
            }
            let line = serde_json::to_string(&e).map_err(ProviderError::storage)?;
            writeln!(f, "{line}").map_err(ProviderError::storage)?;
        }
        f.sync_all().map_err(ProviderError::storage)
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<HistoryEvent> {
        let _g = self.io.lock().unwrap();
        match self.executions_on_disk(instance).last() {
            Some(id) => Self::read_history_file(&self.execution_path(instance, *id)),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent> {
        let _g = self.io.lock().unwrap();
        Self::read_history_file(&self.execution_path(instance, execution_id))
    }

    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        let latest = self
            .executions_on_disk(instance)
            .last()
            .copied()
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        self.append_events(instance, latest, events)
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        self.append_events(instance, execution_id, events)
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let _g = self.io.lock().unwrap();
        self.executions_on_disk(instance).last().copied()
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let _g = self.io.lock().unwrap();
        self.executions_on_disk(instance)
    }

    async fn create_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        parent_id: Option<u64>,
    ) -> Result<u64, ProviderError> {
        let _g = self.io.lock().unwrap();
        let execs = self.executions_on_disk(instance);
        if let Some(latest) = execs.last() {
            let hist = Self::read_history_file(&self.execution_path(instance, *latest));
            if !is_terminal_history(&hist) {
                return Err(ProviderError::DuplicateExecution(instance.to_string()));
            }
        }
        let next = execs.last().copied().unwrap_or(0) + 1;
        fs::create_dir_all(self.instance_dir(instance)).map_err(ProviderError::storage)?;
        let started = HistoryEvent::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            parent_instance: parent_instance.map(|s| s.to_string()),
            parent_id,
        };
        let line = serde_json::to_string(&started).map_err(ProviderError::storage)?;
        Self::write_atomic(&self.execution_path(instance, next), &format!("{line}\n"))?;
        Ok(next)
    }

    async fn list_instances(&self) -> Vec<String> {
        let _g = self.io.lock().unwrap();
        let Ok(entries) = fs::read_dir(self.root.join("instances")) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        names.sort();
        names
    }

    async fn reset(&self) {
        let _g = self.io.lock().unwrap();
        let _ = fs::remove_dir_all(&self.root);
        self.ensure_layout();
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        let path = self.queue_path(kind);
        let mut items = Self::read_queue_file(&path);
        items.push(item);
        Self::write_queue_file(&path, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.io.lock().unwrap();
        let path = self.queue_path(kind);
        let mut items = Self::read_queue_file(&path);
        if items.is_empty() {
            return None;
        }
        let item = items.remove(0);
        Self::write_queue_file(&path, &items).ok()?;
        let token = Uuid::new_v4().to_string();
        let lock = serde_json::to_string(&item).ok()?;
        Self::write_atomic(&self.lock_path(kind, &token), &lock).ok()?;
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        fs::remove_file(self.lock_path(kind, token)).map_err(ProviderError::storage)
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        let lock_path = self.lock_path(kind, token);
        let data = fs::read_to_string(&lock_path).map_err(ProviderError::storage)?;
        let item: WorkItem = serde_json::from_str(&data).map_err(ProviderError::storage)?;
        fs::remove_file(&lock_path).map_err(ProviderError::storage)?;
        let path = self.queue_path(kind);
        let mut items = Self::read_queue_file(&path);
        items.push(item);
        Self::write_queue_file(&path, &items)
    }

    async fn read_entity(&self, key: &str) -> Option<String> {
        let _g = self.io.lock().unwrap();
        fs::read_to_string(self.root.join("entities").join(format!("{key}.json"))).ok()
    }

    async fn write_entity(&self, key: &str, state: &str) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        let path = self.root.join("entities").join(format!("{key}.json"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ProviderError::storage)?;
        }
        Self::write_atomic(&path, state)
    }

    async fn list_entities(&self) -> Vec<String> {
        let _g = self.io.lock().unwrap();
        let root = self.root.join("entities");
        let mut keys = Vec::new();
        let Ok(types) = fs::read_dir(&root) else {
            return keys;
        };
        for t in types.flatten() {
            if !t.path().is_dir() {
                continue;
            }
            let Some(etype) = t.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            if let Ok(files) = fs::read_dir(t.path()) {
                for f in files.flatten() {
                    if let Some(stem) = f.path().file_stem().and_then(|s| s.to_str()) {
                        keys.push(format!("{etype}/{stem}"));
                    }
                }
            }
        }
        keys.sort();
        keys
    }

    async fn put_correlation(
        &self,
        token: &str,
        instance: &str,
        event_name: &str,
    ) -> Result<(), ProviderError> {
        let _g = self.io.lock().unwrap();
        let rec = CorrelationRecord {
            instance: instance.to_string(),
            event_name: event_name.to_string(),
            consumed: false,
        };
        let data = serde_json::to_string(&rec).map_err(ProviderError::storage)?;
        Self::write_atomic(&self.token_path(token), &data)
    }

    async fn get_correlation(&self, token: &str) -> Option<CorrelationRecord> {
        let _g = self.io.lock().unwrap();
        let data = fs::read_to_string(self.token_path(token)).ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn consume_correlation(&self, token: &str) -> Result<ConsumeOutcome, ProviderError> {
        let _g = self.io.lock().unwrap();
        let path = self.token_path(token);
        let Ok(data) = fs::read_to_string(&path) else {
            return Ok(ConsumeOutcome::Unknown);
        };
        let mut rec: CorrelationRecord = serde_json::from_str(&data).map_err(ProviderError::storage)?;
        if rec.consumed {
            return Ok(ConsumeOutcome::AlreadyConsumed);
        }
        rec.consumed = true;
        let updated = serde_json::to_string(&rec).map_err(ProviderError::storage)?;
        Self::write_atomic(&path, &updated)?;
        Ok(ConsumeOutcome::Consumed(rec))
    }
}
