//! Durable entities: small named state machines addressed by type and key.
//!
//! Each key gets one worker task with a FIFO inbox, so operations on a key
//! are strictly serialized while distinct keys proceed independently. State
//! is a JSON document in the provider; a handler is a pure transition from
//! (operation, args, state) to new state.
//!
//! Signals are fire-and-forget. Reads return the last committed state, so a
//! read racing a signal may observe the state from before it; callers that
//! need read-your-signal must wait for the signal to commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::codec;
use crate::providers::{HistoryStore, ProviderError};

/// Address of one entity: a handler type plus a caller-chosen key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub entity_type: String,
    pub key: String,
}

impl EntityId {
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self { entity_type: entity_type.into(), key: key.into() }
    }

    /// Provider document key, `{type}/{key}`.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.entity_type, self.key)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.key)
    }
}

/// State transition for one entity type.
///
/// `state` is `None` on the first operation for a key. Returning `Err`
/// leaves the stored state unchanged; the worker logs the failure and keeps
/// draining the queue.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn apply(&self, operation: &str, args: &str, state: Option<String>) -> Result<String, String>;
}

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("no entity handler registered for type '{0}'")]
    UnknownEntityType(String),
    #[error("entity state decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Clone, Default)]
pub struct EntityRegistry {
    handlers: HashMap<String, Arc<dyn EntityHandler>>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder { handlers: HashMap::new() }
    }

    fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityHandler>> {
        self.handlers.get(entity_type).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct EntityRegistryBuilder {
    handlers: HashMap<String, Arc<dyn EntityHandler>>,
}

impl EntityRegistryBuilder {
    pub fn register<H: EntityHandler + 'static>(mut self, entity_type: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(entity_type.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> EntityRegistry {
        EntityRegistry { handlers: self.handlers }
    }
}

struct EntityOp {
    id: EntityId,
    operation: String,
    args: String,
    /// Signalled after the op is applied; used by drain probes.
    done: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Entity runtime: routes signals to per-key workers and reads committed
/// state from the provider.
pub struct EntityStore {
    store: Arc<dyn HistoryStore>,
    registry: EntityRegistry,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<EntityOp>>>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn HistoryStore>, registry: EntityRegistry) -> Arc<Self> {
        Arc::new(Self { store, registry, workers: Mutex::new(HashMap::new()) })
    }

    /// Queue one operation. Returns once the operation is enqueued, not once
    /// it is applied.
    pub async fn signal(
        &self,
        id: &EntityId,
        operation: impl Into<String>,
        args: impl Into<String>,
    ) -> Result<(), EntityError> {
        let handler = self
            .registry
            .get(&id.entity_type)
            .ok_or_else(|| EntityError::UnknownEntityType(id.entity_type.clone()))?;
        let op = EntityOp { id: id.clone(), operation: operation.into(), args: args.into(), done: None };
        let mut workers = self.workers.lock().await;
        let key = id.storage_key();
        let tx = match workers.get(&key) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = spawn_entity_worker(self.store.clone(), handler, key.clone());
                workers.insert(key, tx.clone());
                tx
            }
        };
        tx.send(op).map_err(|_| EntityError::Provider(ProviderError::Storage("entity worker stopped".into())))
    }

    /// Last committed state document, if the entity has ever been written.
    pub async fn read_state(&self, id: &EntityId) -> Option<String> {
        self.store.read_entity(&id.storage_key()).await
    }

    pub async fn read_state_typed<T: DeserializeOwned>(&self, id: &EntityId) -> Result<Option<T>, EntityError> {
        match self.read_state(id).await {
            None => Ok(None),
            Some(raw) => codec::Json::decode(&raw).map(Some).map_err(EntityError::Decode),
        }
    }

    pub async fn list_entities(&self) -> Vec<String> {
        self.store.list_entities().await
    }

    /// Wait until the worker for `id` has applied every signal queued before
    /// this call. The probe rides the same FIFO as real operations, so its
    /// completion proves everything ahead of it committed.
    pub async fn drain(&self, id: &EntityId) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = EntityOp {
            id: id.clone(),
            operation: DRAIN_OPERATION.to_string(),
            args: String::new(),
            done: Some(tx),
        };
        {
            let workers = self.workers.lock().await;
            let Some(worker) = workers.get(&id.storage_key()) else {
                return;
            };
            if worker.send(probe).is_err() {
                return;
            }
        }
        let _ = rx.await;
    }
}

const DRAIN_OPERATION: &str = "__drain";

fn spawn_entity_worker(
    store: Arc<dyn HistoryStore>,
    handler: Arc<dyn EntityHandler>,
    key: String,
) -> mpsc::UnboundedSender<EntityOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EntityOp>();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            if op.operation == DRAIN_OPERATION {
                if let Some(done) = op.done {
                    let _ = done.send(());
                }
                continue;
            }
            let state = store.read_entity(&key).await;
            match handler.apply(&op.operation, &op.args, state).await {
                Ok(new_state) => {
                    if let Err(e) = store.write_entity(&key, &new_state).await {
                        warn!(entity = %op.id, operation = %op.operation, error = %e, "failed to persist entity state");
                    } else {
                        debug!(entity = %op.id, operation = %op.operation, "entity operation applied");
                    }
                }
                Err(e) => {
                    warn!(entity = %op.id, operation = %op.operation, error = %e, "entity operation failed");
                }
            }
        }
    });
    tx
}
