//! Orchestration runtime.
//!
//! Three dispatcher loops poll the provider queues. The orchestrator
//! dispatcher routes completions to per-instance run loops through the
//! router, rehydrating dehydrated instances on delivery. The worker
//! dispatcher executes activities with their retry policy and enqueues
//! results. The timer dispatcher hands scheduled timers to the timer
//! service.
//!
//! A run loop owns one instance: replay a turn, check the nondeterminism
//! detectors, persist the history delta, ack the queue items whose
//! completions are now durable, dispatch new work, then block on the inbox.
//! An instance idle past the dehydration window unwinds; the next delivery
//! rehydrates it from history.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{HistoryStore, InMemoryHistoryStore, ProviderError, QueueKind, WorkItem};
use crate::{codec, is_terminal_history, HistoryEvent};

pub mod completions;
pub mod detect;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;
pub(crate) mod timers;

use completions::{append_completion, has_completion, AppendOutcome};
use registry::{ActivityRegistry, OrchestrationRegistry};
use replay::{DefaultReplayEngine, ReplayEngine};
use router::{InstanceRouter, OrchestratorMsg};
use status::{status_from_history, custom_status_from_history, InstanceStatus};
use timers::PendingTimer;

const COMPLETION_BATCH_LIMIT: usize = 128;
const POLLER_IDLE_SLEEP_MS: u64 = 10;
const ORCH_IDLE_DEHYDRATE_MS: u64 = 1_000;
const WAIT_POLL_INITIAL_MS: u64 = 5;
const WAIT_POLL_MAX_MS: u64 = 100;
const UNMATCHED_EVENT_RETRY_MS: u64 = 25;

pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The instance id is taken by a non-terminal execution.
    #[error("an active instance named '{0}' already exists")]
    DuplicateInstance(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl StartError {
    fn from_provider(e: ProviderError) -> Self {
        match e {
            ProviderError::DuplicateExecution(i) => StartError::DuplicateInstance(i),
            other => StartError::Provider(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for instance '{0}'")]
    Timeout(String),
}

type InstanceResult = (Vec<HistoryEvent>, Result<String, String>);

pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    router: InstanceRouter,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    replay_engine: Arc<dyn ReplayEngine>,
    timer_tx: mpsc::UnboundedSender<PendingTimer>,
    active: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<InstanceResult>>>>,
    shutting_down: AtomicBool,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

// Removes the instance from the active set and the router when its run loop
// unwinds, on any exit path.
struct ActiveGuard {
    rt: Arc<Runtime>,
    instance: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.rt.active.lock().unwrap().remove(&self.instance);
        self.rt.router.unregister(&self.instance);
    }
}

impl Runtime {
    /// Start a runtime over the in-memory store.
    pub async fn start(activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> Arc<Self> {
        Self::start_with_store(Arc::new(InMemoryHistoryStore::new()), activities, orchestrations).await
    }

    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        let (timer_tx, timer_join) = timers::start_timer_service(store.clone());
        let rt = Arc::new(Runtime {
            store,
            router: InstanceRouter::new(),
            orchestrations,
            activities,
            replay_engine: Arc::new(DefaultReplayEngine),
            timer_tx,
            active: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            joins: Mutex::new(Vec::new()),
        });
        let mut joins = vec![timer_join];
        joins.push(rt.clone().start_orchestration_dispatcher());
        joins.push(rt.clone().start_work_dispatcher());
        joins.push(rt.clone().start_timer_dispatcher());
        rt.joins.lock().unwrap().extend(joins);
        rt.reactivate_incomplete_instances().await;
        rt
    }

    /// Boot-time recovery: rehydrate every instance the store left
    /// non-terminal so pending timers and children are re-armed.
    async fn reactivate_incomplete_instances(self: &Arc<Self>) {
        let instances = self.store.list_instances().await;
        let histories = join_all(instances.iter().map(|i| self.store.read(i))).await;
        for (instance, history) in instances.iter().zip(histories) {
            if history.is_empty() || is_terminal_history(&history) {
                continue;
            }
            debug!(instance = %instance, "reactivating incomplete instance");
            self.ensure_instance_active(instance);
        }
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for j in self.joins.lock().unwrap().drain(..) {
            j.abort();
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start a new instance. Fails with [`StartError::DuplicateInstance`]
    /// when the id is held by a non-terminal execution; a terminal id gets a
    /// fresh execution. The returned handle resolves with the final history
    /// and the orchestration result.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<InstanceResult>, StartError> {
        let input = input.into();
        self.store
            .create_execution(instance, orchestration, &input, None, None)
            .await
            .map_err(StartError::from_provider)?;
        let (tx, rx) = oneshot::channel();
        self.result_waiters
            .lock()
            .unwrap()
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        self.ensure_instance_active(instance);
        Ok(tokio::spawn(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => (Vec::new(), Err("runtime shut down".to_string())),
            }
        }))
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<JoinHandle<InstanceResult>, StartError> {
        self.start_orchestration(instance, orchestration, codec::Json::encode(input)).await
    }

    pub(crate) async fn start_orchestration_with_parent(
        self: &Arc<Self>,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: &str,
        parent_id: u64,
    ) -> Result<(), StartError> {
        self.store
            .create_execution(instance, orchestration, input, Some(parent_instance), Some(parent_id))
            .await
            .map_err(StartError::from_provider)?;
        self.ensure_instance_active(instance);
        Ok(())
    }

    /// Raise an external event by instance id.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ProviderError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.into(),
                    data: data.into(),
                },
            )
            .await
    }

    /// Request termination. The instance stops scheduling new work and ends
    /// with `Terminated` status; running sub-orchestrations are terminated
    /// with it.
    pub async fn terminate_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), ProviderError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance { instance: instance.to_string(), reason: reason.into() },
            )
            .await
    }

    pub async fn get_instance_status(&self, instance: &str) -> InstanceStatus {
        status_from_history(&self.store.read(instance).await)
    }

    pub async fn get_custom_status(&self, instance: &str) -> Option<String> {
        custom_status_from_history(&self.store.read(instance).await)
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = WAIT_POLL_INITIAL_MS;
        loop {
            let status = self.get_instance_status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(WAIT_POLL_MAX_MS);
        }
    }

    // ---- dispatcher loops ----

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    break;
                }
                match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    Some((item, token)) => self.handle_orchestrator_item(item, token).await,
                    None => tokio::time::sleep(Duration::from_millis(POLLER_IDLE_SLEEP_MS)).await,
                }
            }
        })
    }

    async fn handle_orchestrator_item(self: &Arc<Self>, item: WorkItem, token: String) {
        match item {
            WorkItem::StartOrchestration { instance, orchestration, input, parent_instance, parent_id } => {
                // Instances started through the client have no execution yet.
                if self.store.latest_execution_id(&instance).await.is_none() {
                    if let Err(e) = self
                        .store
                        .create_execution(&instance, &orchestration, &input, parent_instance.as_deref(), parent_id)
                        .await
                    {
                        warn!(instance = %instance, error = %e, "failed to create execution for start item");
                    }
                }
                self.ensure_instance_active(&instance);
                self.ack_queue(QueueKind::Orchestrator, &token).await;
            }
            WorkItem::ActivityCompleted { instance, execution_id, id, result } => {
                self.deliver_or_rehydrate(OrchestratorMsg::ActivityCompleted {
                    instance,
                    execution_id,
                    id,
                    result,
                    ack_token: Some(token),
                })
                .await;
            }
            WorkItem::ActivityFailed { instance, execution_id, id, error } => {
                self.deliver_or_rehydrate(OrchestratorMsg::ActivityFailed {
                    instance,
                    execution_id,
                    id,
                    error,
                    ack_token: Some(token),
                })
                .await;
            }
            WorkItem::TimerFired { instance, execution_id, id, fire_at_ms } => {
                self.deliver_or_rehydrate(OrchestratorMsg::TimerFired {
                    instance,
                    execution_id,
                    id,
                    fire_at_ms,
                    ack_token: Some(token),
                })
                .await;
            }
            WorkItem::ExternalRaised { instance, name, data } => {
                self.handle_external_item(instance, name, data, token).await;
            }
            WorkItem::SubOrchCompleted { parent_instance, parent_execution_id, parent_id, result } => {
                self.deliver_or_rehydrate(OrchestratorMsg::SubOrchCompleted {
                    instance: parent_instance,
                    execution_id: parent_execution_id,
                    id: parent_id,
                    result,
                    ack_token: Some(token),
                })
                .await;
            }
            WorkItem::SubOrchFailed { parent_instance, parent_execution_id, parent_id, error } => {
                self.deliver_or_rehydrate(OrchestratorMsg::SubOrchFailed {
                    instance: parent_instance,
                    execution_id: parent_execution_id,
                    id: parent_id,
                    error,
                    ack_token: Some(token),
                })
                .await;
            }
            WorkItem::TerminateInstance { instance, reason } => {
                self.handle_terminate_item(instance, reason, token).await;
            }
            other @ (WorkItem::ActivityExecute { .. } | WorkItem::TimerSchedule { .. }) => {
                warn!(item = ?other, "non-orchestrator item on the orchestrator queue");
                self.ack_queue(QueueKind::Orchestrator, &token).await;
            }
        }
    }

    /// Forward a completion into the instance's inbox, activating the
    /// instance first when it is dehydrated. Stale and post-terminal
    /// deliveries are acked and dropped.
    async fn deliver_or_rehydrate(self: &Arc<Self>, msg: OrchestratorMsg) {
        let instance = msg.instance().to_string();
        let history = self.store.read(&instance).await;
        if history.is_empty() {
            warn!(instance = %instance, "completion for unknown instance dropped");
            if let Some(t) = msg.ack_token() {
                self.ack_queue(QueueKind::Orchestrator, t).await;
            }
            return;
        }
        if is_terminal_history(&history) {
            if let Some(t) = msg.ack_token() {
                self.ack_queue(QueueKind::Orchestrator, t).await;
            }
            return;
        }
        if let Some(exec) = msg.execution_id() {
            if self.store.latest_execution_id(&instance).await != Some(exec) {
                warn!(instance = %instance, execution_id = exec, "stale completion dropped");
                if let Some(t) = msg.ack_token() {
                    self.ack_queue(QueueKind::Orchestrator, t).await;
                }
                return;
            }
        }
        match self.router.try_send(msg) {
            Ok(()) => {}
            Err(msg) => {
                self.ensure_instance_active(&instance);
                if let Err(msg) = self.router.try_send(msg) {
                    // Deliver again on the next dispatcher pass.
                    if let Some(t) = msg.ack_token() {
                        if let Err(e) = self.store.abandon(QueueKind::Orchestrator, t).await {
                            warn!(instance = %instance, error = %e, "failed to abandon undeliverable completion");
                        }
                    }
                }
            }
        }
    }

    async fn handle_external_item(self: &Arc<Self>, instance: String, name: String, data: String, token: String) {
        let history = self.store.read(&instance).await;
        if history.is_empty() {
            warn!(instance = %instance, event = %name, "external event for unknown instance dropped");
            self.ack_queue(QueueKind::Orchestrator, &token).await;
            return;
        }
        if is_terminal_history(&history) {
            warn!(instance = %instance, event = %name, "external event for terminal instance dropped");
            self.ack_queue(QueueKind::Orchestrator, &token).await;
            return;
        }
        if completions::open_subscription(&history, &name).is_some() {
            self.deliver_or_rehydrate(OrchestratorMsg::ExternalRaised {
                instance,
                name,
                data,
                ack_token: Some(token),
            })
            .await;
        } else {
            // Raised before the subscription: the queue item is the durable
            // buffer. Hold the lock briefly, then release it so redelivery
            // finds the subscription once the instance records one.
            debug!(instance = %instance, event = %name, "holding external event without a subscription");
            let store = self.store.clone();
            self.track(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(UNMATCHED_EVENT_RETRY_MS)).await;
                if let Err(e) = store.abandon(QueueKind::Orchestrator, &token).await {
                    warn!(instance = %instance, event = %name, error = %e, "failed to release held external event");
                }
            }));
        }
    }

    async fn handle_terminate_item(self: &Arc<Self>, instance: String, reason: String, token: String) {
        let history = self.store.read(&instance).await;
        if history.is_empty() || is_terminal_history(&history) {
            self.ack_queue(QueueKind::Orchestrator, &token).await;
            return;
        }
        let msg = OrchestratorMsg::TerminateRequested {
            instance: instance.clone(),
            reason: reason.clone(),
            ack_token: Some(token),
        };
        match self.router.try_send(msg) {
            Ok(()) => {}
            Err(msg) => {
                // Dehydrated: terminate directly against the store.
                self.apply_termination(&instance, &reason).await;
                if let Some(t) = msg.ack_token() {
                    self.ack_queue(QueueKind::Orchestrator, t).await;
                }
            }
        }
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    break;
                }
                match self.store.dequeue_peek_lock(QueueKind::Timer).await {
                    Some((WorkItem::TimerSchedule { instance, execution_id, id, fire_at_ms }, token)) => {
                        let _ = self.timer_tx.send(PendingTimer { instance, execution_id, id, fire_at_ms });
                        self.ack_queue(QueueKind::Timer, &token).await;
                    }
                    Some((other, token)) => {
                        warn!(item = ?other, "non-timer item on the timer queue");
                        self.ack_queue(QueueKind::Timer, &token).await;
                    }
                    None => tokio::time::sleep(Duration::from_millis(POLLER_IDLE_SLEEP_MS)).await,
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    break;
                }
                match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                    Some((WorkItem::ActivityExecute { instance, execution_id, id, name, input, attempt }, token)) => {
                        self.execute_activity(instance, execution_id, id, name, input, attempt, token).await;
                    }
                    Some((other, token)) => {
                        warn!(item = ?other, "non-worker item on the worker queue");
                        self.ack_queue(QueueKind::Worker, &token).await;
                    }
                    None => tokio::time::sleep(Duration::from_millis(POLLER_IDLE_SLEEP_MS)).await,
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_activity(
        self: &Arc<Self>,
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
        token: String,
    ) {
        let history = self.store.read_with_execution(&instance, execution_id).await;
        if is_terminal_history(&history) || has_completion(&history, id) {
            self.ack_queue(QueueKind::Worker, &token).await;
            return;
        }
        let Some(entry) = self.activities.get(&name) else {
            let item = WorkItem::ActivityFailed {
                instance,
                execution_id,
                id,
                error: format!("unregistered activity: {name}"),
            };
            self.enqueue_orchestrator(item).await;
            self.ack_queue(QueueKind::Worker, &token).await;
            return;
        };
        match entry.handler.invoke(input.clone()).await {
            Ok(result) => {
                self.enqueue_orchestrator(WorkItem::ActivityCompleted { instance, execution_id, id, result })
                    .await;
                self.ack_queue(QueueKind::Worker, &token).await;
            }
            Err(err) if attempt < entry.retry.max_attempts => {
                let delay_ms = entry.retry.delay_before_retry_ms(attempt);
                warn!(
                    instance = %instance,
                    activity = %name,
                    attempt,
                    delay_ms,
                    error = %err,
                    "activity failed, retrying"
                );
                let store = self.store.clone();
                let retry_item = WorkItem::ActivityExecute {
                    instance,
                    execution_id,
                    id,
                    name,
                    input,
                    attempt: attempt + 1,
                };
                // The failed attempt stays locked until the retry is durably
                // enqueued; a crash in between redelivers the original item.
                self.track(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if let Err(e) = store.enqueue_work(QueueKind::Worker, retry_item).await {
                        warn!(error = %e, "failed to enqueue activity retry");
                        return;
                    }
                    if let Err(e) = store.ack(QueueKind::Worker, &token).await {
                        warn!(error = %e, "failed to ack retried activity attempt");
                    }
                }));
            }
            Err(err) => {
                warn!(instance = %instance, activity = %name, attempt, error = %err, "activity retries exhausted");
                self.enqueue_orchestrator(WorkItem::ActivityFailed { instance, execution_id, id, error: err })
                    .await;
                self.ack_queue(QueueKind::Worker, &token).await;
            }
        }
    }

    // ---- per-instance run loop ----

    // Not async: a suspension point here would make the run-loop future
    // recursive, and nothing in the body needs one.
    pub(crate) fn ensure_instance_active(self: &Arc<Self>, instance: &str) {
        {
            let mut active = self.active.lock().unwrap();
            if active.contains(instance) {
                return;
            }
            active.insert(instance.to_string());
        }
        let rx = self.router.register(instance);
        let rt = self.clone();
        let inst = instance.to_string();
        let join = tokio::spawn(async move {
            rt.run_instance_to_completion(&inst, rx).await;
        });
        self.track(join);
    }

    // Retain the handle so shutdown aborts the task; prune finished handles
    // so the vector does not grow with every activation.
    fn track(&self, join: JoinHandle<()>) {
        let mut joins = self.joins.lock().unwrap();
        joins.retain(|j| !j.is_finished());
        joins.push(join);
    }

    async fn run_instance_to_completion(
        self: Arc<Self>,
        instance: &str,
        mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) {
        let _guard = ActiveGuard { rt: self.clone(), instance: instance.to_string() };
        let Some(execution_id) = self.store.latest_execution_id(instance).await else {
            warn!(instance = %instance, "activated an instance with no execution");
            return;
        };
        let mut history = self.store.read_with_execution(instance, execution_id).await;
        let Some(HistoryEvent::OrchestrationStarted { name, input, parent_instance, parent_id }) =
            history.first().cloned()
        else {
            warn!(instance = %instance, "history does not begin with a start event");
            return;
        };
        if is_terminal_history(&history) {
            return;
        }
        let parent_link = parent_instance.zip(parent_id);
        let Some(handler) = self.orchestrations.get(&name) else {
            let error = format!("unregistered orchestration: {name}");
            let persisted_len = history.len();
            self.finish_instance(instance, execution_id, &mut history, persisted_len, Err(error), &parent_link, Vec::new())
                .await;
            return;
        };

        self.rehydrate_pending(instance, execution_id, &history).await;

        let mut persisted_len = history.len();
        let mut pending_acks: Vec<String> = Vec::new();
        let mut turn_index: u64 = 0;

        loop {
            let outcome =
                self.replay_engine
                    .replay(instance, turn_index, std::mem::take(&mut history), handler.clone(), input.clone());
            history = outcome.history;
            turn_index += 1;

            let violation = detect::detect_await_mismatch(&history, &outcome.claims)
                .or_else(|| detect::detect_completion_kind_mismatch(&history));
            if let Some(error) = violation {
                error!(instance = %instance, error = %error, "halting nondeterministic instance");
                self.finish_instance(
                    instance,
                    execution_id,
                    &mut history,
                    persisted_len,
                    Err(error),
                    &parent_link,
                    std::mem::take(&mut pending_acks),
                )
                .await;
                return;
            }

            if let Some(output) = outcome.output {
                self.finish_instance(
                    instance,
                    execution_id,
                    &mut history,
                    persisted_len,
                    output,
                    &parent_link,
                    std::mem::take(&mut pending_acks),
                )
                .await;
                return;
            }

            // Persist the turn's delta before acking the completions that
            // produced it; at-least-once queues make the ack safe to lose.
            if history.len() > persisted_len {
                let delta = history[persisted_len..].to_vec();
                if let Err(e) = self.store.append_with_execution(instance, execution_id, delta).await {
                    error!(instance = %instance, error = %e, "failed to persist history, unwinding");
                    return;
                }
                persisted_len = history.len();
            }
            for t in pending_acks.drain(..) {
                self.ack_queue(QueueKind::Orchestrator, &t).await;
            }

            self.apply_actions(instance, execution_id, &history, outcome.actions).await;

            // Block for the next completion; unwind when idle long enough.
            let first = match tokio::time::timeout(
                Duration::from_millis(ORCH_IDLE_DEHYDRATE_MS),
                rx.recv(),
            )
            .await
            {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(_) => {
                    debug!(instance = %instance, "dehydrating idle instance");
                    return;
                }
            };
            let mut batch = vec![first];
            while batch.len() < COMPLETION_BATCH_LIMIT {
                match rx.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            let mut iter = batch.into_iter();
            while let Some(msg) = iter.next() {
                if let OrchestratorMsg::TerminateRequested { reason, ack_token, .. } = msg {
                    history.push(HistoryEvent::OrchestrationTerminated { reason: reason.clone() });
                    if history.len() > persisted_len {
                        let delta = history[persisted_len..].to_vec();
                        if let Err(e) = self.store.append_with_execution(instance, execution_id, delta).await {
                            error!(instance = %instance, error = %e, "failed to persist termination");
                        }
                    }
                    if let Some(t) = ack_token {
                        pending_acks.push(t);
                    }
                    for t in pending_acks.drain(..) {
                        self.ack_queue(QueueKind::Orchestrator, &t).await;
                    }
                    // Completions left in the batch are moot now.
                    for rest in iter.by_ref() {
                        if let Some(t) = rest.ack_token() {
                            self.ack_queue(QueueKind::Orchestrator, t).await;
                        }
                    }
                    self.terminate_children(&history, &reason).await;
                    let err = format!("terminated: {reason}");
                    if let Some((pinst, pid)) = &parent_link {
                        self.notify_parent(pinst, *pid, Err(err.clone())).await;
                    }
                    self.notify_waiters(instance, history, Err(err));
                    return;
                }
                let token = msg.ack_token().map(|t| t.to_string());
                match append_completion(&mut history, &msg) {
                    AppendOutcome::Appended => {
                        if let Some(t) = token {
                            pending_acks.push(t);
                        }
                    }
                    AppendOutcome::Unmatched => {
                        // An external event can outrun its subscription; put
                        // it back on the queue instead of losing it.
                        if let Some(t) = token {
                            if let Err(e) = self.store.abandon(QueueKind::Orchestrator, &t).await {
                                warn!(instance = %instance, error = %e, "failed to release unmatched completion");
                            }
                        }
                    }
                    AppendOutcome::Duplicate => {
                        if let Some(t) = token {
                            self.ack_queue(QueueKind::Orchestrator, &t).await;
                        }
                    }
                }
            }
        }
    }

    /// Write the terminal event, flush anything unpersisted, release queue
    /// locks, and fan the result out to waiters and the parent.
    #[allow(clippy::too_many_arguments)]
    async fn finish_instance(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &mut Vec<HistoryEvent>,
        persisted_len: usize,
        output: Result<String, String>,
        parent_link: &Option<(String, u64)>,
        pending_acks: Vec<String>,
    ) {
        match &output {
            Ok(out) => history.push(HistoryEvent::OrchestrationCompleted { output: out.clone() }),
            Err(err) => history.push(HistoryEvent::OrchestrationFailed { error: err.clone() }),
        }
        if history.len() > persisted_len {
            let delta = history[persisted_len..].to_vec();
            if let Err(e) = self.store.append_with_execution(instance, execution_id, delta).await {
                error!(instance = %instance, error = %e, "failed to persist terminal event");
            }
        }
        for t in pending_acks {
            self.ack_queue(QueueKind::Orchestrator, &t).await;
        }
        if let Some((pinst, pid)) = parent_link {
            self.notify_parent(pinst, *pid, output.clone()).await;
        }
        self.notify_waiters(instance, std::mem::take(history), output);
    }

    async fn notify_parent(self: &Arc<Self>, parent_instance: &str, parent_id: u64, result: Result<String, String>) {
        let parent_execution_id = self.store.latest_execution_id(parent_instance).await.unwrap_or(1);
        let item = match result {
            Ok(result) => WorkItem::SubOrchCompleted {
                parent_instance: parent_instance.to_string(),
                parent_execution_id,
                parent_id,
                result,
            },
            Err(error) => WorkItem::SubOrchFailed {
                parent_instance: parent_instance.to_string(),
                parent_execution_id,
                parent_id,
                error,
            },
        };
        self.enqueue_orchestrator(item).await;
    }

    fn notify_waiters(&self, instance: &str, history: Vec<HistoryEvent>, result: Result<String, String>) {
        let waiters = self.result_waiters.lock().unwrap().remove(instance);
        if let Some(waiters) = waiters {
            for w in waiters {
                let _ = w.send((history.clone(), result.clone()));
            }
        }
    }

    /// Terminate an instance that has no live run loop: append the terminal
    /// event and fan out, directly against the store.
    async fn apply_termination(self: &Arc<Self>, instance: &str, reason: &str) {
        let mut history = self.store.read(instance).await;
        if history.is_empty() || is_terminal_history(&history) {
            return;
        }
        let event = HistoryEvent::OrchestrationTerminated { reason: reason.to_string() };
        if let Err(e) = self.store.append(instance, vec![event.clone()]).await {
            warn!(instance = %instance, error = %e, "failed to persist termination");
            return;
        }
        history.push(event);
        self.terminate_children(&history, reason).await;
        let err = format!("terminated: {reason}");
        if let Some((pinst, pid)) = parent_link_of(&history) {
            self.notify_parent(&pinst, pid, Err(err.clone())).await;
        }
        self.notify_waiters(instance, history, Err(err));
    }

    async fn terminate_children(self: &Arc<Self>, history: &[HistoryEvent], reason: &str) {
        for e in history {
            if let HistoryEvent::SubOrchestrationScheduled { id, instance: child, .. } = e {
                if !has_completion(history, *id) {
                    self.enqueue_orchestrator(WorkItem::TerminateInstance {
                        instance: child.clone(),
                        reason: reason.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    /// Re-dispatch in-flight work after rehydration: timers are re-armed
    /// (fires are deduped on append) and incomplete children re-activated.
    /// Activity executions are not re-enqueued; their queue items survive in
    /// the provider.
    async fn rehydrate_pending(self: &Arc<Self>, instance: &str, execution_id: u64, history: &[HistoryEvent]) {
        for e in history {
            match e {
                HistoryEvent::TimerCreated { id, fire_at_ms } if !has_completion(history, *id) => {
                    let _ = self.timer_tx.send(PendingTimer {
                        instance: instance.to_string(),
                        execution_id,
                        id: *id,
                        fire_at_ms: *fire_at_ms,
                    });
                }
                HistoryEvent::SubOrchestrationScheduled { id, instance: child, .. }
                    if !has_completion(history, *id) =>
                {
                    if self.store.latest_execution_id(child).await.is_some() {
                        self.ensure_instance_active(child);
                    }
                }
                _ => {}
            }
        }
    }

    pub(crate) async fn enqueue_orchestrator(&self, item: WorkItem) {
        if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, item).await {
            warn!(error = %e, "failed to enqueue orchestrator item");
        }
    }

    pub(crate) async fn ack_queue(&self, kind: QueueKind, token: &str) {
        if let Err(e) = self.store.ack(kind, token).await {
            warn!(queue = kind.as_str(), error = %e, "failed to ack queue item");
        }
    }
}

fn parent_link_of(history: &[HistoryEvent]) -> Option<(String, u64)> {
    match history.first() {
        Some(HistoryEvent::OrchestrationStarted { parent_instance, parent_id, .. }) => {
            parent_instance.clone().zip(*parent_id)
        }
        _ => None,
    }
}
