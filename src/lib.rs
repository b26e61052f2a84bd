//! Durable, replay-driven workflow orchestration.
//!
//! Orchestrations are deterministic async functions executed against an
//! append-only history. Each turn the function is polled once from the top:
//! awaits whose completions are already recorded resolve immediately from
//! history, the first await without a completion suspends the turn, and any
//! newly scheduled work is surfaced as [`Action`]s for the runtime to
//! dispatch. Because the function only ever observes recorded history, a
//! crashed instance is recovered by replaying the same history.
//!
//! Correlation ids tie a scheduling event to its completion. On replay a
//! schedule call first adopts the id of an unclaimed matching scheduling
//! event from history; only when none exists does it allocate a fresh id and
//! emit the scheduling event. This keeps ids stable as long as the
//! orchestration code is deterministic.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

pub mod api;
pub mod client;
pub mod entity;
pub mod futures;
pub mod gateway;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod samples;

pub use client::Client;
pub use entity::{EntityHandler, EntityId, EntityRegistry, EntityStore};
pub use crate::futures::DurableFuture;
pub use gateway::{CallbackGateway, GatewayError};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry, RetryPolicy};
pub use runtime::status::InstanceStatus;
pub use runtime::{Runtime, StartError, WaitError};

/// One record in an instance's append-only history.
///
/// Scheduling events (`ActivityScheduled`, `TimerCreated`,
/// `ExternalSubscribed`, `SubOrchestrationScheduled`) are written by the
/// replay turn itself; completion events are appended by the runtime when
/// work finishes. The `id` fields correlate the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryEvent {
    OrchestrationStarted {
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        id: u64,
        result: String,
    },
    ActivityFailed {
        id: u64,
        error: String,
    },
    TimerCreated {
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        id: u64,
        name: String,
    },
    ExternalRaised {
        id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        id: u64,
        error: String,
    },
    CustomStatusSet {
        id: u64,
        status: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        error: String,
    },
    OrchestrationTerminated {
        reason: String,
    },
}

impl HistoryEvent {
    /// True for events that end the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEvent::OrchestrationCompleted { .. }
                | HistoryEvent::OrchestrationFailed { .. }
                | HistoryEvent::OrchestrationTerminated { .. }
        )
    }
}

/// True when the history ends in a terminal event.
pub fn is_terminal_history(history: &[HistoryEvent]) -> bool {
    history.last().map(HistoryEvent::is_terminal).unwrap_or(false)
}

/// Work the runtime must dispatch as a result of a replay turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    CallActivity { id: u64, name: String, input: String },
    CreateTimer { id: u64, fire_at_ms: u64 },
    WaitExternal { id: u64, name: String },
    StartSubOrchestration { id: u64, name: String, instance: String, input: String },
}

pub(crate) struct CtxInner {
    pub instance: String,
    pub history: Vec<HistoryEvent>,
    pub actions: Vec<Action>,
    pub next_correlation_id: u64,
    pub turn_index: u64,
    // Logging is enabled only on polls that append new history, so replayed
    // turns stay silent.
    pub logging_enabled_this_poll: bool,
    pub claimed_activity_ids: HashSet<u64>,
    pub claimed_timer_ids: HashSet<u64>,
    pub claimed_external_ids: HashSet<u64>,
    pub claimed_sub_ids: HashSet<u64>,
    pub claimed_status_ids: HashSet<u64>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<HistoryEvent>, turn_index: u64) -> Self {
        // Fresh ids continue after the highest correlated id in history.
        let max_seen = history
            .iter()
            .filter_map(|e| match e {
                HistoryEvent::ActivityScheduled { id, .. }
                | HistoryEvent::TimerCreated { id, .. }
                | HistoryEvent::ExternalSubscribed { id, .. }
                | HistoryEvent::SubOrchestrationScheduled { id, .. }
                | HistoryEvent::CustomStatusSet { id, .. } => Some(*id),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Self {
            instance,
            history,
            actions: Vec::new(),
            next_correlation_id: max_seen + 1,
            turn_index,
            logging_enabled_this_poll: false,
            claimed_activity_ids: HashSet::new(),
            claimed_timer_ids: HashSet::new(),
            claimed_external_ids: HashSet::new(),
            claimed_sub_ids: HashSet::new(),
            claimed_status_ids: HashSet::new(),
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.logging_enabled_this_poll = true;
        self.actions.push(action);
    }
}

/// Snapshot of the correlation ids claimed by the user function during one
/// turn, used by the nondeterminism detectors.
#[derive(Debug, Default, Clone)]
pub struct ClaimedIds {
    pub activities: HashSet<u64>,
    pub timers: HashSet<u64>,
    pub externals: HashSet<u64>,
    pub sub_orchestrations: HashSet<u64>,
}

/// Handle the orchestration function uses to schedule durable work.
///
/// Cloning is cheap; all clones share the turn's state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(instance: impl Into<String>, history: Vec<HistoryEvent>, turn_index: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, turn_index))),
        }
    }

    /// Instance id of the running orchestration.
    pub fn instance_id(&self) -> String {
        self.inner.lock().unwrap().instance.clone()
    }

    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }

    /// True only on polls that made progress; replayed turns return false.
    pub fn is_logging_enabled(&self) -> bool {
        self.inner.lock().unwrap().logging_enabled_this_poll
    }

    /// Orchestration input as recorded at start.
    pub fn input(&self) -> String {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .find_map(|e| match e {
                HistoryEvent::OrchestrationStarted { input, .. } => Some(input.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Schedule an activity invocation. The returned future resolves with the
    /// activity's result once the runtime records it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name = name.into();
        let input = input.into();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let adopted = inner.history.iter().find_map(|e| match e {
                HistoryEvent::ActivityScheduled { id, name: n, input: inp }
                    if n == &name && inp == &input && !inner.claimed_activity_ids.contains(id) =>
                {
                    Some(*id)
                }
                _ => None,
            });
            let id = match adopted {
                Some(id) => id,
                None => inner.next_id(),
            };
            inner.claimed_activity_ids.insert(id);
            id
        };
        DurableFuture::activity(self.clone(), id, name, input)
    }

    /// Typed wrapper over [`schedule_activity`](Self::schedule_activity).
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> DurableFuture {
        self.schedule_activity(name, codec::Json::encode(input))
    }

    /// Schedule a durable timer that fires after `delay_ms`.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let adopted = inner.history.iter().find_map(|e| match e {
                HistoryEvent::TimerCreated { id, .. } if !inner.claimed_timer_ids.contains(id) => Some(*id),
                _ => None,
            });
            let id = match adopted {
                Some(id) => id,
                None => inner.next_id(),
            };
            inner.claimed_timer_ids.insert(id);
            id
        };
        DurableFuture::timer(self.clone(), id, delay_ms)
    }

    /// Subscribe to a named external event. The future resolves with the
    /// event payload when one is raised for this subscription.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name = name.into();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let adopted = inner.history.iter().find_map(|e| match e {
                HistoryEvent::ExternalSubscribed { id, name: n }
                    if n == &name && !inner.claimed_external_ids.contains(id) =>
                {
                    Some(*id)
                }
                _ => None,
            });
            let id = match adopted {
                Some(id) => id,
                None => inner.next_id(),
            };
            inner.claimed_external_ids.insert(id);
            id
        };
        DurableFuture::external(self.clone(), id, name)
    }

    /// Schedule a sub-orchestration. The child runs as its own instance whose
    /// id is derived from the parent's; its terminal result resolves the
    /// returned future.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        let name = name.into();
        let input = input.into();
        let (id, instance) = {
            let mut inner = self.inner.lock().unwrap();
            let adopted = inner.history.iter().find_map(|e| match e {
                HistoryEvent::SubOrchestrationScheduled { id, name: n, instance, input: inp }
                    if n == &name && inp == &input && !inner.claimed_sub_ids.contains(id) =>
                {
                    Some((*id, instance.clone()))
                }
                _ => None,
            });
            match adopted {
                Some((id, instance)) => {
                    inner.claimed_sub_ids.insert(id);
                    (id, instance)
                }
                None => {
                    let id = inner.next_id();
                    inner.claimed_sub_ids.insert(id);
                    let instance = format!("{}::sub::{id}", inner.instance);
                    (id, instance)
                }
            }
        };
        DurableFuture::sub_orchestration(self.clone(), id, name, instance, input)
    }

    /// Typed wrapper over [`schedule_sub_orchestration`](Self::schedule_sub_orchestration).
    pub fn schedule_sub_orchestration_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> DurableFuture {
        self.schedule_sub_orchestration(name, codec::Json::encode(input))
    }

    /// Record a custom status string, surfaced by status queries. Replay-safe:
    /// a recorded status event is adopted instead of re-appended.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let status = status.into();
        let mut inner = self.inner.lock().unwrap();
        let adopted = inner.history.iter().find_map(|e| match e {
            HistoryEvent::CustomStatusSet { id, .. } if !inner.claimed_status_ids.contains(id) => Some(*id),
            _ => None,
        });
        match adopted {
            Some(id) => {
                inner.claimed_status_ids.insert(id);
            }
            None => {
                let id = inner.next_id();
                inner.claimed_status_ids.insert(id);
                inner.logging_enabled_this_poll = true;
                inner.history.push(HistoryEvent::CustomStatusSet { id, status });
            }
        }
    }

    /// Race two durable futures; resolves with the one whose completion is
    /// recorded first in history.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> futures::SelectFuture {
        futures::SelectFuture::new(self.clone(), vec![a, b])
    }

    /// Wait for all durable futures; outputs are ordered by completion
    /// position in history, which is stable across replays.
    pub fn join(&self, futs: Vec<DurableFuture>) -> futures::JoinFuture {
        futures::JoinFuture::new(self.clone(), futs)
    }

    pub(crate) fn claimed_ids(&self) -> ClaimedIds {
        let inner = self.inner.lock().unwrap();
        ClaimedIds {
            activities: inner.claimed_activity_ids.clone(),
            timers: inner.claimed_timer_ids.clone(),
            externals: inner.claimed_external_ids.clone(),
            sub_orchestrations: inner.claimed_sub_ids.clone(),
        }
    }
}

/// Typed payload helpers. Histories carry `String` payloads; typed APIs go
/// through JSON with a raw-string fallback so plain-string activities keep
/// working with typed callers.
pub mod codec {
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    pub struct Json;

    impl Json {
        pub fn encode<T: Serialize>(value: &T) -> String {
            serde_json::to_string(value).unwrap_or_default()
        }

        pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(payload) {
                Ok(v) => Ok(v),
                Err(first) => {
                    // A bare string payload is accepted where T is String.
                    let as_string = serde_json::to_string(payload)
                        .map_err(|e| e.to_string())
                        .and_then(|quoted| serde_json::from_str::<T>(&quoted).map_err(|e| e.to_string()));
                    as_string.map_err(|_| first.to_string())
                }
            }
        }
    }
}

fn noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: std::future::Future>(fut: &mut std::pin::Pin<Box<F>>) -> std::task::Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    fut.as_mut().poll(&mut cx)
}

/// Execute one replay turn: poll the orchestrator exactly once against
/// `history` and return the (possibly extended) history, the actions to
/// dispatch, and the output if the function ran to completion.
pub fn run_turn<O, F, Fut>(
    history: Vec<HistoryEvent>,
    orchestrator: F,
) -> (Vec<HistoryEvent>, Vec<Action>, Option<O>)
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: std::future::Future<Output = O>,
{
    let (history, actions, _claims, out) = run_turn_with_claims("", history, 0, orchestrator);
    (history, actions, out)
}

/// [`run_turn`] variant that also returns the claimed-id snapshot the
/// runtime's nondeterminism detectors consume.
pub fn run_turn_with_claims<O, F, Fut>(
    instance: &str,
    history: Vec<HistoryEvent>,
    turn_index: u64,
    orchestrator: F,
) -> (Vec<HistoryEvent>, Vec<Action>, ClaimedIds, Option<O>)
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: std::future::Future<Output = O>,
{
    let ctx = OrchestrationContext::new(instance, history, turn_index);
    let mut fut = Box::pin(orchestrator(ctx.clone()));
    let polled = poll_once(&mut fut);
    let claims = ctx.claimed_ids();
    let mut inner = ctx.inner.lock().unwrap();
    let history = std::mem::take(&mut inner.history);
    let actions = std::mem::take(&mut inner.actions);
    match polled {
        std::task::Poll::Ready(out) => (history, actions, claims, Some(out)),
        std::task::Poll::Pending => (history, actions, claims, None),
    }
}
