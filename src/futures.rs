//! Durable futures returned by the scheduling APIs on
//! [`OrchestrationContext`].
//!
//! A durable future never blocks a thread: polling resolves it from recorded
//! history, or appends the scheduling event (and records the matching
//! [`Action`]) on first poll and stays pending until the runtime records a
//! completion. Aggregates decide winners and ordering by completion position
//! in history, so replay always agrees with the first execution.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::{codec, Action, HistoryEvent, OrchestrationContext};

/// Kind-erased output of a [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

#[derive(Debug)]
enum Kind {
    Activity { id: u64, name: String, input: String },
    Timer { id: u64, delay_ms: u64 },
    External { id: u64, name: String },
    SubOrchestration { id: u64, name: String, instance: String, input: String },
}

/// A single pending durable operation, correlated to history by id.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    scheduled: bool,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, id: u64, name: String, input: String) -> Self {
        Self { ctx, kind: Kind::Activity { id, name, input }, scheduled: false }
    }

    pub(crate) fn timer(ctx: OrchestrationContext, id: u64, delay_ms: u64) -> Self {
        Self { ctx, kind: Kind::Timer { id, delay_ms }, scheduled: false }
    }

    pub(crate) fn external(ctx: OrchestrationContext, id: u64, name: String) -> Self {
        Self { ctx, kind: Kind::External { id, name }, scheduled: false }
    }

    pub(crate) fn sub_orchestration(
        ctx: OrchestrationContext,
        id: u64,
        name: String,
        instance: String,
        input: String,
    ) -> Self {
        Self { ctx, kind: Kind::SubOrchestration { id, name, instance, input }, scheduled: false }
    }

    fn correlation_id(&self) -> u64 {
        match &self.kind {
            Kind::Activity { id, .. }
            | Kind::Timer { id, .. }
            | Kind::External { id, .. }
            | Kind::SubOrchestration { id, .. } => *id,
        }
    }

    /// Position of this future's completion event in `history`, if recorded.
    fn completion_position(&self, history: &[HistoryEvent]) -> Option<usize> {
        let id = self.correlation_id();
        history.iter().position(|e| match (&self.kind, e) {
            (Kind::Activity { .. }, HistoryEvent::ActivityCompleted { id: cid, .. })
            | (Kind::Activity { .. }, HistoryEvent::ActivityFailed { id: cid, .. })
            | (Kind::Timer { .. }, HistoryEvent::TimerFired { id: cid, .. })
            | (Kind::External { .. }, HistoryEvent::ExternalRaised { id: cid, .. })
            | (Kind::SubOrchestration { .. }, HistoryEvent::SubOrchestrationCompleted { id: cid, .. })
            | (Kind::SubOrchestration { .. }, HistoryEvent::SubOrchestrationFailed { id: cid, .. }) => *cid == id,
            _ => false,
        })
    }

    /// Await an activity result, erasing the [`DurableOutput`] wrapper.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => Err(format!("expected an activity completion, got {other:?}")),
        }
    }

    /// Await an activity result decoded from JSON.
    pub async fn into_activity_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_activity().await?;
        codec::Json::decode(&raw)
    }

    pub async fn into_timer(self) {
        // Timers carry no payload; a mismatched kind is unreachable when the
        // future came from schedule_timer.
        let _ = self.await;
    }

    /// Await an external event payload.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(data) => data,
            other => format!("expected an external event, got {other:?}"),
        }
    }

    /// Await an external event payload decoded from JSON.
    pub async fn into_event_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_event().await;
        codec::Json::decode(&raw)
    }

    /// Await a sub-orchestration result.
    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => Err(format!("expected a sub-orchestration completion, got {other:?}")),
        }
    }

    /// Await a sub-orchestration result decoded from JSON.
    pub async fn into_sub_orchestration_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_sub_orchestration().await?;
        codec::Json::decode(&raw)
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.inner.lock().unwrap();

        // First poll appends the scheduling event unless replay already
        // recorded it (the id was adopted from history in that case).
        if !this.scheduled {
            this.scheduled = true;
            match &this.kind {
                Kind::Activity { id, name, input } => {
                    let present = inner.history.iter().any(
                        |e| matches!(e, HistoryEvent::ActivityScheduled { id: eid, .. } if eid == id),
                    );
                    if !present {
                        inner.history.push(HistoryEvent::ActivityScheduled {
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::CallActivity {
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                }
                Kind::Timer { id, delay_ms } => {
                    let present = inner.history.iter().any(
                        |e| matches!(e, HistoryEvent::TimerCreated { id: eid, .. } if eid == id),
                    );
                    if !present {
                        let fire_at_ms = now_ms() + delay_ms;
                        inner.history.push(HistoryEvent::TimerCreated { id: *id, fire_at_ms });
                        inner.record_action(Action::CreateTimer { id: *id, fire_at_ms });
                    }
                }
                Kind::External { id, name } => {
                    let present = inner.history.iter().any(
                        |e| matches!(e, HistoryEvent::ExternalSubscribed { id: eid, .. } if eid == id),
                    );
                    if !present {
                        inner
                            .history
                            .push(HistoryEvent::ExternalSubscribed { id: *id, name: name.clone() });
                        inner.record_action(Action::WaitExternal { id: *id, name: name.clone() });
                    }
                }
                Kind::SubOrchestration { id, name, instance, input } => {
                    let present = inner.history.iter().any(
                        |e| matches!(e, HistoryEvent::SubOrchestrationScheduled { id: eid, .. } if eid == id),
                    );
                    if !present {
                        inner.history.push(HistoryEvent::SubOrchestrationScheduled {
                            id: *id,
                            name: name.clone(),
                            instance: instance.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::StartSubOrchestration {
                            id: *id,
                            name: name.clone(),
                            instance: instance.clone(),
                            input: input.clone(),
                        });
                    }
                }
            }
        }

        let id = this.correlation_id();
        for e in inner.history.iter() {
            match (&this.kind, e) {
                (Kind::Activity { .. }, HistoryEvent::ActivityCompleted { id: cid, result }) if *cid == id => {
                    return Poll::Ready(DurableOutput::Activity(Ok(result.clone())));
                }
                (Kind::Activity { .. }, HistoryEvent::ActivityFailed { id: cid, error }) if *cid == id => {
                    return Poll::Ready(DurableOutput::Activity(Err(error.clone())));
                }
                (Kind::Timer { .. }, HistoryEvent::TimerFired { id: cid, .. }) if *cid == id => {
                    return Poll::Ready(DurableOutput::Timer);
                }
                (Kind::External { .. }, HistoryEvent::ExternalRaised { id: cid, data, .. }) if *cid == id => {
                    return Poll::Ready(DurableOutput::External(data.clone()));
                }
                (Kind::SubOrchestration { .. }, HistoryEvent::SubOrchestrationCompleted { id: cid, result })
                    if *cid == id =>
                {
                    return Poll::Ready(DurableOutput::SubOrchestration(Ok(result.clone())));
                }
                (Kind::SubOrchestration { .. }, HistoryEvent::SubOrchestrationFailed { id: cid, error })
                    if *cid == id =>
                {
                    return Poll::Ready(DurableOutput::SubOrchestration(Err(error.clone())));
                }
                _ => {}
            }
        }
        Poll::Pending
    }
}

/// Race a set of durable futures; resolves with the index and output of the
/// one whose completion was recorded earliest.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // Poll every child so each one claims its id and appends its
        // scheduling event, losers included.
        let mut ready: Vec<(usize, DurableOutput)> = Vec::new();
        for (idx, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                ready.push((idx, out));
            }
        }
        if ready.is_empty() {
            return Poll::Pending;
        }
        let inner = this.ctx.inner.lock().unwrap();
        let winner = ready
            .into_iter()
            .min_by_key(|(idx, _)| this.children[*idx].completion_position(&inner.history));
        match winner {
            Some(w) => Poll::Ready(w),
            None => Poll::Pending,
        }
    }
}

/// Wait for all durable futures; outputs are ordered by completion position
/// in history.
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // Poll every child even when one is pending, so every branch
        // schedules before the turn suspends.
        let mut ready: Vec<(usize, DurableOutput)> = Vec::new();
        let mut pending = false;
        for (idx, child) in this.children.iter_mut().enumerate() {
            match Pin::new(child).poll(cx) {
                Poll::Ready(out) => ready.push((idx, out)),
                Poll::Pending => pending = true,
            }
        }
        if pending {
            return Poll::Pending;
        }
        let inner = this.ctx.inner.lock().unwrap();
        ready.sort_by_key(|(idx, _)| this.children[*idx].completion_position(&inner.history));
        Poll::Ready(ready.into_iter().map(|(_, out)| out).collect())
    }
}
