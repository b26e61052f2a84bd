//! Replay engine seam between the run loop and the turn executor.

use std::sync::Arc;

use super::registry::OrchestrationHandler;
use crate::{run_turn_with_claims, Action, ClaimedIds, HistoryEvent};

pub struct TurnOutcome {
    pub history: Vec<HistoryEvent>,
    pub actions: Vec<Action>,
    pub claims: ClaimedIds,
    /// `Some` when the orchestrator ran to completion this turn.
    pub output: Option<Result<String, String>>,
}

pub trait ReplayEngine: Send + Sync {
    fn replay(
        &self,
        instance: &str,
        turn_index: u64,
        history: Vec<HistoryEvent>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome;
}

pub struct DefaultReplayEngine;

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance: &str,
        turn_index: u64,
        history: Vec<HistoryEvent>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome {
        let (history, actions, claims, output) =
            run_turn_with_claims(instance, history, turn_index, |ctx| {
                let handler = handler.clone();
                let input = input.clone();
                async move { handler.invoke(ctx, input).await }
            });
        TurnOutcome { history, actions, claims, output }
    }
}
