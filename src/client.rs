//! Store-backed management client.
//!
//! A `Client` talks to the provider only: it creates executions, drops work
//! items on the orchestrator queue, and derives status from history. It
//! never holds a `Runtime` handle, so it works from any process that can
//! reach the store.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::runtime::status::{custom_status_from_history, status_from_history};
use crate::runtime::{StartError, WaitError};
use crate::{codec, HistoryEvent, InstanceStatus};

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Create the instance and queue it for pickup by a runtime.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), StartError> {
        let input = input.into();
        self.store
            .create_execution(instance, orchestration, &input, None, None)
            .await
            .map_err(|e| match e {
                ProviderError::DuplicateExecution(i) => StartError::DuplicateInstance(i),
                other => StartError::Provider(other),
            })?;
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input,
                    parent_instance: None,
                    parent_id: None,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), StartError> {
        self.start_orchestration(instance, orchestration, codec::Json::encode(input)).await
    }

    /// Raise an external event toward a running instance.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ProviderError> {
        if self.store.latest_execution_id(instance).await.is_none() {
            return Err(ProviderError::InstanceNotFound(instance.to_string()));
        }
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

    pub async fn terminate_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), ProviderError> {
        if self.store.latest_execution_id(instance).await.is_none() {
            return Err(ProviderError::InstanceNotFound(instance.to_string()));
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance { instance: instance.to_string(), reason: reason.into() },
            )
            .await
    }

    pub async fn get_status(&self, instance: &str) -> InstanceStatus {
        status_from_history(&self.store.read(instance).await)
    }

    pub async fn get_custom_status(&self, instance: &str) -> Option<String> {
        custom_status_from_history(&self.store.read(instance).await)
    }

    pub async fn read_history(&self, instance: &str) -> Vec<HistoryEvent> {
        self.store.read(instance).await
    }

    /// Poll until the instance is terminal.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff_ms = 5u64;
        loop {
            let status = self.get_status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(100);
        }
    }

    /// Terminal output decoded from JSON; errors on non-terminal or failed
    /// instances.
    pub async fn get_output_typed<Out: DeserializeOwned>(&self, instance: &str) -> Result<Out, String> {
        match self.get_status(instance).await {
            InstanceStatus::Completed { output } => codec::Json::decode(&output),
            other => Err(format!("instance '{instance}' is {}", other.as_str())),
        }
    }
}
