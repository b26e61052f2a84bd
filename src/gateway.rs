//! Callback gateway: single-use correlation tokens that map an out-of-band
//! callback (an approval link, a webhook) onto an external event for a
//! specific instance.
//!
//! Tokens are persisted in the provider, so a registered token survives a
//! restart. Consumption is atomic: of two concurrent deliveries for the
//! same token, exactly one raises the event.

use std::sync::Arc;

use tracing::info;

use crate::client::Client;
use crate::providers::{ConsumeOutcome, HistoryStore, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown correlation token")]
    UnknownToken,
    #[error("correlation token already consumed")]
    AlreadyConsumed,
    #[error("event delivery failed: {0}")]
    Delivery(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub struct CallbackGateway {
    store: Arc<dyn HistoryStore>,
    client: Client,
}

impl CallbackGateway {
    pub fn new(store: Arc<dyn HistoryStore>) -> Arc<Self> {
        let client = Client::new(store.clone());
        Arc::new(Self { store, client })
    }

    /// Register a token that, when delivered, raises `event_name` on
    /// `instance`.
    pub async fn register(
        &self,
        token: &str,
        instance: &str,
        event_name: &str,
    ) -> Result<(), GatewayError> {
        self.store.put_correlation(token, instance, event_name).await?;
        info!(instance = %instance, event = %event_name, "registered callback token");
        Ok(())
    }

    /// Consume the token and raise its event with `payload`. A second
    /// delivery of the same token fails with
    /// [`GatewayError::AlreadyConsumed`].
    pub async fn deliver(&self, token: &str, payload: impl Into<String>) -> Result<(), GatewayError> {
        match self.store.consume_correlation(token).await? {
            ConsumeOutcome::Unknown => Err(GatewayError::UnknownToken),
            ConsumeOutcome::AlreadyConsumed => Err(GatewayError::AlreadyConsumed),
            ConsumeOutcome::Consumed(rec) => {
                info!(instance = %rec.instance, event = %rec.event_name, "delivering callback");
                self.client
                    .raise_event(&rec.instance, &rec.event_name, payload.into())
                    .await
                    .map_err(|e| GatewayError::Delivery(e.to_string()))
            }
        }
    }

    /// Look a token up without consuming it.
    pub async fn peek(&self, token: &str) -> Option<crate::providers::CorrelationRecord> {
        self.store.get_correlation(token).await
    }
}
