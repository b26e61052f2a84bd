//! Demo binary: the approval workflow behind an HTTP surface, over the
//! in-memory store.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use durandal::api::{self, ApiState};
use durandal::providers::{HistoryStore, InMemoryHistoryStore};
use durandal::samples::{
    sample_activities, sample_entities, sample_orchestrations, ApprovalOptions, LogNotifier,
};
use durandal::{CallbackGateway, EntityStore, Runtime};

const LISTEN_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,durandal=debug")),
        )
        .init();

    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let gateway = CallbackGateway::new(store.clone());
    let options = ApprovalOptions {
        host_base_url: format!("http://{LISTEN_ADDR}"),
        notifier: Arc::new(LogNotifier),
    };
    let runtime = Runtime::start_with_store(
        store.clone(),
        sample_activities(options, gateway.clone()),
        sample_orchestrations(),
    )
    .await;
    let entities = EntityStore::new(store, sample_entities());

    let app = api::router(ApiState { runtime, gateway, entities });
    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
