//! Callback gateway token lifecycle against a live runtime.

use std::sync::Arc;
use std::time::Duration;

use durandal::providers::in_memory::InMemoryHistoryStore;
use durandal::runtime::Runtime;
use durandal::{ActivityRegistry, CallbackGateway, GatewayError, InstanceStatus, OrchestrationRegistry};

fn approval_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("AwaitApproval", |ctx, _: String| async move {
            let verdict = ctx.schedule_wait("Approval").into_event().await;
            Ok(verdict)
        })
        .build()
}

#[tokio::test]
async fn delivered_token_raises_the_correlated_event() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        approval_orchestrations(),
    )
    .await;
    let gateway = CallbackGateway::new(store);

    let handle = rt.start_orchestration("inst-cb", "AwaitApproval", "").await.unwrap();
    gateway.register("tok-1", "inst-cb", "Approval").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway.deliver("tok-1", "Approved").await.unwrap();

    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("Approved".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn a_token_is_single_use() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        approval_orchestrations(),
    )
    .await;
    let gateway = CallbackGateway::new(store);

    let handle = rt.start_orchestration("inst-once", "AwaitApproval", "").await.unwrap();
    gateway.register("tok-once", "inst-once", "Approval").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway.deliver("tok-once", "Approved").await.unwrap();
    let second = gateway.deliver("tok-once", "Rejected").await;
    assert!(matches!(second, Err(GatewayError::AlreadyConsumed)));

    // The first verdict sticks.
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("Approved".to_string()));
    assert_eq!(
        rt.get_instance_status("inst-once").await,
        InstanceStatus::Completed { output: "Approved".to_string() }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn unknown_tokens_are_rejected() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let gateway = CallbackGateway::new(store);
    let err = gateway.deliver("never-registered", "x").await;
    assert!(matches!(err, Err(GatewayError::UnknownToken)));
    assert!(gateway.peek("never-registered").await.is_none());
}

#[tokio::test]
async fn peek_does_not_consume() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        approval_orchestrations(),
    )
    .await;
    let gateway = CallbackGateway::new(store);

    let handle = rt.start_orchestration("inst-peek", "AwaitApproval", "").await.unwrap();
    gateway.register("tok-peek", "inst-peek", "Approval").await.unwrap();
    let rec = gateway.peek("tok-peek").await.unwrap();
    assert_eq!(rec.instance, "inst-peek");
    assert_eq!(rec.event_name, "Approval");
    assert!(!rec.consumed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway.deliver("tok-peek", "Approved").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("Approved".to_string()));
    rt.shutdown().await;
}
