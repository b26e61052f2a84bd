//! HTTP control surface tests driven through the router with no listener.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use durandal::api::{router, ApiState};
use durandal::entity::{EntityRegistry, EntityStore};
use durandal::providers::in_memory::InMemoryHistoryStore;
use durandal::runtime::Runtime;
use durandal::{ActivityRegistry, CallbackGateway, OrchestrationRegistry};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

mod common;

struct TestApp {
    app: Router,
    runtime: Arc<Runtime>,
    gateway: Arc<CallbackGateway>,
}

async fn test_app() -> TestApp {
    let store = Arc::new(InMemoryHistoryStore::new());
    let orchestrations = OrchestrationRegistry::builder()
        .register("Echo", |_ctx, input: String| async move { Ok(input) })
        .register("AwaitApproval", |ctx, _: String| async move {
            let verdict = ctx.schedule_wait("Approval").into_event().await;
            Ok(verdict)
        })
        .build();
    let runtime =
        Runtime::start_with_store(store.clone(), ActivityRegistry::builder().build(), orchestrations).await;
    let gateway = CallbackGateway::new(store.clone());
    let entities = EntityStore::new(
        store,
        EntityRegistry::builder()
            .register("Counter", common::TestCounterEntity)
            .build(),
    );
    let state = ApiState { runtime: runtime.clone(), gateway: gateway.clone(), entities };
    TestApp { app: router(state), runtime, gateway }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_for_status(app: &Router, uri: &str, expected: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, body) = send(app, get(uri)).await;
        if body["status"] == expected {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance never reached {expected}, last body: {body}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn start_accepts_and_reports_completion() {
    let t = test_app().await;

    let (status, body) = send(&t.app, post("/orchestrations/Echo", "hello")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["statusUri"], format!("/orchestrations/{id}"));

    let body = wait_for_status(&t.app, &format!("/orchestrations/{id}"), "Completed").await;
    assert_eq!(body["output"], "hello");
    t.runtime.shutdown().await;
}

#[tokio::test]
async fn explicit_instance_ids_are_singletons() {
    let t = test_app().await;

    let (status, _) = send(&t.app, post("/orchestrations/AwaitApproval/order-7", "")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = send(&t.app, post("/orchestrations/AwaitApproval/order-7", "")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("order-7"));
    t.runtime.shutdown().await;
}

#[tokio::test]
async fn unknown_instance_status_is_404() {
    let t = test_app().await;
    let (status, _) = send(&t.app, get("/orchestrations/no-such-id")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    t.runtime.shutdown().await;
}

#[tokio::test]
async fn callback_endpoint_enforces_token_lifecycle() {
    let t = test_app().await;

    let (status, _) = send(&t.app, post("/orchestrations/AwaitApproval/approve-me", "")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    t.gateway.register("tok-http", "approve-me", "Approval").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _) = send(&t.app, get("/callback/tok-http")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "result query parameter is required");

    let (status, body) = send(&t.app, get("/callback/tok-http?result=Approved")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "Approved");

    let (status, _) = send(&t.app, get("/callback/tok-http?result=Rejected")).await;
    assert_eq!(status, StatusCode::GONE);

    let (status, _) = send(&t.app, get("/callback/never-issued?result=Approved")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body = wait_for_status(&t.app, "/orchestrations/approve-me", "Completed").await;
    assert_eq!(body["output"], "Approved");
    t.runtime.shutdown().await;
}

#[tokio::test]
async fn entity_signal_and_read_round_trip() {
    let t = test_app().await;

    let (status, _) = send(&t.app, post("/entities/Counter/basket/add", "5")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&t.app, post("/entities/Counter/basket/increment", "")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = send(&t.app, get("/entities/Counter/basket")).await;
        if status == StatusCode::OK && body["state"]["value"] == 6 {
            assert_eq!(body["id"], "Counter/basket");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "entity state never converged: {body}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    t.runtime.shutdown().await;
}

#[tokio::test]
async fn approval_workflow_runs_end_to_end_over_http() {
    use durandal::samples::{sample_activities, sample_entities, sample_orchestrations, ApprovalOptions};

    let store = Arc::new(InMemoryHistoryStore::new());
    let gateway = CallbackGateway::new(store.clone());
    let notifier = common::CapturingNotifier::new();
    let options = ApprovalOptions {
        host_base_url: "http://approvals.test".to_string(),
        notifier: notifier.clone(),
    };
    let runtime = Runtime::start_with_store(
        store.clone(),
        sample_activities(options, gateway.clone()),
        sample_orchestrations(),
    )
    .await;
    let entities = EntityStore::new(store, sample_entities());
    let app = router(ApiState { runtime: runtime.clone(), gateway, entities });

    let (status, _) = send(&app, post("/orchestrations/ApprovalWorkflow/http-appr", "Budget")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let template = notifier
        .wait_for_template(Duration::from_secs(5))
        .await
        .expect("an approval notification should go out");
    let token = common::token_from_url(&template.approved_url);

    let (status, _) = send(&app, get(&format!("/callback/{token}?result=Approved"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, get(&format!("/callback/{token}?result=Approved"))).await;
    assert_eq!(status, StatusCode::GONE);

    let body = wait_for_status(&app, "/orchestrations/http-appr", "Completed").await;
    assert_eq!(body["output"], "Approved");
    assert_eq!(body["customStatus"], "Finalizing");
    runtime.shutdown().await;
}

#[tokio::test]
async fn entity_errors_map_to_404() {
    let t = test_app().await;

    let (status, _) = send(&t.app, get("/entities/Counter/empty")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&t.app, post("/entities/Ghost/k/increment", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    t.runtime.shutdown().await;
}
