//! Full approval pipeline scenarios over the sample workflow set.

use std::sync::Arc;
use std::time::Duration;

use durandal::providers::in_memory::InMemoryHistoryStore;
use durandal::runtime::Runtime;
use durandal::samples::{
    sample_activities, sample_orchestrations, ApprovalOptions, NUM_DATA_FILES,
};
use durandal::{CallbackGateway, HistoryEvent, InstanceStatus};

mod common;

use common::{token_from_url, wait_until, CapturingNotifier};

struct Scenario {
    rt: Arc<Runtime>,
    gateway: Arc<CallbackGateway>,
    notifier: Arc<CapturingNotifier>,
}

async fn scenario() -> Scenario {
    let store = Arc::new(InMemoryHistoryStore::new());
    let gateway = CallbackGateway::new(store.clone());
    let notifier = CapturingNotifier::new();
    let options = ApprovalOptions {
        host_base_url: "http://approvals.test".to_string(),
        notifier: notifier.clone(),
    };
    let rt = Runtime::start_with_store(
        store,
        sample_activities(options, gateway.clone()),
        sample_orchestrations(),
    )
    .await;
    Scenario { rt, gateway, notifier }
}

#[tokio::test]
async fn approved_path_generates_notifies_and_finalizes() {
    let s = scenario().await;
    let handle = s
        .rt
        .start_orchestration("appr-ok", "ApprovalWorkflow", "Quarterly report")
        .await
        .unwrap();

    let template = s
        .notifier
        .wait_for_template(Duration::from_secs(5))
        .await
        .expect("an approval notification should go out");
    assert_eq!(template.subject, "Quarterly report");
    assert_eq!(template.instance, "appr-ok");
    assert_eq!(template.file_names.len(), NUM_DATA_FILES);
    assert_eq!(template.file_names[0], "data_000.json");
    assert!(template.approved_url.starts_with("http://approvals.test/callback/"));

    let rt = s.rt.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let rt = rt.clone();
            async move { rt.get_custom_status("appr-ok").await.as_deref() == Some("WaitingForApproval") }
        })
        .await,
        "workflow should report it is waiting"
    );

    let token = token_from_url(&template.approved_url);
    s.gateway.deliver(&token, "Approved").await.unwrap();

    let (history, output) = handle.await.unwrap();
    assert_eq!(output, Ok("Approved".to_string()));
    assert_eq!(s.rt.get_custom_status("appr-ok").await.as_deref(), Some("Finalizing"));
    // Generation plus finalization: two sub-orchestrations in history.
    let children = history
        .iter()
        .filter(|e| matches!(e, HistoryEvent::SubOrchestrationScheduled { .. }))
        .count();
    assert_eq!(children, 2);
    assert!(matches!(
        s.rt.get_instance_status("appr-ok::sub::1").await,
        InstanceStatus::Completed { .. }
    ));
    s.rt.shutdown().await;
}

#[tokio::test]
async fn rejected_path_skips_finalization() {
    let s = scenario().await;
    let handle = s
        .rt
        .start_orchestration("appr-no", "ApprovalWorkflow", "Risky change")
        .await
        .unwrap();

    let template = s
        .notifier
        .wait_for_template(Duration::from_secs(5))
        .await
        .expect("an approval notification should go out");
    let token = token_from_url(&template.rejected_url);
    s.gateway.deliver(&token, "Rejected").await.unwrap();

    let (history, output) = handle.await.unwrap();
    assert_eq!(output, Ok("Rejected".to_string()));
    let children = history
        .iter()
        .filter(|e| matches!(e, HistoryEvent::SubOrchestrationScheduled { .. }))
        .count();
    assert_eq!(children, 1, "rejection must not schedule finalization");
    assert_eq!(
        s.rt.get_custom_status("appr-no").await.as_deref(),
        Some("WaitingForApproval")
    );
    s.rt.shutdown().await;
}

#[tokio::test]
async fn verdict_arriving_before_the_subscription_is_not_lost() {
    let s = scenario().await;
    let handle = s
        .rt
        .start_orchestration("appr-fast", "ApprovalWorkflow", "Fast approver")
        .await
        .unwrap();

    // Deliver the instant the link exists, likely before the workflow has
    // recorded its subscription. The verdict must be buffered, not dropped.
    let template = s
        .notifier
        .wait_for_template(Duration::from_secs(5))
        .await
        .expect("an approval notification should go out");
    let token = token_from_url(&template.approved_url);
    s.gateway.deliver(&token, "Approved").await.unwrap();

    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("Approved".to_string()));
    s.rt.shutdown().await;
}

#[tokio::test]
async fn generated_files_are_deterministically_named_and_ordered() {
    let s = scenario().await;
    let handle = s
        .rt
        .start_orchestration("appr-files", "ApprovalWorkflow", "Naming check")
        .await
        .unwrap();

    let template = s
        .notifier
        .wait_for_template(Duration::from_secs(5))
        .await
        .expect("an approval notification should go out");
    let expected: Vec<String> = (0..NUM_DATA_FILES).map(|i| format!("data_{i:03}.json")).collect();
    assert_eq!(template.file_names, expected);

    let token = token_from_url(&template.rejected_url);
    s.gateway.deliver(&token, "Rejected").await.unwrap();
    handle.await.unwrap();
    s.rt.shutdown().await;
}
