//! End-to-end runtime tests over the in-memory provider.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use durandal::runtime::registry::{ActivityRegistry, OrchestrationRegistry, RetryPolicy};
use durandal::runtime::Runtime;
use durandal::{HistoryEvent, InstanceStatus, StartError};

fn math_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Add", |input: String| async move {
            let mut parts = input.split(',');
            let a: i64 = parts.next().unwrap_or("0").parse().map_err(|e| format!("{e}"))?;
            let b: i64 = parts.next().unwrap_or("0").parse().map_err(|e| format!("{e}"))?;
            Ok((a + b).to_string())
        })
        .build()
}

#[tokio::test]
async fn single_activity_orchestration_completes() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("AddOne", |ctx, input: String| async move {
            ctx.schedule_activity("Add", format!("{input},1")).into_activity().await
        })
        .build();
    let rt = Runtime::start(math_activities(), orchestrations).await;

    let handle = rt.start_orchestration("inst-add", "AddOne", "41").await.unwrap();
    let (history, output) = handle.await.unwrap();
    assert_eq!(output, Ok("42".to_string()));
    assert!(history
        .iter()
        .any(|e| matches!(e, HistoryEvent::OrchestrationCompleted { .. })));
    assert_eq!(
        rt.get_instance_status("inst-add").await,
        InstanceStatus::Completed { output: "42".to_string() }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn fan_out_collects_every_branch() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx, _input: String| async move {
            let futs = (0..5)
                .map(|i| ctx.schedule_activity("Add", format!("{i},10")))
                .collect::<Vec<_>>();
            let outs = ctx.join(futs).await;
            let mut sums = Vec::new();
            for o in outs {
                match o {
                    durandal::futures::DurableOutput::Activity(r) => sums.push(r?),
                    other => return Err(format!("unexpected output {other:?}")),
                }
            }
            sums.sort();
            Ok(sums.join(","))
        })
        .build();
    let rt = Runtime::start(math_activities(), orchestrations).await;

    let handle = rt.start_orchestration("inst-fan", "FanOut", "").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("10,11,12,13,14".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn failing_activity_retries_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let activities = ActivityRegistry::builder()
        .register_with_retry("Flaky", RetryPolicy::new(3, 10), move |_: String| {
            let seen = seen.clone();
            async move {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok("recovered".to_string())
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RunFlaky", |ctx, _: String| async move {
            ctx.schedule_activity("Flaky", "").into_activity().await
        })
        .build();
    let rt = Runtime::start(activities, orchestrations).await;

    let handle = rt.start_orchestration("inst-retry", "RunFlaky", "").await.unwrap();
    let (history, output) = handle.await.unwrap();
    assert_eq!(output, Ok("recovered".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Intermediate failures never reach history; only the final result does.
    assert!(!history.iter().any(|e| matches!(e, HistoryEvent::ActivityFailed { .. })));
    rt.shutdown().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_orchestration() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let activities = ActivityRegistry::builder()
        .register_with_retry("Broken", RetryPolicy::new(2, 5), move |_: String| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err("still broken".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RunBroken", |ctx, _: String| async move {
            ctx.schedule_activity("Broken", "").into_activity().await
        })
        .build();
    let rt = Runtime::start(activities, orchestrations).await;

    let handle = rt.start_orchestration("inst-exhaust", "RunBroken", "").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Err("still broken".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2, "total attempts are capped by the policy");
    rt.shutdown().await;
}

#[tokio::test]
async fn timer_orchestration_fires_and_completes() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Sleepy", |ctx, _: String| async move {
            ctx.schedule_timer(50).into_timer().await;
            Ok("woke".to_string())
        })
        .build();
    let rt = Runtime::start(ActivityRegistry::builder().build(), orchestrations).await;

    let handle = rt.start_orchestration("inst-timer", "Sleepy", "").await.unwrap();
    let (history, output) = handle.await.unwrap();
    assert_eq!(output, Ok("woke".to_string()));
    assert!(history.iter().any(|e| matches!(e, HistoryEvent::TimerFired { .. })));
    rt.shutdown().await;
}

fn wait_for_go() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("WaitForGo", |ctx, _: String| async move {
            let data = ctx.schedule_wait("Go").into_event().await;
            Ok(data)
        })
        .build()
}

#[tokio::test]
async fn external_event_resolves_a_waiting_instance() {
    let rt = Runtime::start(ActivityRegistry::builder().build(), wait_for_go()).await;

    let handle = rt.start_orchestration("inst-ext", "WaitForGo", "").await.unwrap();
    // Give the subscription a moment to be recorded, then raise.
    tokio::time::sleep(Duration::from_millis(100)).await;
    rt.raise_event("inst-ext", "Go", "green").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("green".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn event_raised_before_subscription_is_buffered() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("SlowSubscriber", |ctx, _: String| async move {
            // Subscribe only after a timer, so an early raise has no open
            // subscription to match.
            ctx.schedule_timer(300).into_timer().await;
            let data = ctx.schedule_wait("Go").into_event().await;
            Ok(data)
        })
        .build();
    let rt = Runtime::start(ActivityRegistry::builder().build(), orchestrations).await;

    let handle = rt.start_orchestration("inst-early", "SlowSubscriber", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    rt.raise_event("inst-early", "Go", "early-bird").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("early-bird".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn dehydrated_instance_rehydrates_on_event_delivery() {
    let rt = Runtime::start(ActivityRegistry::builder().build(), wait_for_go()).await;

    let handle = rt.start_orchestration("inst-idle", "WaitForGo", "").await.unwrap();
    // Past the idle window the run loop unloads the instance.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(rt.get_instance_status("inst-idle").await, InstanceStatus::Running);
    rt.raise_event("inst-idle", "Go", "late").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("late".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_marks_the_instance_terminated() {
    let rt = Runtime::start(ActivityRegistry::builder().build(), wait_for_go()).await;

    let handle = rt.start_orchestration("inst-term", "WaitForGo", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rt.terminate_instance("inst-term", "operator request").await.unwrap();
    let (history, output) = handle.await.unwrap();
    assert!(output.is_err());
    assert!(history
        .iter()
        .any(|e| matches!(e, HistoryEvent::OrchestrationTerminated { reason } if reason == "operator request")));
    assert_eq!(
        rt.get_instance_status("inst-term").await,
        InstanceStatus::Terminated { reason: "operator request".to_string() }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_rejected_until_terminal_then_reusable() {
    let rt = Runtime::start(ActivityRegistry::builder().build(), wait_for_go()).await;

    let handle = rt.start_orchestration("inst-dup", "WaitForGo", "").await.unwrap();
    let second = rt.start_orchestration("inst-dup", "WaitForGo", "").await;
    assert!(matches!(second, Err(StartError::DuplicateInstance(_))));

    tokio::time::sleep(Duration::from_millis(100)).await;
    rt.raise_event("inst-dup", "Go", "first").await.unwrap();
    handle.await.unwrap();

    // A terminal instance id can be reused; it starts a fresh execution.
    let handle = rt.start_orchestration("inst-dup", "WaitForGo", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rt.raise_event("inst-dup", "Go", "second").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("second".to_string()));
    assert_eq!(rt.store().list_executions("inst-dup").await.len(), 2);
    rt.shutdown().await;
}

#[tokio::test]
async fn sub_orchestration_result_flows_back_to_parent() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx, input: String| async move {
            let child = ctx
                .schedule_sub_orchestration("Child", input)
                .into_sub_orchestration()
                .await?;
            Ok(format!("parent({child})"))
        })
        .register("Child", |ctx, input: String| async move {
            ctx.schedule_activity("Add", format!("{input},100")).into_activity().await
        })
        .build();
    let rt = Runtime::start(math_activities(), orchestrations).await;

    let handle = rt.start_orchestration("inst-parent", "Parent", "7").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output, Ok("parent(107)".to_string()));
    assert_eq!(
        rt.get_instance_status("inst-parent::sub::1").await,
        InstanceStatus::Completed { output: "107".to_string() }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_the_instance() {
    let rt = Runtime::start(
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
    )
    .await;

    let handle = rt.start_orchestration("inst-missing", "Nope", "").await.unwrap();
    let (_, output) = handle.await.unwrap();
    let err = output.unwrap_err();
    assert!(err.contains("Nope"), "error should name the orchestration: {err}");
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_the_await() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsGhost", |ctx, _: String| async move {
            ctx.schedule_activity("Ghost", "").into_activity().await
        })
        .build();
    let rt = Runtime::start(ActivityRegistry::builder().build(), orchestrations).await;

    let handle = rt.start_orchestration("inst-ghost", "CallsGhost", "").await.unwrap();
    let (_, output) = handle.await.unwrap();
    let err = output.unwrap_err();
    assert!(err.contains("Ghost"), "error should name the activity: {err}");
    rt.shutdown().await;
}
