#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use durandal::samples::{ApprovalTemplate, Notifier};

/// Notifier that records every template so tests can pull the approval
/// token out of the rendered links.
pub struct CapturingNotifier {
    templates: Mutex<Vec<ApprovalTemplate>>,
}

impl CapturingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { templates: Mutex::new(Vec::new()) })
    }

    pub fn sent(&self) -> Vec<ApprovalTemplate> {
        self.templates.lock().unwrap().clone()
    }

    pub async fn wait_for_template(&self, timeout: Duration) -> Option<ApprovalTemplate> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(t) = self.templates.lock().unwrap().first().cloned() {
                return Some(t);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn notify(&self, template: ApprovalTemplate) -> Result<(), String> {
        self.templates.lock().unwrap().push(template);
        Ok(())
    }
}

/// Extract the correlation token from an approval link of the form
/// `{base}/callback/{token}?result=...`.
pub fn token_from_url(url: &str) -> String {
    url.split("/callback/")
        .nth(1)
        .and_then(|rest| rest.split('?').next())
        .expect("approval url should contain a callback token")
        .to_string()
}

/// Minimal counter entity for control-surface tests; state is
/// `{"value": n}` and operations are `increment` and `add`.
pub struct TestCounterEntity;

#[async_trait]
impl durandal::entity::EntityHandler for TestCounterEntity {
    async fn apply(&self, operation: &str, args: &str, state: Option<String>) -> Result<String, String> {
        let mut value = match state {
            Some(raw) => serde_json::from_str::<serde_json::Value>(&raw)
                .map_err(|e| format!("{e}"))?
                .get("value")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            None => 0,
        };
        match operation {
            "increment" => value += 1,
            "add" => value += args.trim().parse::<i64>().map_err(|e| format!("{e}"))?,
            other => return Err(format!("unknown operation '{other}'")),
        }
        Ok(format!("{{\"value\":{value}}}"))
    }
}

/// Poll until `probe` returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, probe: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
