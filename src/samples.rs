//! Sample workflow set: a human-approval pipeline and a counter entity.
//!
//! `ApprovalWorkflow` fans out data-file generation in a sub-orchestration,
//! asks for approval through a notifier, then waits durably on an
//! `ApprovalResult` external event that the callback gateway raises when an
//! approval link is followed. The instance survives restarts while waiting;
//! everything it needs to resume is in history.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityHandler, EntityRegistry};
use crate::futures::DurableOutput;
use crate::gateway::CallbackGateway;
use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry, RetryPolicy};
use crate::{codec, durable_error, durable_info, durable_warn, OrchestrationContext};

pub const NUM_DATA_FILES: usize = 3;
pub const APPROVAL_EVENT: &str = "ApprovalResult";

const COLORS: [&str; 7] = ["red", "orange", "yellow", "green", "blue", "indigo", "violet"];

/// One generated data file with per-color sample counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub file_name: String,
    pub orchestration_id: String,
    pub color_counts: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileRequest {
    pub index: usize,
    pub orchestration_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub instance: String,
    pub subject: String,
    pub file_names: Vec<String>,
}

/// Rendered notification handed to the [`Notifier`].
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalTemplate {
    pub subject: String,
    pub instance: String,
    pub approved_url: String,
    pub rejected_url: String,
    pub file_names: Vec<String>,
}

/// Outbound notification channel. Injected so tests capture templates and
/// production wires a mail or chat sender; no configuration is read from the
/// environment.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, template: ApprovalTemplate) -> Result<(), String>;
}

/// Notifier that logs the approval links. Default for local runs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, template: ApprovalTemplate) -> Result<(), String> {
        tracing::info!(
            instance = %template.instance,
            subject = %template.subject,
            approve = %template.approved_url,
            reject = %template.rejected_url,
            "approval requested"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApprovalOptions {
    /// Base URL prefixed to callback paths in notifications.
    pub host_base_url: String,
    pub notifier: Arc<dyn Notifier>,
}

pub fn sample_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("ApprovalWorkflow", approval_workflow)
        .register("GenerateDataSets", generate_data_sets)
        .register("CompleteApproval", complete_approval)
        .build()
}

pub fn sample_activities(options: ApprovalOptions, gateway: Arc<CallbackGateway>) -> ActivityRegistry {
    let request_options = options.clone();
    let request_gateway = gateway;
    ActivityRegistry::builder()
        .register_typed("GenerateUnorderedDataSet", |req: DataFileRequest| async move {
            Ok(generate_unordered_data_set(&req))
        })
        .register_typed("GenerateOrderedDataSet", |file: DataFile| async move {
            // Stand-in for the ordered re-render of an approved file.
            Ok(file.file_name)
        })
        .register("ConfirmApproval", |instance: String| async move {
            tracing::info!(instance = %instance, "approval confirmed");
            Ok(instance)
        })
        .register("ConfirmRejection", |instance: String| async move {
            tracing::info!(instance = %instance, "rejection confirmed");
            Ok(instance)
        })
        .register_with_retry(
            "RequestApproval",
            RetryPolicy::new(3, 200),
            move |input: String| {
                let options = request_options.clone();
                let gateway = request_gateway.clone();
                async move {
                    let req: ApprovalRequest = codec::Json::decode(&input)?;
                    let token = Uuid::new_v4().to_string();
                    gateway
                        .register(&token, &req.instance, APPROVAL_EVENT)
                        .await
                        .map_err(|e| e.to_string())?;
                    let base = options.host_base_url.trim_end_matches('/');
                    let template = ApprovalTemplate {
                        subject: req.subject,
                        instance: req.instance,
                        approved_url: format!("{base}/callback/{token}?result=Approved"),
                        rejected_url: format!("{base}/callback/{token}?result=Rejected"),
                        file_names: req.file_names,
                    };
                    options.notifier.notify(template).await?;
                    Ok(codec::Json::encode(&token))
                }
            },
        )
        .build()
}

async fn approval_workflow(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    durable_info!(ctx, subject = %input, "approval workflow started");
    let files: Vec<DataFile> = ctx
        .schedule_sub_orchestration_typed("GenerateDataSets", &NUM_DATA_FILES)
        .into_sub_orchestration_typed()
        .await?;
    let request = ApprovalRequest {
        instance: ctx.instance_id(),
        subject: input,
        file_names: files.iter().map(|f| f.file_name.clone()).collect(),
    };
    let _token: String = ctx
        .schedule_activity_typed("RequestApproval", &request)
        .into_activity_typed()
        .await?;
    ctx.set_custom_status("WaitingForApproval");
    let verdict = ctx.schedule_wait(APPROVAL_EVENT).into_event().await;
    if verdict == "Approved" {
        ctx.set_custom_status("Finalizing");
        ctx.schedule_sub_orchestration_typed("CompleteApproval", &files)
            .into_sub_orchestration()
            .await?;
        ctx.schedule_activity("ConfirmApproval", ctx.instance_id())
            .into_activity()
            .await?;
        durable_info!(ctx, "request approved");
        Ok("Approved".to_string())
    } else {
        ctx.schedule_activity("ConfirmRejection", ctx.instance_id())
            .into_activity()
            .await?;
        durable_warn!(ctx, verdict = %verdict, "request not approved");
        Ok("Rejected".to_string())
    }
}

/// Fan out one `GenerateUnorderedDataSet` per requested file and return the files
/// sorted by name, so the output does not depend on completion order.
async fn generate_data_sets(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let count: usize = codec::Json::decode(&input)?;
    let futs = (0..count)
        .map(|index| {
            ctx.schedule_activity_typed(
                "GenerateUnorderedDataSet",
                &DataFileRequest { index, orchestration_id: ctx.instance_id() },
            )
        })
        .collect();
    let outputs = ctx.join(futs).await;
    let mut files = Vec::with_capacity(outputs.len());
    for out in outputs {
        match out {
            DurableOutput::Activity(Ok(raw)) => files.push(codec::Json::decode::<DataFile>(&raw)?),
            DurableOutput::Activity(Err(e)) => {
                durable_error!(ctx, error = %e, "data set generation failed");
                return Err(e);
            }
            other => return Err(format!("unexpected completion in fan-out: {other:?}")),
        }
    }
    files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    durable_info!(ctx, count = files.len(), "data set generation complete");
    Ok(codec::Json::encode(&files))
}

async fn complete_approval(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let files: Vec<DataFile> = codec::Json::decode(&input)?;
    let futs = files
        .iter()
        .map(|f| ctx.schedule_activity_typed("GenerateOrderedDataSet", f))
        .collect();
    let outputs = ctx.join(futs).await;
    let mut finalized = Vec::with_capacity(outputs.len());
    for out in outputs {
        match out {
            DurableOutput::Activity(Ok(name)) => finalized.push(name),
            DurableOutput::Activity(Err(e)) => return Err(e),
            other => return Err(format!("unexpected completion in fan-out: {other:?}")),
        }
    }
    finalized.sort();
    Ok(codec::Json::encode(&finalized))
}

fn generate_unordered_data_set(req: &DataFileRequest) -> DataFile {
    let mut rng = rand::thread_rng();
    let color_counts = COLORS
        .iter()
        .map(|c| (c.to_string(), rng.gen_range(0..1_000)))
        .collect();
    DataFile {
        file_name: format!("data_{:03}.json", req.index),
        orchestration_id: req.orchestration_id.clone(),
        color_counts,
    }
}

/// Monotonic counter entity. Reads may trail signals still in the queue.
pub struct CounterEntity;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
}

#[async_trait]
impl EntityHandler for CounterEntity {
    async fn apply(&self, operation: &str, args: &str, state: Option<String>) -> Result<String, String> {
        let mut st: CounterState = match state {
            Some(raw) => codec::Json::decode(&raw)?,
            None => CounterState::default(),
        };
        match operation {
            "increment" => st.value += 1,
            "add" => {
                let n: i64 = codec::Json::decode(args)?;
                st.value += n;
            }
            other => return Err(format!("unknown counter operation: {other}")),
        }
        Ok(codec::Json::encode(&st))
    }
}

pub fn sample_entities() -> EntityRegistry {
    EntityRegistry::builder().register("Counter", CounterEntity).build()
}
