//! HTTP control surface.
//!
//! Start and query orchestrations, deliver approval callbacks, and read or
//! signal entities. Handlers translate domain errors to status codes:
//! duplicate instance ids are 409, unknown tokens 404, consumed tokens 410.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::entity::{EntityError, EntityId, EntityStore};
use crate::gateway::{CallbackGateway, GatewayError};
use crate::runtime::{Runtime, StartError};
use crate::InstanceStatus;

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<Runtime>,
    pub gateway: Arc<CallbackGateway>,
    pub entities: Arc<EntityStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/orchestrations/:name", post(start_orchestration).get(get_orchestration))
        .route("/orchestrations/:name/:id", post(start_orchestration_with_id))
        .route("/callback/:token", get(deliver_callback))
        .route("/entities/:entity_type/:key", get(read_entity))
        .route("/entities/:entity_type/:key/:operation", post(signal_entity))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn start_with(state: &ApiState, name: &str, id: &str, input: String) -> Response {
    match state.runtime.start_orchestration(id, name, input).await {
        Ok(_handle) => (
            StatusCode::ACCEPTED,
            Json(json!({ "id": id, "statusUri": format!("/orchestrations/{id}") })),
        )
            .into_response(),
        Err(StartError::DuplicateInstance(i)) => {
            error_body(StatusCode::CONFLICT, format!("an active instance named '{i}' already exists"))
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn start_orchestration(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: String,
) -> Response {
    let id = Uuid::new_v4().to_string();
    start_with(&state, &name, &id, body).await
}

/// Caller-supplied instance id; lets a workflow act as a singleton per key.
async fn start_orchestration_with_id(
    State(state): State<ApiState>,
    Path((name, id)): Path<(String, String)>,
    body: String,
) -> Response {
    start_with(&state, &name, &id, body).await
}

async fn get_orchestration(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let status = state.runtime.get_instance_status(&id).await;
    if status == InstanceStatus::NotFound {
        return error_body(StatusCode::NOT_FOUND, format!("no instance named '{id}'"));
    }
    let custom_status = state.runtime.get_custom_status(&id).await;
    let mut body = json!({ "id": id, "status": status.as_str() });
    match &status {
        InstanceStatus::Completed { output } => body["output"] = Value::String(output.clone()),
        InstanceStatus::Failed { error } => body["error"] = Value::String(error.clone()),
        InstanceStatus::Terminated { reason } => body["reason"] = Value::String(reason.clone()),
        _ => {}
    }
    if let Some(cs) = custom_status {
        body["customStatus"] = Value::String(cs);
    }
    Json(body).into_response()
}

async fn deliver_callback(
    State(state): State<ApiState>,
    Path(token): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(result) = params.get("result") else {
        return error_body(StatusCode::BAD_REQUEST, "missing 'result' query parameter");
    };
    match state.gateway.deliver(&token, result.clone()).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "accepted", "result": result }))).into_response(),
        Err(GatewayError::UnknownToken) => error_body(StatusCode::NOT_FOUND, "unknown correlation token"),
        Err(GatewayError::AlreadyConsumed) => {
            error_body(StatusCode::GONE, "correlation token already consumed")
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn read_entity(
    State(state): State<ApiState>,
    Path((entity_type, key)): Path<(String, String)>,
) -> Response {
    let id = EntityId::new(entity_type, key);
    match state.entities.read_state(&id).await {
        Some(raw) => {
            let value: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            Json(json!({ "id": id.storage_key(), "state": value })).into_response()
        }
        None => error_body(StatusCode::NOT_FOUND, format!("no entity state for '{id}'")),
    }
}

async fn signal_entity(
    State(state): State<ApiState>,
    Path((entity_type, key, operation)): Path<(String, String, String)>,
    body: String,
) -> Response {
    let id = EntityId::new(entity_type, key);
    match state.entities.signal(&id, &operation, body).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response(),
        Err(EntityError::UnknownEntityType(t)) => {
            error_body(StatusCode::NOT_FOUND, format!("no entity handler registered for type '{t}'"))
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
