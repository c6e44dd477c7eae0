//! Demo routes and action handler.

use std::sync::{Arc, OnceLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use svckit::directory_sdk::ServiceDescriptor;
use svckit::{ActionHandler, ActionMessage, ChannelPublisher, HandlerError, handler_fn};

pub const QUEUE_CAPACITY: usize = 256;

/// Instance identity, filled in once the lifecycle is running.
#[derive(Debug, Clone, Default)]
pub struct Identity(Arc<OnceLock<ServiceDescriptor>>);

impl Identity {
    pub fn set(&self, descriptor: ServiceDescriptor) {
        if self.0.set(descriptor).is_err() {
            tracing::debug!("Identity already published");
        }
    }
}

#[derive(Clone)]
struct AppState {
    identity: Identity,
    publisher: ChannelPublisher,
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    correlation_id: Option<String>,
}

#[must_use]
pub fn router(identity: Identity, publisher: ChannelPublisher) -> Router {
    Router::new()
        .route("/", get(whoami))
        .route("/actions", post(publish_action))
        .with_state(AppState {
            identity,
            publisher,
        })
}

async fn whoami(State(state): State<AppState>) -> Json<serde_json::Value> {
    let Some(d) = state.identity.0.get() else {
        return Json(json!({ "status": "starting" }));
    };
    Json(json!({
        "name": d.name(),
        "instance_id": d.instance_id(),
        "address": d.address(),
        "health_check": d.health_check_endpoint(),
    }))
}

async fn publish_action(
    State(state): State<AppState>,
    Json(request): Json<ActionRequest>,
) -> Response {
    if request.action_type.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "action_type must not be empty" })),
        )
            .into_response();
    }

    let payload = match &request.payload {
        serde_json::Value::Null => Bytes::new(),
        value => Bytes::from(value.to_string()),
    };
    let mut message = ActionMessage::new(request.action_type, payload);
    if let Some(id) = request.correlation_id {
        message = message.with_correlation_id(id);
    }
    let correlation_id = message.correlation_id.clone();

    // never wait for queue space: a stopped consumer must not hold requests open
    match state.publisher.try_publish(message) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "correlation_id": correlation_id })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, correlation_id, "Failed to enqueue action");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// Logs every action; `fail` and non-JSON payloads are rejected to show
/// handler error isolation.
#[must_use]
pub fn action_handler() -> impl ActionHandler + 'static {
    handler_fn(|message: ActionMessage| async move {
        let payload: serde_json::Value = if message.payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&message.payload)
                .map_err(|err| HandlerError::with_source("payload is not valid JSON", err))?
        };
        tracing::info!(
            action_type = %message.action_type,
            correlation_id = %message.correlation_id,
            %payload,
            "Handling action"
        );
        if message.action_type == "fail" {
            return Err(HandlerError::new("action rejected by demo handler"));
        }
        Ok(())
    })
}
