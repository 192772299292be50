//! REST and webhook surface.
//!
//! Thin layer over the engine facade: every handler parses, delegates,
//! and maps errors to explicit HTTP rejections. State machine
//! rejections and busy lead slots come back as 409 so callers can tell
//! "not allowed right now" from "does not exist".

use std::sync::Arc;

use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::model::ConversationState;
use crate::store::ConversationFilter;
use crate::transport::InboundSms;

/// Shared state for all routes.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Transition(_) | Error::SlotBusy(_) | Error::Pipeline(_) => StatusCode::CONFLICT,
            Error::LeadNotFound(_) | Error::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                error!("Request failed: {self}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// GET /api/status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "scheduler_running": state.engine.scheduler_running(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    state: Option<String>,
    lead_id: Option<Uuid>,
}

/// GET /api/conversations?state=engaged&lead_id=…
async fn list_conversations(
    State(state): State<ApiState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Response, Error> {
    let state_filter = match query.state.as_deref() {
        Some(raw) => match ConversationState::parse(raw) {
            Some(parsed) => Some(parsed),
            None => {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown state '{raw}'") })),
                )
                    .into_response());
            }
        },
        None => None,
    };

    let conversations = state
        .engine
        .list_conversations(&ConversationFilter {
            state: state_filter,
            lead_id: query.lead_id,
        })
        .await?;
    Ok(Json(conversations).into_response())
}

/// GET /api/conversations/{id}/messages
async fn get_messages(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Error> {
    let messages = state.engine.get_messages(id).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    lead_id: Uuid,
    body: String,
}

/// POST /api/send-message
async fn send_message(
    State(state): State<ApiState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, Error> {
    let message = state
        .engine
        .send_manual_message(request.lead_id, &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /webhook/sms
///
/// Twilio posts form-encoded `{From, To, Body, MessageSid}`. Always
/// acknowledged with 200 once processed, including duplicates and
/// unknown senders; Twilio retries anything else.
async fn sms_webhook(
    State(state): State<ApiState>,
    Form(sms): Form<InboundSms>,
) -> Result<impl IntoResponse, Error> {
    let outcome = state.engine.handle_inbound_webhook(sms).await?;
    Ok(Json(serde_json::json!({ "outcome": format!("{outcome:?}") })))
}

/// POST /api/scheduler/start
async fn start_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    let started = state.engine.start_scheduler();
    Json(serde_json::json!({ "running": true, "started": started }))
}

/// POST /api/scheduler/stop
async fn stop_scheduler(State(state): State<ApiState>) -> impl IntoResponse {
    let stopped = state.engine.stop_scheduler();
    Json(serde_json::json!({ "running": false, "stopped": stopped }))
}

/// Build the full route tree. CORS is wide open; the dashboard is
/// served from a different origin in development.
pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{id}/messages", get(get_messages))
        .route("/api/send-message", post(send_message))
        .route("/api/scheduler/start", post(start_scheduler))
        .route("/api/scheduler/stop", post(stop_scheduler))
        .route("/webhook/sms", post(sms_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
