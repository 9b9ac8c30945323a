//! HTTP surface: submit messages, poll tasks, and rewrite conversations.
//!
//! Every error body has the shape `{"error": {"code": ..., "message": ...}}`.

pub mod conversations;
pub mod tasks;

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::error::CoordinatorError;
use crate::task::ConversationCoordinator;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<ConversationCoordinator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/conversations/messages", post(conversations::submit_new))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::list_messages).post(conversations::submit),
        )
        .route(
            "/conversations/{conversation_id}",
            delete(conversations::delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}",
            put(conversations::edit),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/retry",
            post(conversations::retry),
        )
        .route(
            "/conversations/{conversation_id}/messages/after/{message_id}",
            delete(conversations::truncate_after),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/feedback",
            post(conversations::feedback),
        )
        .route("/tasks/{task_id}", get(tasks::get_task))
        .route("/tasks/{task_id}/cancel", post(tasks::cancel_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "tracked_tasks": state.coordinator.tasks().len(),
    }))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// A [`CoordinatorError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CoordinatorError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(CoordinatorError::Validation(rejection.body_text()))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::ConversationBusy { .. } => StatusCode::CONFLICT,
            CoordinatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let CoordinatorError::Internal(e) = &self.0 {
            tracing::error!(error = %e, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code(),
                message: self.0.public_message(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
