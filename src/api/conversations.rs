use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiResult, ApiState};
use crate::conversation::Message;
use crate::task::{FeedbackReceipt, TaskHandle};

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub helpful: bool,
}

/// Ordinal routes take `(conversation_id, message_id)`; a non-numeric id is a
/// validation error rather than axum's plain-text rejection.
type MessagePath = Result<Path<(String, i64)>, PathRejection>;

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct TruncateResponse {
    pub ok: bool,
    pub deleted: usize,
}

/// `POST /conversations/messages`: start a new conversation.
pub async fn submit_new(
    State(state): State<ApiState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskHandle>)> {
    let Json(request) = payload?;
    let handle = state
        .coordinator
        .submit(None, &request.content, request.user_id.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

/// `POST /conversations/{conversation_id}/messages`
pub async fn submit(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskHandle>)> {
    let Json(request) = payload?;
    let handle = state
        .coordinator
        .submit(Some(&conversation_id), &request.content, request.user_id.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn list_messages(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<MessagesResponse>> {
    let messages = state.coordinator.messages(&conversation_id).await?;
    Ok(Json(MessagesResponse { conversation_id, messages }))
}

pub async fn retry(
    State(state): State<ApiState>,
    path: MessagePath,
) -> ApiResult<(StatusCode, Json<TaskHandle>)> {
    let Path((conversation_id, message_id)) = path?;
    let handle = state.coordinator.retry(&conversation_id, message_id).await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn edit(
    State(state): State<ApiState>,
    path: MessagePath,
    payload: Result<Json<EditRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskHandle>)> {
    let Path((conversation_id, message_id)) = path?;
    let Json(request) = payload?;
    let handle = state
        .coordinator
        .edit(&conversation_id, message_id, &request.content)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn truncate_after(
    State(state): State<ApiState>,
    path: MessagePath,
) -> ApiResult<Json<TruncateResponse>> {
    let Path((conversation_id, message_id)) = path?;
    let deleted = state
        .coordinator
        .truncate_after(&conversation_id, message_id)
        .await?;
    Ok(Json(TruncateResponse { ok: true, deleted }))
}

pub async fn delete_conversation(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.coordinator.delete_conversation(&conversation_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `POST /conversations/{conversation_id}/messages/{message_id}/feedback`
pub async fn feedback(
    State(state): State<ApiState>,
    path: MessagePath,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> ApiResult<Json<FeedbackReceipt>> {
    let Path((conversation_id, message_id)) = path?;
    let Json(request) = payload?;
    let receipt = state
        .coordinator
        .feedback(&conversation_id, message_id, request.helpful)
        .await?;
    Ok(Json(receipt))
}
