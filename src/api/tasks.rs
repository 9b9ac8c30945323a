use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use super::ApiState;
use crate::task::TaskView;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// `false` when the task id is unknown or already evicted.
    pub ok: bool,
}

/// `GET /tasks/{task_id}`. Unknown ids answer 200 with `status: not_found`.
pub async fn get_task(State(state): State<ApiState>, Path(task_id): Path<String>) -> Json<TaskView> {
    Json(state.coordinator.get(&task_id))
}

pub async fn cancel_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse { ok: state.coordinator.cancel(&task_id) })
}
