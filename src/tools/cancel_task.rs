use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CancelTaskParams {
    #[schemars(description = "Task id to cancel")]
    pub task_id: String,
}
