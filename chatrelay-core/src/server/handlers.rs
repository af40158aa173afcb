use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{CoreResult, RelayError};
use crate::task::{SubmitResponse, TaskSnapshot};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OcrBody {
    #[serde(default)]
    pub image: Option<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> CoreResult<T> {
    payload
        .map(|Json(b)| b)
        .map_err(|e| RelayError::MessageFormat(e.body_text()))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /api/generate/submit
pub async fn submit(
    State(state): State<AppState>,
    payload: Result<Json<SubmitBody>, JsonRejection>,
) -> CoreResult<Json<SubmitResponse>> {
    let prompt = body(payload)?
        .prompt
        .ok_or_else(|| RelayError::MessageFormat("prompt is required".to_string()))?;
    Ok(Json(state.images.generate(&prompt).await?))
}

/// GET /api/generate/result/{task_id}
pub async fn result(State(state): State<AppState>, Path(task_id): Path<String>) -> Json<TaskSnapshot> {
    Json(state.images.poll(&task_id).await)
}

/// POST /api/ocr
pub async fn ocr(
    State(state): State<AppState>,
    payload: Result<Json<OcrBody>, JsonRejection>,
) -> CoreResult<Json<Value>> {
    let image = body(payload)?
        .image
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| RelayError::MessageFormat("image is required".to_string()))?;
    Ok(Json(state.ocr.recognize(&image).await?))
}
