use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::result::FinalResult;
use crate::models::work_item::{CardSubmission, Stage};
use crate::services::pipeline::{SubmitError, WorkStatus};

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub work_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CardStatusResponse {
    pub work_id: Uuid,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalResult>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

/// POST /api/v1/cards: enqueue one scanned card for identification.
pub async fn submit_card(
    State(state): State<AppState>,
    Json(submission): Json<CardSubmission>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    match state.pipeline.submit(submission) {
        Ok(work_id) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                work_id,
                status: Stage::Submitted.to_string(),
            }),
        )),
        Err(err @ SubmitError::Validation(_)) => Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())),
        Err(err @ SubmitError::QueueFull { .. }) => Err(api_error(StatusCode::TOO_MANY_REQUESTS, err.to_string())),
        Err(err @ SubmitError::NotAccepting) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string())),
    }
}

/// GET /api/v1/cards/{work_id}: stage of an in-flight card, or its final result.
pub async fn get_card(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> Result<Json<CardStatusResponse>, ApiError> {
    match state.pipeline.status(work_id) {
        Some(WorkStatus::InProgress(stage)) => {
            return Ok(Json(CardStatusResponse {
                work_id,
                stage,
                result: None,
            }))
        }
        Some(WorkStatus::Finished(result)) => return Ok(Json(finished(result))),
        None => {}
    }

    // Evicted from the in-memory window: fall back to the store.
    if let Some(pool) = &state.db {
        match queries::get_final_result(pool, work_id).await {
            Ok(Some(result)) => return Ok(Json(finished(result))),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(work_id = %work_id, error = %e, "Failed to load stored result");
                return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load result"));
            }
        }
    }

    Err(api_error(StatusCode::NOT_FOUND, format!("Unknown work id {work_id}")))
}

fn finished(result: FinalResult) -> CardStatusResponse {
    let stage = if result.is_terminal_failure() {
        Stage::Failed
    } else {
        Stage::Persisted
    };
    CardStatusResponse {
        work_id: result.work_id,
        stage,
        result: Some(result),
    }
}
