//! HTTP 接口（axum）
//!
//! 触发生成步骤的接口统一返回 201 + Task；步骤失败时返回对应状态码，body 中带失败的 Task 供重试。

mod answers;
mod sessions;
mod tasks;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::core::{CoachError, Orchestrator};

pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// 领域错误到 HTTP 响应的映射
#[derive(Debug)]
pub struct ApiError(pub CoachError);

impl From<CoachError> for ApiError {
    fn from(e: CoachError) -> Self {
        Self(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoachError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoachError::InvalidPhase(_) | CoachError::Conflict(_) | CoachError::Canceled { .. } => {
                StatusCode::CONFLICT
            }
            CoachError::NotReady(_) | CoachError::QualityGateRejected { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoachError::GenerationFailed { .. } => StatusCode::BAD_GATEWAY,
            CoachError::Storage(_) | CoachError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();
        let body = match &self.0 {
            CoachError::GenerationFailed { task, .. } | CoachError::Canceled { task } => {
                json!({ "error": message, "task": task })
            }
            CoachError::QualityGateRejected { task, issues } => {
                json!({ "error": message, "issues": issues, "task": task })
            }
            _ => json!({ "error": message }),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/questions", post(sessions::create_question))
        .route("/api/questions/:id", get(sessions::get_question))
        .route(
            "/api/answer-groups/by-question/:id",
            get(sessions::list_answer_groups),
        )
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/sessions/:id/draft", axum::routing::put(sessions::update_draft))
        .route("/api/sessions/:id/tasks/eval", post(sessions::run_eval))
        .route("/api/sessions/:id/tasks/compose", post(sessions::run_compose))
        .route("/api/sessions/:id/tasks/compare", post(sessions::run_compare))
        .route(
            "/api/sessions/:id/tasks/gap-highlight",
            post(sessions::run_gap_highlight),
        )
        .route("/api/sessions/:id/tasks/refine", post(sessions::run_refine))
        .route("/api/sessions/:id/finalize", post(sessions::finalize))
        .route(
            "/api/sessions/:id/complete-learning",
            post(sessions::complete_learning),
        )
        .route("/api/sessions/:id/live/start", post(sessions::start_live))
        .route("/api/sessions/:id/live/finalize", post(sessions::finalize_live))
        .route("/api/sessions/:id/live/turns", get(sessions::live_turns))
        .route("/api/sessions/:id/history", get(sessions::history))
        .route(
            "/api/answers/:id",
            axum::routing::delete(answers::delete_answer),
        )
        .route("/api/answers/:id/paragraphs", get(answers::paragraphs))
        .route("/api/answers/:id/history", get(answers::history))
        .route("/api/answers/:id/sessions", post(answers::create_review_session))
        .route("/api/answers/:id/tasks/structure", post(answers::run_structure))
        .route(
            "/api/answers/:id/tasks/translate-sentences",
            post(answers::run_translate),
        )
        .route("/api/answers/:id/tasks/pipeline", post(answers::run_pipeline))
        .route("/api/sentences/:id/tasks/chunks", post(answers::run_chunk))
        .route(
            "/api/sentences/:id/tasks/chunk-lexemes",
            post(answers::run_chunk_lexemes),
        )
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/:id", get(tasks::get_task))
        .route("/api/tasks/:id/retry", post(tasks::retry_task))
        .route("/api/tasks/:id/cancel", post(tasks::cancel_task))
        .route("/api/conversations", get(tasks::list_conversations))
        .route("/api/flashcards/due", get(tasks::due_flashcards))
        .route("/api/flashcards/:id/review", post(tasks::review_flashcard))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(CoachError::not_found("Session", 1)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(CoachError::InvalidPhase("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(CoachError::NotReady("x".into())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError(CoachError::Storage(sqlx::Error::RowNotFound)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
