//! 任务台账、审计记录与闪卡

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{ApiResult, AppState};
use crate::store::{Conversation, Flashcard, FlashcardEntity, Task, TaskFilter};

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub session_id: Option<i64>,
    pub task_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DueQuery {
    pub entity_type: Option<FlashcardEntity>,
    #[serde(default = "default_due_limit")]
    pub limit: i64,
}

fn default_due_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub score: i64,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.orchestrator.list_tasks(&filter).await?))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.get_task(id).await?))
}

pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.retry_task(id).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.cancel_task(id).await?))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Vec<Conversation>>> {
    Ok(Json(
        state
            .orchestrator
            .list_conversations(query.session_id, query.task_id)
            .await?,
    ))
}

pub async fn due_flashcards(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DueQuery>,
) -> ApiResult<Json<Vec<Flashcard>>> {
    Ok(Json(
        state
            .orchestrator
            .due_flashcards(query.entity_type, query.limit)
            .await?,
    ))
}

pub async fn review_flashcard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<Json<Flashcard>> {
    Ok(Json(state.orchestrator.review_flashcard(id, req.score).await?))
}
