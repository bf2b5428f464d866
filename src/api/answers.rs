//! 答案、结构拆解与句子级步骤

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::{ApiResult, AppState};
use crate::core::AnswerHistory;
use crate::store::{ParagraphNode, Session, Task};

pub async fn delete_answer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_answer(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn paragraphs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<ParagraphNode>>> {
    Ok(Json(state.orchestrator.answer_tree(id).await?))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AnswerHistory>> {
    Ok(Json(state.orchestrator.answer_history(id).await?))
}

pub async fn create_review_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.orchestrator.create_review_session(id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn run_structure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.pipeline().run_structure(id, None).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn run_translate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.pipeline().run_translate(id, None).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// 答案级驱动器（不推进会话阶段）
pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.pipeline().run(id, None, None).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn run_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.pipeline().run_chunk(id, None).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn run_chunk_lexemes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state
        .orchestrator
        .pipeline()
        .run_chunk_lexemes(id, None)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}
