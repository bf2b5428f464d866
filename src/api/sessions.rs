//! 题目、会话与会话级步骤

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{ApiResult, AppState};
use crate::core::{CreateSession, FinalizeOutcome, FinalizeRequest, SessionHistory};
use crate::store::{AnswerGroupWithAnswers, LiveTurn, NewQuestion, Question, Session, Task};

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub question_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDraftRequest {
    pub draft: String,
}

type Created<T> = (StatusCode, Json<T>);

pub async fn create_question(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewQuestion>,
) -> ApiResult<Created<Question>> {
    let question = state.orchestrator.create_question(req).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

pub async fn get_question(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Question>> {
    Ok(Json(state.orchestrator.get_question(id).await?))
}

pub async fn list_answer_groups(
    State(state): State<Arc<AppState>>,
    Path(question_id): Path<i64>,
) -> ApiResult<Json<Vec<AnswerGroupWithAnswers>>> {
    Ok(Json(state.orchestrator.list_answer_groups(question_id).await?))
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSession>,
) -> ApiResult<Created<Session>> {
    let session = state.orchestrator.create_session(req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.orchestrator.list_sessions(query.question_id).await?))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.orchestrator.get_session(id).await?))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_session(id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_draft(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateDraftRequest>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.orchestrator.update_draft(id, req.draft).await?))
}

pub async fn run_eval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Created<Task>> {
    Ok((StatusCode::CREATED, Json(state.orchestrator.run_eval(id).await?)))
}

pub async fn run_compose(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Created<Task>> {
    Ok((StatusCode::CREATED, Json(state.orchestrator.run_compose(id).await?)))
}

pub async fn run_compare(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Created<Task>> {
    Ok((StatusCode::CREATED, Json(state.orchestrator.run_compare(id).await?)))
}

pub async fn run_gap_highlight(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Created<Task>> {
    Ok((
        StatusCode::CREATED,
        Json(state.orchestrator.run_gap_highlight(id).await?),
    ))
}

pub async fn run_refine(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Created<Task>> {
    Ok((
        StatusCode::CREATED,
        Json(state.orchestrator.run_refine_answer(id).await?),
    ))
}

pub async fn finalize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FinalizeRequest>,
) -> ApiResult<Json<FinalizeOutcome>> {
    Ok(Json(state.orchestrator.finalize(id, req).await?))
}

pub async fn complete_learning(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.orchestrator.mark_learning_complete(id).await?))
}

pub async fn start_live(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.orchestrator.start_live_session(id).await?))
}

pub async fn finalize_live(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<Json<FinalizeOutcome>> {
    Ok(Json(
        state
            .orchestrator
            .finalize_live_session(id, query.force)
            .await?,
    ))
}

pub async fn live_turns(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<LiveTurn>>> {
    Ok(Json(state.orchestrator.list_live_turns(id).await?))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SessionHistory>> {
    Ok(Json(state.orchestrator.session_history(id).await?))
}
