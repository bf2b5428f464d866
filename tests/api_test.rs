//! HTTP 接口集成测试（tower oneshot，不监听端口）

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::{harness, script_pipeline};
use parole::api::{router, AppState};
use parole::llm::{GenerationStep, ScriptedGenerator};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app() -> (Router, Arc<ScriptedGenerator>) {
    let (orchestrator, gen) = harness().await;
    (router(Arc::new(AppState { orchestrator })), gen)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn create_session(app: &Router, draft: Option<&str>) -> i64 {
    let (status, question) = call(
        app,
        Method::POST,
        "/api/questions",
        Some(json!({
            "question_type": "T3",
            "title": "Le télétravail",
            "body": "Pour ou contre ?",
            "direction_plan": {"recommended": {"title": "Pour"}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, session) = call(
        app,
        Method::POST,
        "/api/sessions",
        Some(json!({"question_id": question["id"], "draft": draft})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    session["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app().await;
    let (status, body) = call(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_session_flow_over_http() {
    let (app, gen) = app().await;
    let draft = "Le télétravail réduit les trajets.";
    let sid = create_session(&app, Some(draft)).await;

    gen.push(GenerationStep::Evaluate, json!({"feedback": "Clair.", "score": 4}));
    let (status, task) = call(&app, Method::POST, &format!("/api/sessions/{}/tasks/eval", sid), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["type"], "eval");
    assert_eq!(task["status"], "succeeded");

    let (_, session) = call(&app, Method::GET, &format!("/api/sessions/{}", sid), None).await;
    assert_eq!(session["progress_state"]["phase"], "await_eval_confirm");
    assert_eq!(session["progress_state"]["last_eval"]["score"], 4);

    // 尚未到可定稿阶段
    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/finalize", sid),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("cannot finalize"));

    gen.push(GenerationStep::Compare, json!({"decision": "new_group"}));
    let (status, _) = call(&app, Method::POST, &format!("/api/sessions/{}/tasks/compare", sid), None).await;
    assert_eq!(status, StatusCode::CREATED);

    script_pipeline(&gen, draft, "trajet");
    let (status, outcome) = call(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/finalize", sid),
        Some(json!({"group_title": "Trajets"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["answer"]["version_index"], 1);
    assert_eq!(outcome["session"]["progress_state"]["phase"], "learning");
    assert_eq!(outcome["pipeline_task"]["status"], "succeeded");

    let answer_id = outcome["answer"]["id"].as_i64().unwrap();
    let (status, paragraphs) = call(
        &app,
        Method::GET,
        &format!("/api/answers/{}/paragraphs", answer_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paragraphs.as_array().unwrap().len(), 1);
    assert_eq!(paragraphs[0]["sentences"][0]["chunks"][0]["lexemes"][0]["lexeme"]["headword"], "trajet");

    let (_, tasks) = call(
        &app,
        Method::GET,
        &format!("/api/tasks?session_id={}&type=eval", sid),
        None,
    )
    .await;
    assert_eq!(tasks.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, &format!("/api/sessions/{}", sid), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/api/sessions/{}?force=true", sid),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_generation_failure_returns_task_for_retry() {
    let (app, gen) = app().await;
    let sid = create_session(&app, Some("Brouillon.")).await;

    gen.push_error(GenerationStep::Evaluate, "upstream 500");
    let (status, body) = call(&app, Method::POST, &format!("/api/sessions/{}/tasks/eval", sid), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["task"]["status"], "failed");
    let task_id = body["task"]["id"].as_i64().unwrap();

    let (_, audit) = call(
        &app,
        Method::GET,
        &format!("/api/conversations?task_id={}", task_id),
        None,
    )
    .await;
    assert_eq!(audit[0]["purpose"], "evaluate");
    assert!(audit[0]["result"]["error"].as_str().unwrap().contains("upstream 500"));

    gen.push(GenerationStep::Evaluate, json!({"feedback": "ok", "score": 2}));
    let (status, retried) = call(&app, Method::POST, &format!("/api/tasks/{}/retry", task_id), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(retried["payload"]["retry_of"], task_id);

    let (_, history) = call(&app, Method::GET, &format!("/api/sessions/{}/history", sid), None).await;
    assert_eq!(history["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(history["conversations"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_error_statuses() {
    let (app, _) = app().await;

    let (status, _) = call(&app, Method::GET, "/api/sessions/404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let sid = create_session(&app, None).await;
    let (status, _) = call(&app, Method::POST, &format!("/api/sessions/{}/tasks/eval", sid), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/flashcards/999/review",
        Some(json!({"score": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/flashcards/999/review",
        Some(json!({"score": 8})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // T3 题目不能进入实时模式
    let (status, _) = call(&app, Method::POST, &format!("/api/sessions/{}/live/start", sid), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
