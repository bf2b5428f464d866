//! 取消进行中的步骤：迟到结果作废、会话的 running 标记被解除

mod common;

use std::time::Duration;

use common::{harness, question};
use parole::core::{CoachError, CreateSession, Phase, PhaseStatus};
use parole::llm::GenerationStep;
use parole::store::{Task, TaskFilter, TaskStatus, TaskType};
use parole::Orchestrator;
use serde_json::json;

const DRAFT: &str = "Le télétravail réduit les trajets.";

async fn draft_session(orch: &Orchestrator) -> i64 {
    let q = question(orch, "T3").await;
    orch.create_session(CreateSession {
        question_id: q.id,
        draft: Some(DRAFT.to_string()),
    })
    .await
    .unwrap()
    .id
}

/// 等到会话出现 pending 的指定类型 Task
async fn pending_task(orch: &Orchestrator, session_id: i64, task_type: TaskType) -> Task {
    let filter = TaskFilter {
        session_id: Some(session_id),
        task_type: Some(task_type),
        status: Some(TaskStatus::Pending),
        ..Default::default()
    };
    for _ in 0..100 {
        if let Some(task) = orch.list_tasks(&filter).await.unwrap().into_iter().next() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no pending {} task", task_type);
}

#[tokio::test]
async fn test_late_result_after_cancel_is_discarded() {
    let (orch, gen) = harness().await;
    let sid = draft_session(&orch).await;

    let gate = gen.hold(GenerationStep::Evaluate);
    gen.push(GenerationStep::Evaluate, json!({"feedback": "Trop tard.", "score": 4}));
    let running = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run_eval(sid).await }
    });
    let task = pending_task(&orch, sid, TaskType::Eval).await;

    let canceled = orch.cancel_task(task.id).await.unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);

    gate.notify_one();
    match running.await.unwrap() {
        Err(CoachError::Canceled { task: current }) => {
            assert_eq!(current.id, task.id);
            assert_eq!(current.status, TaskStatus::Canceled);
        }
        other => panic!("expected Canceled, got {:?}", other.map(|t| t.status)),
    }

    let stored = orch.get_task(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Canceled);
    assert!(stored.result_summary.get("score").is_none());

    let session = orch.get_session(sid).await.unwrap();
    assert_eq!(session.progress_state.phase, Phase::Draft);
    assert!(session.progress_state.last_eval.is_none());
    assert_ne!(session.progress_state.phase_status, PhaseStatus::Running);

    // 迟到的输出只进审计
    let audit = orch.list_conversations(None, Some(task.id)).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].result["discarded"], "task canceled");
    assert_eq!(audit[0].result["result"]["score"], 4);
}

#[tokio::test]
async fn test_cancel_releases_abandoned_step() {
    let (orch, gen) = harness().await;
    let sid = draft_session(&orch).await;

    let gate = gen.hold(GenerationStep::Evaluate);
    let running = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run_eval(sid).await }
    });
    let task = pending_task(&orch, sid, TaskType::Eval).await;
    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    let session = orch.get_session(sid).await.unwrap();
    assert_eq!(session.progress_state.phase_status, PhaseStatus::Running);
    assert!(matches!(
        orch.run_eval(sid).await,
        Err(CoachError::Conflict(_))
    ));

    orch.cancel_task(task.id).await.unwrap();
    let session = orch.get_session(sid).await.unwrap();
    assert_eq!(session.progress_state.phase_status, PhaseStatus::Failed);
    assert!(session
        .progress_state
        .phase_error
        .as_deref()
        .unwrap()
        .contains("canceled"));

    let session = orch
        .update_draft(sid, "Le télétravail libère du temps.".into())
        .await
        .unwrap();
    assert_eq!(session.progress_state.phase, Phase::Draft);

    gate.notify_one();
    gen.push(GenerationStep::Evaluate, json!({"feedback": "ok", "score": 3}));
    let retried = orch.retry_task(task.id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Succeeded);
    assert_eq!(retried.payload["retry_of"], task.id);

    let session = orch.get_session(sid).await.unwrap();
    assert_eq!(session.progress_state.phase, Phase::AwaitEvalConfirm);
    assert_eq!(session.progress_state.phase_status, PhaseStatus::Idle);
}
