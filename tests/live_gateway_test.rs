//! 实时对练集成测试：WebSocket 网关、轮次连续性、轮数提示、对练定稿

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{harness, harness_with, question, script_pipeline};
use futures_util::{SinkExt, StreamExt};
use parole::config::AppConfig;
use parole::core::state::LiveStatus;
use parole::core::{CoachError, CreateSession, Phase};
use parole::gateway::{HubConfig, LiveClientMessage, LiveHub, LiveServerMessage};
use parole::llm::GenerationStep;
use parole::store::{TaskFilter, TaskStatus, TaskType};
use parole::Orchestrator;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn live_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.live.notice_turn = 2;
    cfg.live.warning_turn = 3;
    cfg.live.min_finalize_turns = 3;
    cfg.live.forced_min_turns = 1;
    cfg
}

async fn live_session(orch: &Orchestrator) -> i64 {
    let q = question(orch, "T2").await;
    let session = orch
        .create_session(CreateSession {
            question_id: q.id,
            draft: None,
        })
        .await
        .unwrap();
    orch.start_live_session(session.id).await.unwrap();
    session.id
}

async fn start_hub(orch: &Orchestrator) -> (LiveHub, SocketAddr) {
    let hub = LiveHub::new(
        HubConfig {
            bind_addr: "127.0.0.1:0".into(),
            max_connections: 8,
        },
        orch.live().clone(),
        CancellationToken::new(),
    );
    let addr = hub.start().await.unwrap();
    (hub, addr)
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, path))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, message: LiveClientMessage) {
    let text = serde_json::to_string(&message).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn say(ws: &mut Ws, text: &str) {
    send(
        ws,
        LiveClientMessage::CandidateTurn {
            text: text.into(),
            followup: None,
        },
    )
    .await;
}

/// 下一条文本消息；5 秒超时
async fn recv(ws: &mut Ws) -> LiveServerMessage {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = next {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_disconnected(hub: &LiveHub) {
    for _ in 0..100 {
        if hub.connection_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection was not released");
}

#[tokio::test]
async fn test_turn_gets_ack_then_reply() {
    let (orch, gen) = harness().await;
    let sid = live_session(&orch).await;
    let (hub, addr) = start_hub(&orch).await;

    gen.push(GenerationStep::LiveReply, json!({"text": "Pourquoi pensez-vous cela ?"}));
    let mut ws = connect(addr, &format!("/live/{}/stream", sid)).await;
    say(&mut ws, "Bonjour, je voudrais parler du télétravail.").await;

    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 1 });
    assert_eq!(
        recv(&mut ws).await,
        LiveServerMessage::ExaminerReply {
            turn: 1,
            text: "Pourquoi pensez-vous cela ?".into()
        }
    );
    assert_eq!(hub.session_connections(sid).await, 1);

    let turns = orch.list_live_turns(sid).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(
        turns[0].examiner_reply.as_deref(),
        Some("Pourquoi pensez-vous cela ?")
    );
    let tasks = orch
        .list_tasks(&TaskFilter {
            session_id: Some(sid),
            task_type: Some(TaskType::LiveReply),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Succeeded);
    assert_eq!(turns[0].meta["task_id"], tasks[0].id);

    hub.stop();
}

#[tokio::test]
async fn test_turn_index_continues_across_reconnect() {
    let (orch, gen) = harness().await;
    let sid = live_session(&orch).await;
    let (hub, addr) = start_hub(&orch).await;
    let path = format!("/live/{}/stream", sid);

    gen.push(GenerationStep::LiveReply, json!({"text": "D'accord."}))
        .push(GenerationStep::LiveReply, json!({"text": "Continuez."}));

    let mut ws = connect(addr, &path).await;
    say(&mut ws, "Premier tour.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 1 });
    recv(&mut ws).await;
    send(&mut ws, LiveClientMessage::Stop).await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Stopped);
    wait_disconnected(&hub).await;

    let session = orch.get_session(sid).await.unwrap();
    assert_eq!(
        session.progress_state.live.as_ref().unwrap().status,
        LiveStatus::Stopped
    );

    let mut ws = connect(addr, &path).await;
    say(&mut ws, "Deuxième tour.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 2 });
    recv(&mut ws).await;

    let session = orch.get_session(sid).await.unwrap();
    let live = session.progress_state.live.unwrap();
    assert_eq!(live.status, LiveStatus::Active);
    assert_eq!(live.last_turn_index, 2);

    hub.stop();
}

#[tokio::test]
async fn test_advisories_follow_turn_count() {
    let (orch, gen) = harness_with(live_config()).await;
    let sid = live_session(&orch).await;
    let (hub, addr) = start_hub(&orch).await;
    gen.push(GenerationStep::LiveReply, json!({"text": "Oui."}))
        .push_error(GenerationStep::LiveReply, "model unavailable")
        .push(GenerationStep::LiveReply, json!({"text": "Oui."}));

    let mut ws = connect(addr, &format!("/live/{}/stream", sid)).await;
    say(&mut ws, "Un.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 1 });
    assert!(matches!(recv(&mut ws).await, LiveServerMessage::ExaminerReply { turn: 1, .. }));

    say(&mut ws, "Deux.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 2 });
    assert!(matches!(recv(&mut ws).await, LiveServerMessage::Error { turn: Some(2), .. }));
    assert!(matches!(recv(&mut ws).await, LiveServerMessage::Notice { .. }));

    say(&mut ws, "Trois.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 3 });
    assert!(matches!(recv(&mut ws).await, LiveServerMessage::ExaminerReply { turn: 3, .. }));
    assert!(matches!(recv(&mut ws).await, LiveServerMessage::Warning { .. }));

    hub.stop();
}

#[tokio::test]
async fn test_reply_failure_keeps_connection_open() {
    let (orch, gen) = harness().await;
    let sid = live_session(&orch).await;
    let (hub, addr) = start_hub(&orch).await;

    gen.push_error(GenerationStep::LiveReply, "model unavailable")
        .push(GenerationStep::LiveReply, json!({"text": "Reprenons."}));

    let mut ws = connect(addr, &format!("/live/{}/stream", sid)).await;
    say(&mut ws, "Premier tour.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 1 });
    match recv(&mut ws).await {
        LiveServerMessage::Error { turn, message } => {
            assert_eq!(turn, Some(1));
            assert!(message.contains("model unavailable"));
        }
        other => panic!("expected error, got {:?}", other),
    }

    say(&mut ws, "Deuxième tour.").await;
    assert_eq!(recv(&mut ws).await, LiveServerMessage::Ack { turn: 2 });
    assert_eq!(
        recv(&mut ws).await,
        LiveServerMessage::ExaminerReply {
            turn: 2,
            text: "Reprenons.".into()
        }
    );

    let turns = orch.list_live_turns(sid).await.unwrap();
    assert!(turns[0].examiner_reply.is_none());
    assert!(turns[0].meta["error"].is_string());

    // 失败的回复可单独重试
    gen.push(GenerationStep::LiveReply, json!({"text": "Je vous écoute."}));
    let failed_task = turns[0].meta["task_id"].as_i64().unwrap();
    let retried = orch.retry_task(failed_task).await.unwrap();
    assert_eq!(retried.payload["turn_id"], turns[0].id);
    let turns = orch.list_live_turns(sid).await.unwrap();
    assert_eq!(turns[0].examiner_reply.as_deref(), Some("Je vous écoute."));
    assert!(turns[0].meta.get("error").is_none());

    hub.stop();
}

#[tokio::test]
async fn test_rejects_bad_path_and_non_live_session() {
    let (orch, _gen) = harness().await;
    let q = question(&orch, "T2").await;
    let draft = orch
        .create_session(CreateSession {
            question_id: q.id,
            draft: Some("Brouillon.".into()),
        })
        .await
        .unwrap();
    let (hub, addr) = start_hub(&orch).await;

    let mut ws = connect(addr, "/live/abc/stream").await;
    assert!(matches!(
        recv(&mut ws).await,
        LiveServerMessage::Error { turn: None, .. }
    ));

    let mut ws = connect(addr, &format!("/live/{}/stream", draft.id)).await;
    assert!(matches!(
        recv(&mut ws).await,
        LiveServerMessage::Error { turn: None, .. }
    ));
    assert_eq!(hub.connection_count().await, 0);

    hub.stop();
}

#[tokio::test]
async fn test_live_mode_requires_dialogue_question() {
    let (orch, _gen) = harness().await;
    let q = question(&orch, "T3").await;
    let session = orch
        .create_session(CreateSession {
            question_id: q.id,
            draft: None,
        })
        .await
        .unwrap();
    assert!(matches!(
        orch.start_live_session(session.id).await,
        Err(CoachError::InvalidPhase(_))
    ));
}

#[tokio::test]
async fn test_finalize_live_session_from_transcript() {
    let (orch, gen) = harness_with(live_config()).await;
    let sid = live_session(&orch).await;
    let live = orch.live();

    gen.push(GenerationStep::LiveReply, json!({"text": "Vous travaillez d'où ?"}));
    let turn = live
        .record_turn(sid, "Je télétravaille souvent.", Some("Et vous ?"))
        .await
        .unwrap();
    live.generate_reply(turn.id, None).await.unwrap();
    live.record_turn(sid, "De chez moi.", None).await.unwrap();

    assert!(matches!(
        orch.finalize_live_session(sid, false).await,
        Err(CoachError::NotReady(_))
    ));

    script_pipeline(&gen, "Candidat: Je télétravaille souvent.", "télétravailler");
    let outcome = orch.finalize_live_session(sid, true).await.unwrap();
    let text = &outcome.answer.text;
    assert!(text.contains("Candidat: Je télétravaille souvent."));
    assert!(text.contains("Examinateur: Vous travaillez d'où ?"));
    assert!(text.contains("Candidat: Et vous ?"));
    assert!(text.contains("Candidat: De chez moi."));

    let session = &outcome.session;
    assert_eq!(session.progress_state.phase, Phase::Learning);
    assert_eq!(
        session.progress_state.live.as_ref().unwrap().status,
        LiveStatus::Completed
    );
    let groups = orch.list_answer_groups(session.question_id).await.unwrap();
    assert_eq!(groups[0].group.dialogue_profile["source"], "live");

    // 定稿后不再接受发言
    assert!(matches!(
        live.record_turn(sid, "Encore ?", None).await,
        Err(CoachError::InvalidPhase(_))
    ));
}
