//! 实时对练：逐轮记录考生发言，考官回复交给线程池生成
//!
//! 轮次号在数据库中按会话单调递增（断线重连不重置、不留空洞）。
//! 超过软阈值只提示，服务端从不主动断开。

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::config::LiveSection;
use crate::core::error::{CoachError, CoachResult};
use crate::core::ledger::{timed, StepRecord, TaskLedger};
use crate::core::orchestrator::{load_question, load_session, question_context};
use crate::core::state::{LiveStatus, Phase};
use crate::core::task_scheduler::ReplyWorkerPool;
use crate::llm::schemas::{GenerationStep, LiveExchange, LiveReplyContext};
use crate::llm::Generator;
use crate::store::{live_turns, sessions, LiveTurn, Session, Store, Task, TaskScope, TaskType};

/// 轮数达到阈值后推送给考生的提示
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    Notice(String),
    Warning(String),
}

/// 单个连接的收发节奏：等待回复期间不接受新的发言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    AwaitingReply { turn_index: i64 },
}

impl ConnectionState {
    pub fn can_accept_turn(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// 渲染对练记录为答案文本；空字段跳过
pub fn render_transcript(turns: &[LiveTurn]) -> String {
    let mut lines = Vec::new();
    for turn in turns {
        let candidate = turn.candidate_query.trim();
        if !candidate.is_empty() {
            lines.push(format!("Candidat: {}", candidate));
        }
        if let Some(reply) = turn.examiner_reply.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            lines.push(format!("Examinateur: {}", reply));
        }
        if let Some(followup) = turn
            .candidate_followup
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
        {
            lines.push(format!("Candidat: {}", followup));
        }
    }
    lines.join("\n")
}

#[derive(Clone)]
pub struct LiveController {
    store: Store,
    generator: Arc<dyn Generator>,
    ledger: TaskLedger,
    cfg: LiveSection,
    workers: ReplyWorkerPool,
}

impl LiveController {
    pub fn new(store: Store, generator: Arc<dyn Generator>, ledger: TaskLedger, cfg: LiveSection) -> Self {
        let workers = ReplyWorkerPool::new(cfg.reply_workers);
        Self {
            store,
            generator,
            ledger,
            cfg,
            workers,
        }
    }

    pub fn config(&self) -> &LiveSection {
        &self.cfg
    }

    pub fn workers(&self) -> &ReplyWorkerPool {
        &self.workers
    }

    fn ensure_live(session: &Session) -> CoachResult<()> {
        if session.progress_state.is_live() && session.progress_state.phase == Phase::Live {
            Ok(())
        } else {
            Err(CoachError::InvalidPhase(format!(
                "session {} is not in live mode",
                session.id
            )))
        }
    }

    /// 连接建立：会话必须处于实时模式；断线后重连恢复为 active
    pub async fn open(&self, session_id: i64) -> CoachResult<Session> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        Self::ensure_live(&session)?;
        if let Some(live) = session.progress_state.live.as_mut() {
            if live.status != LiveStatus::Active {
                live.status = LiveStatus::Active;
                live.stopped_at = None;
                sessions::save_session(&mut tx, &session).await?;
            }
        }
        tx.commit().await?;
        Ok(session)
    }

    /// 写入下一轮考生发言
    pub async fn record_turn(
        &self,
        session_id: i64,
        text: &str,
        followup: Option<&str>,
    ) -> CoachResult<LiveTurn> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoachError::NotReady("candidate turn text is empty".into()));
        }
        let followup = followup.map(str::trim).filter(|f| !f.is_empty());
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        Self::ensure_live(&session)?;
        let turn = live_turns::insert_turn(&mut tx, session_id, text, followup).await?;
        if let Some(live) = session.progress_state.live.as_mut() {
            live.last_turn_index = turn.turn_index;
        }
        sessions::save_session(&mut tx, &session).await?;
        tx.commit().await?;
        tracing::debug!(session_id, turn = turn.turn_index, "live turn recorded");
        Ok(turn)
    }

    /// 为某一轮生成考官回复；失败时错误写入该轮 meta，连接保持
    pub async fn generate_reply(&self, turn_id: i64, retry_of: Option<i64>) -> CoachResult<(Task, LiveTurn)> {
        let mut tx = self.store.begin().await?;
        let turn = live_turns::get_turn(&mut tx, turn_id)
            .await?
            .ok_or_else(|| CoachError::not_found("LiveTurn", turn_id))?;
        let session = load_session(&mut tx, turn.session_id).await?;
        let question = load_question(&mut tx, session.question_id).await?;
        let history = live_turns::list_turns(&mut tx, turn.session_id)
            .await?
            .into_iter()
            .filter(|t| t.turn_index < turn.turn_index)
            .map(|t| LiveExchange {
                candidate: t.candidate_query,
                examiner: t.examiner_reply,
                followup: t.candidate_followup,
            })
            .collect();
        let ctx = LiveReplyContext {
            question: question_context(&question, &session),
            history,
            candidate_query: turn.candidate_query.clone(),
            candidate_followup: turn.candidate_followup.clone(),
        };
        let mut payload = json!({
            "session_id": turn.session_id,
            "turn_id": turn.id,
            "turn_index": turn.turn_index,
        });
        if let (Some(id), Some(map)) = (retry_of, payload.as_object_mut()) {
            map.insert("retry_of".into(), json!(id));
        }
        let task = self
            .ledger
            .open(&mut tx, TaskType::LiveReply, TaskScope::Session(turn.session_id), payload)
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.live_reply(&ctx)).await;
        let record = StepRecord {
            purpose: GenerationStep::LiveReply.as_str(),
            messages: serde_json::to_value(&ctx)?,
            latency_ms,
            model: self.generator.model_name(),
        };

        let mut tx = self.store.begin().await?;
        let raw = match &outcome {
            Ok(reply) => serde_json::to_value(reply)?,
            Err(e) => json!({ "error": e.to_string() }),
        };
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, &task, &record, raw.clone())
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }
        match outcome {
            Ok(reply) => {
                let mut meta = turn.meta.clone();
                if let Some(map) = meta.as_object_mut() {
                    map.remove("error");
                    map.insert("task_id".into(), json!(task.id));
                    if !reply.meta.is_null() {
                        map.insert("reply".into(), reply.meta.clone());
                    }
                }
                live_turns::set_reply(&mut tx, turn.id, reply.text.trim(), &meta).await?;
                let done = self
                    .ledger
                    .succeed(
                        &mut tx,
                        &task,
                        &record,
                        raw,
                        json!({ "turn_index": turn.turn_index, "reply": reply.text.trim() }),
                    )
                    .await?;
                let updated = live_turns::get_turn(&mut tx, turn.id)
                    .await?
                    .ok_or_else(|| CoachError::not_found("LiveTurn", turn.id))?;
                tx.commit().await?;
                Ok((done, updated))
            }
            Err(e) => {
                let message = e.to_string();
                let mut meta = turn.meta.clone();
                if let Some(map) = meta.as_object_mut() {
                    map.insert("error".into(), json!(message));
                    map.insert("task_id".into(), json!(task.id));
                }
                live_turns::set_meta(&mut tx, turn.id, &meta).await?;
                let done = self.ledger.fail(&mut tx, &task, &record, &message).await?;
                tx.commit().await?;
                Err(CoachError::GenerationFailed {
                    task: Box::new(done),
                    message,
                })
            }
        }
    }

    /// 在线程池中生成回复，不阻塞调用方的读循环；池已关闭时得到 None
    pub fn spawn_reply(&self, turn_id: i64) -> JoinHandle<Option<CoachResult<(Task, LiveTurn)>>> {
        let this = self.clone();
        self.workers
            .spawn(async move { this.generate_reply(turn_id, None).await })
    }

    /// stop / 断线：标记为 stopped（已定稿的会话保持 completed）
    pub async fn stop(&self, session_id: i64) -> CoachResult<()> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        let active = session
            .progress_state
            .live
            .as_ref()
            .is_some_and(|l| l.status == LiveStatus::Active);
        if active {
            session.progress_state.set_live_status(LiveStatus::Stopped);
            sessions::save_session(&mut tx, &session).await?;
        }
        tx.commit().await?;
        tracing::info!(session_id, "live session stopped");
        Ok(())
    }

    /// 轮数提示：warning 优先于 notice
    pub fn advisory(&self, turn_index: i64) -> Option<Advisory> {
        if turn_index >= self.cfg.warning_turn {
            Some(Advisory::Warning(format!(
                "Tour {}: il est fortement recommandé de conclure l'échange maintenant.",
                turn_index
            )))
        } else if turn_index >= self.cfg.notice_turn {
            Some(Advisory::Notice(format!(
                "Tour {}: pensez à conclure bientôt.",
                turn_index
            )))
        } else {
            None
        }
    }
}
