//! 阶段状态机：驱动会话走完 draft → … → completed
//!
//! 每个步骤的执行分三段：
//! 1. 事务内校验前置阶段、标记 running、创建 pending Task；
//! 2. 事务外调用生成协作方（可能耗时数秒）；
//! 3. 事务内写 Conversation、推进阶段、终结 Task。
//!
//! 步骤间的串联（eval → compare → gap_highlight → refine）只在这里决定，
//! 单个步骤函数不知道下游步骤的存在。串联步骤失败只记日志，不影响主步骤的返回。

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqliteConnection;

use crate::config::AppConfig;
use crate::core::error::{CoachError, CoachResult};
use crate::core::ledger::{best_effort, timed, StepRecord, TaskLedger};
use crate::core::live::{render_transcript, LiveController};
use crate::core::pipeline::StructurePipeline;
use crate::core::state::{LiveState, LiveStatus, Phase, PhaseStatus, ProgressState, SessionMode, Stamped};
use crate::llm::schemas::*;
use crate::llm::{GenerationError, Generator};
use crate::store::{
    catalog, flashcards, live_turns, sessions, structure, tasks, Answer, AnswerGroup,
    AnswerGroupWithAnswers, Conversation, Flashcard, FlashcardEntity, LiveTurn, NewQuestion,
    ParagraphNode, Question, Session, SessionStatus, SessionType, Store, Task, TaskFilter,
    TaskScope, TaskStatus, TaskType,
};

// ---------------------------------------------------------------------------
// 请求 / 返回
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSession {
    pub question_id: i64,
    #[serde(default)]
    pub draft: Option<String>,
}

/// 定稿参数；全部可选
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinalizeRequest {
    /// 复用已有答案组；缺省时沿用对比结果，否则新建
    #[serde(default)]
    pub answer_group_id: Option<i64>,
    #[serde(default)]
    pub group_title: Option<String>,
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub answer_title: Option<String>,
    /// 缺省时依次取：实时对练记录、精修稿、草稿
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeOutcome {
    pub session: Session,
    pub answer: Answer,
    /// 结构拆解驱动器的 Task；驱动器失败时为 None（失败 Task 仍可在台账中查到）
    pub pipeline_task: Option<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionHistory {
    pub session: Session,
    pub tasks: Vec<Task>,
    pub conversations: Vec<Conversation>,
    pub live_turns: Vec<LiveTurn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerHistory {
    pub answer: Answer,
    pub group: AnswerGroupWithAnswers,
    pub sessions: Vec<Session>,
    pub tasks: Vec<Task>,
    pub conversations: Vec<Conversation>,
}

// ---------------------------------------------------------------------------
// 共享加载函数
// ---------------------------------------------------------------------------

pub(crate) async fn load_session(conn: &mut SqliteConnection, id: i64) -> CoachResult<Session> {
    sessions::get_session(conn, id)
        .await?
        .ok_or_else(|| CoachError::not_found("Session", id))
}

pub(crate) async fn load_question(conn: &mut SqliteConnection, id: i64) -> CoachResult<Question> {
    catalog::get_question(conn, id)
        .await?
        .ok_or_else(|| CoachError::not_found("Question", id))
}

pub(crate) async fn load_answer(conn: &mut SqliteConnection, id: i64) -> CoachResult<Answer> {
    catalog::get_answer(conn, id)
        .await?
        .ok_or_else(|| CoachError::not_found("Answer", id))
}

async fn load_group(conn: &mut SqliteConnection, id: i64) -> CoachResult<AnswerGroup> {
    catalog::get_answer_group(conn, id)
        .await?
        .ok_or_else(|| CoachError::not_found("AnswerGroup", id))
}

pub(crate) fn question_context(question: &Question, session: &Session) -> QuestionContext {
    QuestionContext {
        question_type: question.question_type.clone(),
        title: question.title.clone(),
        body: question.body.clone(),
        direction: session
            .progress_state
            .selected_direction
            .clone()
            .or_else(|| question.direction_plan.resolved_direction().map(String::from)),
    }
}

fn session_payload(session_id: i64, retry_of: Option<i64>) -> Value {
    match retry_of {
        Some(id) => json!({ "session_id": session_id, "retry_of": id }),
        None => json!({ "session_id": session_id }),
    }
}

fn draft_text(session: &Session) -> CoachResult<String> {
    session
        .user_answer_draft
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .ok_or_else(|| CoachError::NotReady(format!("session {} has an empty draft", session.id)))
}

/// 对比结果中的复用目标必须是候选之一；补齐缺失的另一个 id
fn resolve_compare(
    mut result: CompareResult,
    candidates: &[AnswerSummary],
) -> Result<CompareResult, GenerationError> {
    if result.decision == CompareDecision::NewGroup {
        result.matched_answer_group_id = None;
        result.matched_answer_id = None;
        return Ok(result);
    }
    let matched = candidates.iter().find(|c| {
        result.matched_answer_id == Some(c.answer_id)
            || (result.matched_answer_id.is_none()
                && result.matched_answer_group_id == Some(c.answer_group_id))
    });
    match matched {
        Some(c) => {
            result.matched_answer_group_id = Some(c.answer_group_id);
            result.matched_answer_id = Some(c.answer_id);
            Ok(result)
        }
        None => Err(GenerationError::InvalidOutput(format!(
            "reuse target (group {:?}, answer {:?}) is not an existing answer",
            result.matched_answer_group_id, result.matched_answer_id
        ))),
    }
}

fn is_reuse(task: &Task) -> bool {
    task.result_summary.get("decision").and_then(Value::as_str) == Some("reuse")
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    generator: Arc<dyn Generator>,
    ledger: TaskLedger,
    pipeline: StructurePipeline,
    live: LiveController,
}

impl Orchestrator {
    pub fn new(store: Store, generator: Arc<dyn Generator>, cfg: &AppConfig) -> Self {
        let ledger = TaskLedger::new(store.clone());
        let pipeline = StructurePipeline::new(
            store.clone(),
            generator.clone(),
            ledger.clone(),
            cfg.pipeline.chunk_min_coverage,
        );
        let live = LiveController::new(
            store.clone(),
            generator.clone(),
            ledger.clone(),
            cfg.live.clone(),
        );
        Self {
            store,
            generator,
            ledger,
            pipeline,
            live,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pipeline(&self) -> &StructurePipeline {
        &self.pipeline
    }

    pub fn live(&self) -> &LiveController {
        &self.live
    }

    // -----------------------------------------------------------------------
    // 题目与会话
    // -----------------------------------------------------------------------

    pub async fn create_question(&self, new: NewQuestion) -> CoachResult<Question> {
        if new.title.trim().is_empty() {
            return Err(CoachError::NotReady("question title is empty".into()));
        }
        let mut conn = self.store.acquire().await?;
        Ok(catalog::insert_question(&mut conn, &new).await?)
    }

    pub async fn get_question(&self, id: i64) -> CoachResult<Question> {
        let mut conn = self.store.acquire().await?;
        load_question(&mut conn, id).await
    }

    pub async fn list_answer_groups(&self, question_id: i64) -> CoachResult<Vec<AnswerGroupWithAnswers>> {
        let mut conn = self.store.acquire().await?;
        load_question(&mut conn, question_id).await?;
        Ok(catalog::list_answer_groups_with_answers(&mut conn, question_id).await?)
    }

    /// 题目必须已有推荐方向
    pub async fn create_session(&self, req: CreateSession) -> CoachResult<Session> {
        let mut conn = self.store.acquire().await?;
        let question = load_question(&mut conn, req.question_id).await?;
        let direction = question
            .direction_plan
            .resolved_direction()
            .ok_or_else(|| {
                CoachError::NotReady(format!(
                    "question {} has no recommended direction",
                    question.id
                ))
            })?
            .to_string();
        let progress = ProgressState::new(Some(direction));
        let session = sessions::insert_session(
            &mut conn,
            question.id,
            SessionType::First,
            req.draft.as_deref(),
            &progress,
        )
        .await?;
        tracing::info!(session_id = session.id, question_id = question.id, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, id: i64) -> CoachResult<Session> {
        let mut conn = self.store.acquire().await?;
        load_session(&mut conn, id).await
    }

    pub async fn list_sessions(&self, question_id: Option<i64>) -> CoachResult<Vec<Session>> {
        let mut conn = self.store.acquire().await?;
        Ok(sessions::list_sessions(&mut conn, question_id).await?)
    }

    /// 改写草稿：回到 draft 并丢弃缓存结果；已挂接答案后不可再改
    pub async fn update_draft(&self, session_id: i64, draft: String) -> CoachResult<Session> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        if session.answer_id.is_some() {
            return Err(CoachError::InvalidPhase(format!(
                "session {} already has an answer attached",
                session_id
            )));
        }
        if session.progress_state.phase_status == PhaseStatus::Running {
            return Err(CoachError::Conflict(format!(
                "session {} has a step running",
                session_id
            )));
        }
        session.progress_state.reset_to_draft()?;
        session.user_answer_draft = Some(draft);
        sessions::save_session(&mut tx, &session).await?;
        tx.commit().await?;
        Ok(session)
    }

    pub async fn delete_session(&self, session_id: i64, force: bool) -> CoachResult<()> {
        let mut tx = self.store.begin().await?;
        let session = load_session(&mut tx, session_id).await?;
        if let (Some(answer_id), false) = (session.answer_id, force) {
            return Err(CoachError::Conflict(format!(
                "session {} has answer {} attached, use force to delete",
                session_id, answer_id
            )));
        }
        sessions::delete_session(&mut tx, session_id).await?;
        tx.commit().await?;
        tracing::info!(session_id, force, "session deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 单步执行的公共部分
    // -----------------------------------------------------------------------

    /// 标记 running 并创建 pending Task；调用方负责提交事务
    async fn open_session_step(
        &self,
        conn: &mut SqliteConnection,
        session: &mut Session,
        task_type: TaskType,
        retry_of: Option<i64>,
    ) -> CoachResult<Task> {
        if session.progress_state.phase_status == PhaseStatus::Running {
            return Err(CoachError::Conflict(format!(
                "session {} has a step running",
                session.id
            )));
        }
        session.progress_state.begin_step();
        if session.status == SessionStatus::Draft {
            session.status = SessionStatus::InProgress;
        }
        sessions::save_session(&mut *conn, session).await?;
        self.ledger
            .open(
                conn,
                task_type,
                TaskScope::Session(session.id),
                session_payload(session.id, retry_of),
            )
            .await
    }

    fn record<C: Serialize>(&self, step: GenerationStep, ctx: &C, latency_ms: i64) -> CoachResult<StepRecord> {
        Ok(StepRecord {
            purpose: step.as_str(),
            messages: serde_json::to_value(ctx)?,
            latency_ms,
            model: self.generator.model_name(),
        })
    }

    /// 写回生成结果：`apply` 先校验阶段迁移再写入类型化结果，返回 result_summary
    async fn settle_session_step<T, F>(
        &self,
        session_id: i64,
        task: Task,
        record: StepRecord,
        outcome: Result<T, GenerationError>,
        apply: F,
    ) -> CoachResult<Task>
    where
        T: Serialize,
        F: FnOnce(&mut ProgressState, T) -> CoachResult<Value>,
    {
        let mut tx = self.store.begin().await?;
        let raw = match &outcome {
            Ok(output) => serde_json::to_value(output)?,
            Err(e) => json!({ "error": e.to_string() }),
        };
        // 调用期间 Task 被取消：会话状态已由取消方处理
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, &task, &record, raw.clone())
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }

        let mut session = load_session(&mut tx, session_id).await?;
        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                let message = e.to_string();
                session.progress_state.fail_step(&message);
                sessions::save_session(&mut tx, &session).await?;
                let done = self.ledger.fail(&mut tx, &task, &record, &message).await?;
                tx.commit().await?;
                return Err(CoachError::GenerationFailed {
                    task: Box::new(done),
                    message,
                });
            }
        };

        match apply(&mut session.progress_state, output) {
            Ok(summary) => {
                session.progress_state.finish_step();
                sessions::save_session(&mut tx, &session).await?;
                let done = self
                    .ledger
                    .succeed(&mut tx, &task, &record, raw, summary)
                    .await?;
                tx.commit().await?;
                Ok(done)
            }
            Err(e) => {
                // 调用期间阶段被改动（例如草稿被重置），结果作废
                let message = e.to_string();
                session.progress_state.fail_step(&message);
                sessions::save_session(&mut tx, &session).await?;
                self.ledger.fail(&mut tx, &task, &record, &message).await?;
                tx.commit().await?;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // 生成步骤（对外入口含串联）
    // -----------------------------------------------------------------------

    /// 评估草稿；题目已有答案组时尽力串联对比
    pub async fn run_eval(&self, session_id: i64) -> CoachResult<Task> {
        self.eval_and_follow(session_id, None).await
    }

    /// 对比已有答案组；判定复用时尽力串联差距分析
    pub async fn run_compare(&self, session_id: i64) -> CoachResult<Task> {
        self.compare_and_follow(session_id, None).await
    }

    /// 差距分析；尽力串联精修
    pub async fn run_gap_highlight(&self, session_id: i64) -> CoachResult<Task> {
        self.gap_and_follow(session_id, None).await
    }

    pub async fn run_refine_answer(&self, session_id: i64) -> CoachResult<Task> {
        self.refine_step(session_id, None).await
    }

    pub async fn run_compose(&self, session_id: i64) -> CoachResult<Task> {
        self.compose_step(session_id, None).await
    }

    async fn eval_and_follow(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let task = self.eval_step(session_id, retry_of).await?;
        if self.has_answer_groups(session_id).await? {
            best_effort("compare", self.compare_and_follow(session_id, None)).await?;
        }
        Ok(task)
    }

    async fn compare_and_follow(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let task = self.compare_step(session_id, retry_of).await?;
        if is_reuse(&task) {
            best_effort("gap_highlight", self.gap_and_follow(session_id, None)).await?;
        }
        Ok(task)
    }

    async fn gap_and_follow(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let task = self.gap_step(session_id, retry_of).await?;
        best_effort("refine", self.refine_step(session_id, None)).await?;
        Ok(task)
    }

    async fn has_answer_groups(&self, session_id: i64) -> CoachResult<bool> {
        let mut conn = self.store.acquire().await?;
        let session = load_session(&mut conn, session_id).await?;
        Ok(!catalog::list_answer_groups(&mut conn, session.question_id)
            .await?
            .is_empty())
    }

    async fn eval_step(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        session.progress_state.ensure_can_transition(Phase::AwaitEvalConfirm)?;
        let question = load_question(&mut tx, session.question_id).await?;
        let ctx = DraftContext {
            question: question_context(&question, &session),
            draft: draft_text(&session)?,
        };
        let task = self
            .open_session_step(&mut tx, &mut session, TaskType::Eval, retry_of)
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.evaluate(&ctx)).await;
        let record = self.record(GenerationStep::Evaluate, &ctx, latency_ms)?;
        self.settle_session_step(session_id, task, record, outcome, |state, result: EvalResult| {
            state.transition(Phase::AwaitEvalConfirm)?;
            let summary = json!({ "score": result.score, "feedback": result.feedback });
            state.last_eval = Some(Stamped::now(result));
            Ok(summary)
        })
        .await
    }

    /// 生成参考答案；不改变阶段
    async fn compose_step(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        if !session.progress_state.phase.is_pre_finalize() {
            return Err(CoachError::InvalidPhase(format!(
                "compose is not available at {}",
                session.progress_state.phase
            )));
        }
        let question = load_question(&mut tx, session.question_id).await?;
        let ctx = DraftContext {
            question: question_context(&question, &session),
            draft: session.user_answer_draft.clone().unwrap_or_default(),
        };
        let task = self
            .open_session_step(&mut tx, &mut session, TaskType::Compose, retry_of)
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.compose(&ctx)).await;
        let record = self.record(GenerationStep::Compose, &ctx, latency_ms)?;
        self.settle_session_step(session_id, task, record, outcome, |state, result: ComposeResult| {
            if !state.phase.is_pre_finalize() {
                return Err(CoachError::InvalidPhase(format!(
                    "session moved to {} while composing",
                    state.phase
                )));
            }
            let summary = json!({ "title": result.title, "chars": result.text.chars().count() });
            state.last_compose = Some(Stamped::now(result));
            Ok(summary)
        })
        .await
    }

    async fn compare_step(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        session.progress_state.ensure_can_transition(Phase::AwaitNewGroup)?;
        let question = load_question(&mut tx, session.question_id).await?;
        let candidates: Vec<AnswerSummary> =
            catalog::list_answer_groups_with_answers(&mut tx, question.id)
                .await?
                .into_iter()
                .filter_map(|g| {
                    let latest = g.answers.last()?;
                    Some(AnswerSummary {
                        answer_group_id: g.group.id,
                        answer_id: latest.id,
                        group_title: g.group.title.clone(),
                        text: latest.text.clone(),
                    })
                })
                .collect();
        let ctx = CompareContext {
            question: question_context(&question, &session),
            draft: draft_text(&session)?,
            candidates,
        };
        let task = self
            .open_session_step(&mut tx, &mut session, TaskType::Compare, retry_of)
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.compare(&ctx)).await;
        let record = self.record(GenerationStep::Compare, &ctx, latency_ms)?;
        let outcome = outcome.and_then(|r| resolve_compare(r, &ctx.candidates));
        self.settle_session_step(session_id, task, record, outcome, |state, result: CompareResult| {
            let next = match result.decision {
                CompareDecision::Reuse => Phase::GapHighlight,
                CompareDecision::NewGroup => Phase::AwaitNewGroup,
            };
            state.transition(next)?;
            state.selected_answer_group_id = result.matched_answer_group_id;
            let summary = serde_json::to_value(&result)?;
            state.last_compare = Some(Stamped::now(result));
            Ok(summary)
        })
        .await
    }

    /// 与对比命中的答案做差距分析
    async fn gap_step(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        session.progress_state.ensure_can_transition(Phase::Refine)?;
        let matched = session
            .progress_state
            .last_compare
            .as_ref()
            .filter(|c| c.value.decision == CompareDecision::Reuse)
            .and_then(|c| c.value.matched_answer_id)
            .ok_or_else(|| {
                CoachError::NotReady(format!(
                    "session {} has no reused answer to compare against",
                    session_id
                ))
            })?;
        let answer = load_answer(&mut tx, matched).await?;
        let group = load_group(&mut tx, answer.answer_group_id).await?;
        let question = load_question(&mut tx, session.question_id).await?;
        let ctx = GapContext {
            question: question_context(&question, &session),
            draft: draft_text(&session)?,
            reference: AnswerSummary {
                answer_group_id: group.id,
                answer_id: answer.id,
                group_title: group.title,
                text: answer.text,
            },
        };
        let task = self
            .open_session_step(&mut tx, &mut session, TaskType::GapHighlight, retry_of)
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.highlight_gaps(&ctx)).await;
        let record = self.record(GenerationStep::HighlightGaps, &ctx, latency_ms)?;
        self.settle_session_step(session_id, task, record, outcome, |state, result: GapHighlightResult| {
            state.transition(Phase::Refine)?;
            let summary = json!({
                "coverage_score": result.coverage_score,
                "missing_points": result.missing_points.len(),
                "extra_points": result.extra_points.len(),
                "language_issues": result.language_issues.len(),
            });
            state.last_gap_highlight = Some(Stamped::now(result));
            Ok(summary)
        })
        .await
    }

    async fn refine_step(&self, session_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        session.progress_state.ensure_can_transition(Phase::AwaitFinalize)?;
        let question = load_question(&mut tx, session.question_id).await?;
        let reference_text = match session
            .progress_state
            .last_compare
            .as_ref()
            .and_then(|c| c.value.matched_answer_id)
        {
            Some(id) => catalog::get_answer(&mut tx, id).await?.map(|a| a.text),
            None => None,
        };
        let state = &session.progress_state;
        let ctx = RefineContext {
            question: question_context(&question, &session),
            draft: draft_text(&session)?,
            eval: state.last_eval.as_ref().map(|s| s.value.clone()),
            gaps: state.last_gap_highlight.as_ref().map(|s| s.value.clone()),
            reference_text,
        };
        let task = self
            .open_session_step(&mut tx, &mut session, TaskType::Refine, retry_of)
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.refine(&ctx)).await;
        let record = self.record(GenerationStep::Refine, &ctx, latency_ms)?;
        self.settle_session_step(session_id, task, record, outcome, |state, result: RefineResult| {
            state.transition(Phase::AwaitFinalize)?;
            let summary = json!({
                "chars": result.refined_text.chars().count(),
                "notes": result.notes.len(),
            });
            state.last_refine = Some(Stamped::now(result));
            Ok(summary)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // 定稿与学习
    // -----------------------------------------------------------------------

    /// 创建（或复用）答案组与新版本答案，挂接到会话，然后尽力运行结构拆解
    pub async fn finalize(&self, session_id: i64, req: FinalizeRequest) -> CoachResult<FinalizeOutcome> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        let state = &session.progress_state;
        let allowed = matches!(state.phase, Phase::AwaitFinalize | Phase::AwaitNewGroup)
            || (state.is_live() && state.phase == Phase::Live);
        if !allowed {
            return Err(CoachError::InvalidPhase(format!(
                "cannot finalize at {}",
                state.phase
            )));
        }
        if state.phase_status == PhaseStatus::Running {
            return Err(CoachError::Conflict(format!(
                "session {} has a step running",
                session_id
            )));
        }
        let question = load_question(&mut tx, session.question_id).await?;

        let text = match req.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => text.to_string(),
            None => self.default_final_text(&mut tx, &session).await?,
        };
        if text.is_empty() {
            return Err(CoachError::NotReady(format!(
                "session {} has no text to finalize",
                session_id
            )));
        }

        let group = match req
            .answer_group_id
            .or(session.progress_state.selected_answer_group_id)
        {
            Some(group_id) => {
                let group = load_group(&mut tx, group_id).await?;
                if group.question_id != question.id {
                    return Err(CoachError::Conflict(format!(
                        "answer group {} belongs to question {}",
                        group.id, group.question_id
                    )));
                }
                group
            }
            None => {
                let title = req
                    .group_title
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .or_else(|| session.progress_state.last_compose.as_ref().map(|c| c.value.title.clone()))
                    .unwrap_or_else(|| question.title.clone());
                let slug = format!("{}-{}", question.question_type, question.id);
                let profile = if session.progress_state.is_live() {
                    json!({ "source": "live" })
                } else {
                    json!({})
                };
                catalog::insert_answer_group(
                    &mut tx,
                    question.id,
                    &slug,
                    &title,
                    req.descriptor.as_deref(),
                    &profile,
                )
                .await?
            }
        };

        let version = catalog::next_version_index(&mut tx, group.id).await?;
        let answer_title = req
            .answer_title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("{} v{}", group.title, version));
        let answer = catalog::insert_answer(&mut tx, group.id, version, &answer_title, &text).await?;

        let state = &mut session.progress_state;
        state.transition(Phase::StructurePipeline)?;
        state.finish_step();
        state.selected_answer_group_id = Some(group.id);
        if state.is_live() {
            state.set_live_status(LiveStatus::Completed);
        }
        session.answer_id = Some(answer.id);
        session.status = SessionStatus::InProgress;
        session.completed_at = None;
        sessions::save_session(&mut tx, &session).await?;
        tx.commit().await?;
        tracing::info!(
            session_id,
            answer_id = answer.id,
            group_id = group.id,
            version,
            "session finalized"
        );

        let pipeline_task = best_effort(
            "structure_pipeline",
            self.pipeline.run(answer.id, Some(session_id), None),
        )
        .await?;
        let session = self.get_session(session_id).await?;
        Ok(FinalizeOutcome {
            session,
            answer,
            pipeline_task,
        })
    }

    async fn default_final_text(&self, conn: &mut SqliteConnection, session: &Session) -> CoachResult<String> {
        if session.progress_state.is_live() {
            let turns = live_turns::list_turns(conn, session.id).await?;
            return Ok(render_transcript(&turns));
        }
        if let Some(refine) = &session.progress_state.last_refine {
            return Ok(refine.value.refined_text.trim().to_string());
        }
        Ok(session
            .user_answer_draft
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    pub async fn mark_learning_complete(&self, session_id: i64) -> CoachResult<Session> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        if session.progress_state.phase != Phase::Learning
            || session.progress_state.phase_status == PhaseStatus::Running
        {
            return Err(CoachError::InvalidPhase(format!(
                "session {} is at {} ({:?}), not an idle learning phase",
                session_id, session.progress_state.phase, session.progress_state.phase_status
            )));
        }
        session.progress_state.transition(Phase::Completed)?;
        session.progress_state.finish_step();
        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        sessions::save_session(&mut tx, &session).await?;
        tx.commit().await?;
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // 答案
    // -----------------------------------------------------------------------

    /// 仅允许删除组内最新版本；结构树、孤儿词条、答案级 Task 一并清理，会话解除挂接
    pub async fn delete_answer(&self, answer_id: i64) -> CoachResult<()> {
        let mut tx = self.store.begin().await?;
        let answer = load_answer(&mut tx, answer_id).await?;
        let latest = catalog::latest_answer(&mut tx, answer.answer_group_id).await?;
        if latest.map(|a| a.id) != Some(answer.id) {
            return Err(CoachError::Conflict(format!(
                "answer {} is not the latest version of group {}",
                answer_id, answer.answer_group_id
            )));
        }
        let orphans = structure::delete_answer_structure(&mut tx, answer_id).await?;
        structure::delete_orphan_lexemes(&mut tx, &orphans).await?;
        let detached = sessions::detach_answer(&mut tx, answer_id).await?;
        catalog::delete_answer(&mut tx, answer_id).await?;
        tx.commit().await?;
        tracing::info!(answer_id, detached, "answer deleted");
        Ok(())
    }

    /// 以已有答案为底稿开启复习会话
    pub async fn create_review_session(&self, answer_id: i64) -> CoachResult<Session> {
        let mut conn = self.store.acquire().await?;
        let answer = load_answer(&mut conn, answer_id).await?;
        let group = load_group(&mut conn, answer.answer_group_id).await?;
        let question = load_question(&mut conn, group.question_id).await?;
        let mut progress = ProgressState::new(
            question.direction_plan.resolved_direction().map(String::from),
        );
        progress.review_source_answer_id = Some(answer.id);
        Ok(sessions::insert_session(
            &mut conn,
            question.id,
            SessionType::Review,
            Some(&answer.text),
            &progress,
        )
        .await?)
    }

    pub async fn answer_tree(&self, answer_id: i64) -> CoachResult<Vec<ParagraphNode>> {
        let mut conn = self.store.acquire().await?;
        load_answer(&mut conn, answer_id).await?;
        Ok(structure::answer_tree(&mut conn, answer_id).await?)
    }

    // -----------------------------------------------------------------------
    // 实时对练
    // -----------------------------------------------------------------------

    /// 仅对话类（T2）题目可进入实时模式
    pub async fn start_live_session(&self, session_id: i64) -> CoachResult<Session> {
        let mut tx = self.store.begin().await?;
        let mut session = load_session(&mut tx, session_id).await?;
        let question = load_question(&mut tx, session.question_id).await?;
        if !question.is_dialogue() {
            return Err(CoachError::InvalidPhase(format!(
                "question {} is {}, live mode needs a dialogue question",
                question.id, question.question_type
            )));
        }
        session.progress_state.transition(Phase::Live)?;
        let last_turn_index = live_turns::list_turns(&mut tx, session_id)
            .await?
            .last()
            .map(|t| t.turn_index)
            .unwrap_or(0);
        let state = &mut session.progress_state;
        state.mode = SessionMode::Live;
        state.live = Some(match state.live.take() {
            Some(mut live) => {
                live.status = LiveStatus::Active;
                live.stopped_at = None;
                live.last_turn_index = last_turn_index;
                live
            }
            None => LiveState {
                status: LiveStatus::Active,
                started_at: Utc::now(),
                stopped_at: None,
                last_turn_index,
            },
        });
        session.status = SessionStatus::InProgress;
        sessions::save_session(&mut tx, &session).await?;
        tx.commit().await?;
        tracing::info!(session_id, "live session started");
        Ok(session)
    }

    /// 用对练记录定稿；轮数不足时拒绝（force 时放宽下限）
    pub async fn finalize_live_session(&self, session_id: i64, force: bool) -> CoachResult<FinalizeOutcome> {
        let turns = {
            let mut conn = self.store.acquire().await?;
            let session = load_session(&mut conn, session_id).await?;
            if !session.progress_state.is_live() || session.progress_state.phase != Phase::Live {
                return Err(CoachError::InvalidPhase(format!(
                    "session {} is not in live mode",
                    session_id
                )));
            }
            live_turns::list_turns(&mut conn, session_id).await?
        };
        let cfg = self.live.config();
        let required = if force {
            cfg.forced_min_turns
        } else {
            cfg.min_finalize_turns
        };
        if turns.len() < required {
            return Err(CoachError::NotReady(format!(
                "live session {} has {} turns, needs at least {}",
                session_id,
                turns.len(),
                required
            )));
        }
        let text = render_transcript(&turns);
        self.finalize(
            session_id,
            FinalizeRequest {
                text: Some(text),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn list_live_turns(&self, session_id: i64) -> CoachResult<Vec<LiveTurn>> {
        let mut conn = self.store.acquire().await?;
        load_session(&mut conn, session_id).await?;
        Ok(live_turns::list_turns(&mut conn, session_id).await?)
    }

    // -----------------------------------------------------------------------
    // 重试 / 取消
    // -----------------------------------------------------------------------

    /// 按原 Task 的类型重新派发，新 Task 的 payload 记录 retry_of
    pub async fn retry_task(&self, task_id: i64) -> CoachResult<Task> {
        let task = self.ledger.get(task_id).await?;
        if task.status == TaskStatus::Pending {
            return Err(CoachError::InvalidPhase(format!(
                "task {} is still pending",
                task_id
            )));
        }
        tracing::info!(task_id, task_type = %task.task_type, "retrying task");
        let retry_of = Some(task.id);
        let session_id = || {
            task.session_id
                .or_else(|| task.payload_i64("session_id"))
                .ok_or_else(|| CoachError::NotReady(format!("task {} has no session", task.id)))
        };
        let answer_id = || {
            task.answer_id
                .or_else(|| task.payload_i64("answer_id"))
                .ok_or_else(|| CoachError::NotReady(format!("task {} has no answer", task.id)))
        };
        let sentence_id = || {
            task.payload_i64("sentence_id")
                .ok_or_else(|| CoachError::NotReady(format!("task {} has no sentence", task.id)))
        };

        match task.task_type {
            TaskType::Eval => self.eval_and_follow(session_id()?, retry_of).await,
            TaskType::Compose => self.compose_step(session_id()?, retry_of).await,
            TaskType::Compare => self.compare_and_follow(session_id()?, retry_of).await,
            TaskType::GapHighlight => self.gap_and_follow(session_id()?, retry_of).await,
            TaskType::Refine => self.refine_step(session_id()?, retry_of).await,
            TaskType::StructurePipeline => {
                self.pipeline
                    .run(answer_id()?, task.session_id, retry_of)
                    .await
            }
            TaskType::Structure => self.pipeline.run_structure(answer_id()?, retry_of).await,
            TaskType::SentenceTranslate => self.pipeline.run_translate(answer_id()?, retry_of).await,
            TaskType::ChunkSentence => self.pipeline.run_chunk(sentence_id()?, retry_of).await,
            TaskType::ChunkLexeme => {
                self.pipeline
                    .run_chunk_lexemes(sentence_id()?, retry_of)
                    .await
            }
            TaskType::LiveReply => {
                let turn_id = task
                    .payload_i64("turn_id")
                    .ok_or_else(|| CoachError::NotReady(format!("task {} has no turn", task.id)))?;
                let (task, _) = self.live.generate_reply(turn_id, retry_of).await?;
                Ok(task)
            }
        }
    }

    pub async fn cancel_task(&self, task_id: i64) -> CoachResult<Task> {
        self.ledger.cancel(task_id).await
    }

    // -----------------------------------------------------------------------
    // 查询
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, task_id: i64) -> CoachResult<Task> {
        self.ledger.get(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> CoachResult<Vec<Task>> {
        let mut conn = self.store.acquire().await?;
        Ok(tasks::list_tasks(&mut conn, filter).await?)
    }

    pub async fn list_conversations(
        &self,
        session_id: Option<i64>,
        task_id: Option<i64>,
    ) -> CoachResult<Vec<Conversation>> {
        let mut conn = self.store.acquire().await?;
        Ok(tasks::list_conversations(&mut conn, session_id, task_id).await?)
    }

    pub async fn session_history(&self, session_id: i64) -> CoachResult<SessionHistory> {
        let mut conn = self.store.acquire().await?;
        let session = load_session(&mut conn, session_id).await?;
        let tasks = tasks::list_tasks(
            &mut conn,
            &TaskFilter {
                session_id: Some(session_id),
                ..Default::default()
            },
        )
        .await?;
        let conversations = tasks::conversations_for_session(&mut conn, session_id).await?;
        let live_turns = live_turns::list_turns(&mut conn, session_id).await?;
        Ok(SessionHistory {
            session,
            tasks,
            conversations,
            live_turns,
        })
    }

    pub async fn answer_history(&self, answer_id: i64) -> CoachResult<AnswerHistory> {
        let mut conn = self.store.acquire().await?;
        let answer = load_answer(&mut conn, answer_id).await?;
        let group = load_group(&mut conn, answer.answer_group_id).await?;
        let answers = catalog::list_answers(&mut conn, group.id).await?;
        let sessions = sessions::sessions_for_answer(&mut conn, answer_id).await?;
        let session_ids: Vec<i64> = sessions.iter().map(|s| s.id).collect();

        let mut tasks = tasks::list_tasks(
            &mut conn,
            &TaskFilter {
                answer_id: Some(answer_id),
                ..Default::default()
            },
        )
        .await?;
        for id in &session_ids {
            tasks.extend(
                tasks::list_tasks(
                    &mut conn,
                    &TaskFilter {
                        session_id: Some(*id),
                        ..Default::default()
                    },
                )
                .await?,
            );
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let conversations = tasks::conversations_for_answer(&mut conn, answer_id, &session_ids).await?;
        Ok(AnswerHistory {
            answer,
            group: AnswerGroupWithAnswers { group, answers },
            sessions,
            tasks,
            conversations,
        })
    }

    // -----------------------------------------------------------------------
    // 闪卡
    // -----------------------------------------------------------------------

    pub async fn due_flashcards(
        &self,
        entity_type: Option<FlashcardEntity>,
        limit: i64,
    ) -> CoachResult<Vec<Flashcard>> {
        let mut conn = self.store.acquire().await?;
        Ok(flashcards::list_due(&mut conn, entity_type, limit.clamp(1, 500)).await?)
    }

    pub async fn review_flashcard(&self, card_id: i64, score: i64) -> CoachResult<Flashcard> {
        if !(0..=5).contains(&score) {
            return Err(CoachError::NotReady(format!(
                "review score {} is outside 0-5",
                score
            )));
        }
        let mut conn = self.store.acquire().await?;
        flashcards::record_review(&mut conn, card_id, score)
            .await?
            .ok_or_else(|| CoachError::not_found("Flashcard", card_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(group: i64, answer: i64) -> AnswerSummary {
        AnswerSummary {
            answer_group_id: group,
            answer_id: answer,
            group_title: "g".into(),
            text: "t".into(),
        }
    }

    fn reuse(group: Option<i64>, answer: Option<i64>) -> CompareResult {
        CompareResult {
            decision: CompareDecision::Reuse,
            matched_answer_group_id: group,
            matched_answer_id: answer,
            reason: String::new(),
        }
    }

    #[test]
    fn test_resolve_fills_answer_from_group() {
        let resolved = resolve_compare(reuse(Some(2), None), &[candidate(1, 10), candidate(2, 20)]).unwrap();
        assert_eq!(resolved.matched_answer_id, Some(20));
    }

    #[test]
    fn test_resolve_rejects_unknown_target() {
        assert!(matches!(
            resolve_compare(reuse(Some(9), None), &[candidate(1, 10)]),
            Err(GenerationError::InvalidOutput(_))
        ));
        assert!(resolve_compare(reuse(None, None), &[]).is_err());
    }

    #[test]
    fn test_new_group_clears_matches() {
        let mut result = reuse(Some(1), Some(10));
        result.decision = CompareDecision::NewGroup;
        let resolved = resolve_compare(result, &[]).unwrap();
        assert!(resolved.matched_answer_group_id.is_none());
        assert!(resolved.matched_answer_id.is_none());
    }
}
