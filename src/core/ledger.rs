//! Task 台账：每个编排步骤的生命周期记录
//!
//! 步骤创建时写入 pending；调用生成协作方后，Conversation 与 Task 终态在同一事务中写入。
//! 状态只允许 pending → {succeeded, failed, canceled}，另外 failed → canceled。
//! 终结只作用于 pending 的 Task：调用期间被取消的 Task 保持 canceled，迟到的结果只进审计。

use std::future::Future;
use std::time::Instant;

use serde_json::{json, Value};
use sqlx::SqliteConnection;

use crate::core::error::{CoachError, CoachResult};
use crate::core::state::PhaseStatus;
use crate::store::{
    self, sessions, tasks, NewConversation, Store, Task, TaskScope, TaskStatus, TaskType,
};

/// 一次生成调用的审计信息
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub purpose: &'static str,
    /// 渲染前的结构化上下文
    pub messages: Value,
    pub latency_ms: i64,
    pub model: String,
}

/// 计时执行一次生成调用
pub async fn timed<F: Future>(fut: F) -> (F::Output, i64) {
    let started = Instant::now();
    let out = fut.await;
    (out, started.elapsed().as_millis() as i64)
}

#[derive(Clone)]
pub struct TaskLedger {
    store: Store,
}

impl TaskLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// 新建 pending Task
    pub async fn open(
        &self,
        conn: &mut SqliteConnection,
        task_type: TaskType,
        scope: TaskScope,
        payload: Value,
    ) -> CoachResult<Task> {
        let task = tasks::insert_task(conn, task_type, scope, &payload).await?;
        tracing::debug!(task_id = task.id, task_type = %task_type, "task opened");
        Ok(task)
    }

    async fn write_conversation(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        record: &StepRecord,
        result: Value,
    ) -> CoachResult<()> {
        tasks::insert_conversation(
            conn,
            &NewConversation {
                session_id: task.session_id,
                task_id: Some(task.id),
                purpose: record.purpose.to_string(),
                messages: record.messages.clone(),
                result,
                model_name: Some(record.model.clone()),
                latency_ms: Some(record.latency_ms),
            },
        )
        .await?;
        Ok(())
    }

    /// 只终结 pending Task；已被取消则返回 Canceled，调用方的事务随之回滚
    async fn finish(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        status: TaskStatus,
        summary: Option<&Value>,
        error: Option<&str>,
    ) -> CoachResult<Task> {
        match tasks::finish_task(conn, task.id, status, summary, error).await? {
            Some(done) => Ok(done),
            None => {
                let current = tasks::get_task(conn, task.id)
                    .await?
                    .ok_or_else(|| CoachError::not_found("Task", task.id))?;
                Err(CoachError::canceled(current))
            }
        }
    }

    /// Task 已不是 pending 时返回其当前记录
    pub async fn settled(&self, conn: &mut SqliteConnection, task: &Task) -> CoachResult<Option<Task>> {
        let current = tasks::get_task(conn, task.id)
            .await?
            .ok_or_else(|| CoachError::not_found("Task", task.id))?;
        Ok((current.status != TaskStatus::Pending).then_some(current))
    }

    /// 调用返回前 Task 已被取消：只补写 Conversation，返回应交给调用方的 Canceled。
    /// 返回 Some 时调用方提交事务后直接返回，不再写业务数据。
    pub async fn discard_if_canceled(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        record: &StepRecord,
        result: Value,
    ) -> CoachResult<Option<CoachError>> {
        let Some(current) = self.settled(conn, task).await? else {
            return Ok(None);
        };
        self.write_conversation(
            conn,
            task,
            record,
            json!({ "discarded": format!("task {}", current.status), "result": result }),
        )
        .await?;
        tracing::info!(task_id = task.id, status = %current.status, "late result discarded");
        Ok(Some(CoachError::canceled(current)))
    }

    /// 成功：写 Conversation，result_summary 附带保存时间
    pub async fn succeed(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        record: &StepRecord,
        result: Value,
        summary: Value,
    ) -> CoachResult<Task> {
        self.write_conversation(conn, task, record, result).await?;
        let summary = stamp(summary);
        let done = self
            .finish(conn, task, TaskStatus::Succeeded, Some(&summary), None)
            .await?;
        tracing::info!(
            task_id = done.id,
            task_type = %done.task_type,
            latency_ms = record.latency_ms,
            "task succeeded"
        );
        Ok(done)
    }

    /// 生成失败：Conversation.result 记录 error
    pub async fn fail(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        record: &StepRecord,
        message: &str,
    ) -> CoachResult<Task> {
        self.write_conversation(conn, task, record, json!({ "error": message }))
            .await?;
        let done = self
            .finish(conn, task, TaskStatus::Failed, None, Some(message))
            .await?;
        tracing::warn!(task_id = done.id, task_type = %done.task_type, error = message, "task failed");
        Ok(done)
    }

    /// 质量门拒绝：Conversation.result 同时保留 error、issues 与原始输出
    pub async fn reject(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        record: &StepRecord,
        output: Value,
        issues: &[String],
    ) -> CoachResult<Task> {
        self.write_conversation(
            conn,
            task,
            record,
            json!({ "error": "quality gate rejected", "issues": issues, "output": output }),
        )
        .await?;
        let message = issues.join("; ");
        let done = self
            .finish(conn, task, TaskStatus::Failed, None, Some(&message))
            .await?;
        tracing::warn!(
            task_id = done.id,
            task_type = %done.task_type,
            issues = issues.len(),
            "quality gate rejected"
        );
        Ok(done)
    }

    /// 不经过生成协作方的终结（驱动器自身的 Task）
    pub async fn close(
        &self,
        conn: &mut SqliteConnection,
        task: &Task,
        status: TaskStatus,
        summary: Value,
        error: Option<&str>,
    ) -> CoachResult<Task> {
        let summary = stamp(summary);
        self.finish(conn, task, status, Some(&summary), error).await
    }

    pub async fn get(&self, task_id: i64) -> CoachResult<Task> {
        let mut conn = self.store.acquire().await?;
        tasks::get_task(&mut conn, task_id)
            .await?
            .ok_or_else(|| CoachError::not_found("Task", task_id))
    }

    /// 仅 pending / failed 且尚未被重试的 Task 可取消；不会中断进行中的调用，
    /// 调用返回后结果作废。取消 pending 的会话步骤时一并解除会话的 running 标记。
    pub async fn cancel(&self, task_id: i64) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = tasks::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| CoachError::not_found("Task", task_id))?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Failed) {
            return Err(CoachError::InvalidPhase(format!(
                "task {} is {} and cannot be canceled",
                task.id, task.status
            )));
        }
        if tasks::has_retry(&mut tx, task_id).await? {
            return Err(CoachError::Conflict(format!(
                "task {} has already been retried",
                task_id
            )));
        }
        let canceled = tasks::cancel_task(&mut tx, task_id).await?.ok_or_else(|| {
            CoachError::Conflict(format!("task {} was settled concurrently", task_id))
        })?;

        if task.status == TaskStatus::Pending && task.task_type != TaskType::LiveReply {
            if let Some(session_id) = task.session_id {
                if let Some(mut session) = sessions::get_session(&mut tx, session_id).await? {
                    if session.progress_state.phase_status == PhaseStatus::Running {
                        session
                            .progress_state
                            .fail_step(format!("task {} canceled", task_id));
                        sessions::save_session(&mut tx, &session).await?;
                        tracing::info!(task_id, session_id, "running step released");
                    }
                }
            }
        }
        tx.commit().await?;
        tracing::info!(task_id, "task canceled");
        Ok(canceled)
    }
}

/// 串联的非主步骤：步骤级失败（Task 已是终态）只记日志，其余错误照常传播
pub async fn best_effort<F>(step: &'static str, fut: F) -> CoachResult<Option<Task>>
where
    F: Future<Output = CoachResult<Task>>,
{
    match fut.await {
        Ok(task) => Ok(Some(task)),
        Err(e) if e.is_step_failure() => {
            tracing::warn!(step, error = %e, "chained step failed, swallowed");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// 在结果摘要中加入 saved_at；非对象值包进 value 字段
fn stamp(summary: Value) -> Value {
    let saved_at = store::now_ts();
    match summary {
        Value::Object(mut map) => {
            map.insert("saved_at".into(), Value::String(saved_at));
            Value::Object(map)
        }
        other => json!({ "value": other, "saved_at": saved_at }),
    }
}
