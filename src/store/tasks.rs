//! Task 台账与 Conversation 审计记录

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{
    enum_col, json_col, json_text, now_ts, ts_col, Conversation, NewConversation, Task, TaskFilter,
    TaskScope, TaskStatus, TaskType,
};

fn task_from_row(row: &SqliteRow) -> Result<Task, sqlx::Error> {
    Ok(Task {
        id: row.try_get("id")?,
        task_type: enum_col(row, "type", TaskType::parse)?,
        status: enum_col(row, "status", TaskStatus::parse)?,
        payload: json_col(row, "payload")?,
        result_summary: json_col(row, "result_summary")?,
        error_message: row.try_get("error_message")?,
        session_id: row.try_get("session_id")?,
        answer_id: row.try_get("answer_id")?,
        created_at: ts_col(row, "created_at")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        task_id: row.try_get("task_id")?,
        purpose: row.try_get("purpose")?,
        messages: json_col(row, "messages")?,
        result: json_col(row, "result")?,
        model_name: row.try_get("model_name")?,
        latency_ms: row.try_get("latency_ms")?,
        created_at: ts_col(row, "created_at")?,
    })
}

pub async fn insert_task(
    conn: &mut SqliteConnection,
    task_type: TaskType,
    scope: TaskScope,
    payload: &Value,
) -> Result<Task, sqlx::Error> {
    let now = now_ts();
    let id = sqlx::query(
        "INSERT INTO tasks (type, status, payload, result_summary, session_id, answer_id, created_at, updated_at)
         VALUES (?, ?, ?, '{}', ?, ?, ?, ?)",
    )
    .bind(task_type.as_str())
    .bind(TaskStatus::Pending.as_str())
    .bind(json_text(payload)?)
    .bind(scope.session_id())
    .bind(scope.answer_id())
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_task(conn, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_task(conn: &mut SqliteConnection, id: i64) -> Result<Option<Task>, sqlx::Error> {
    sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| task_from_row(&row))
        .transpose()
}

/// 终结 pending Task：写入状态与结果摘要 / 错误信息。
/// Task 已不是 pending（例如调用期间被取消）时不做修改，返回 None。
pub async fn finish_task(
    conn: &mut SqliteConnection,
    id: i64,
    status: TaskStatus,
    result_summary: Option<&Value>,
    error_message: Option<&str>,
) -> Result<Option<Task>, sqlx::Error> {
    let summary = result_summary.map(json_text).transpose()?;
    let updated = sqlx::query(
        "UPDATE tasks
         SET status = ?, result_summary = COALESCE(?, result_summary), error_message = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(summary)
    .bind(error_message)
    .bind(now_ts())
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }
    get_task(conn, id).await
}

/// pending / failed → canceled，其余状态不做修改，返回 None
pub async fn cancel_task(conn: &mut SqliteConnection, id: i64) -> Result<Option<Task>, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE tasks SET status = 'canceled', updated_at = ?
         WHERE id = ? AND status IN ('pending', 'failed')",
    )
    .bind(now_ts())
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }
    get_task(conn, id).await
}

/// 按条件查询，新任务在前
pub async fn list_tasks(
    conn: &mut SqliteConnection,
    filter: &TaskFilter,
) -> Result<Vec<Task>, sqlx::Error> {
    let task_type = filter.task_type.map(|t| t.as_str());
    let status = filter.status.map(|s| s.as_str());
    sqlx::query(
        "SELECT * FROM tasks
         WHERE (?1 IS NULL OR session_id = ?1)
           AND (?2 IS NULL OR answer_id = ?2)
           AND (?3 IS NULL
                OR session_id IN (SELECT id FROM sessions WHERE question_id = ?3)
                OR answer_id IN (SELECT a.id FROM answers a
                                 JOIN answer_groups g ON g.id = a.answer_group_id
                                 WHERE g.question_id = ?3))
           AND (?4 IS NULL OR type = ?4)
           AND (?5 IS NULL OR status = ?5)
         ORDER BY id DESC
         LIMIT ?6",
    )
    .bind(filter.session_id)
    .bind(filter.answer_id)
    .bind(filter.question_id)
    .bind(task_type)
    .bind(status)
    .bind(filter.limit.unwrap_or(200))
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(task_from_row)
    .collect()
}

/// 是否已有 Task 以 retry_of 指向该 Task
pub async fn has_retry(conn: &mut SqliteConnection, task_id: i64) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM tasks WHERE json_extract(payload, '$.retry_of') = ?",
    )
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(n > 0)
}

pub async fn insert_conversation(
    conn: &mut SqliteConnection,
    new: &NewConversation,
) -> Result<Conversation, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO conversations (session_id, task_id, purpose, messages, result, model_name, latency_ms, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.session_id)
    .bind(new.task_id)
    .bind(&new.purpose)
    .bind(json_text(&new.messages)?)
    .bind(json_text(&new.result)?)
    .bind(&new.model_name)
    .bind(new.latency_ms)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    conversation_from_row(&row)
}

pub async fn list_conversations(
    conn: &mut SqliteConnection,
    session_id: Option<i64>,
    task_id: Option<i64>,
) -> Result<Vec<Conversation>, sqlx::Error> {
    sqlx::query(
        "SELECT * FROM conversations
         WHERE (?1 IS NULL OR session_id = ?1) AND (?2 IS NULL OR task_id = ?2)
         ORDER BY id",
    )
    .bind(session_id)
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(conversation_from_row)
    .collect()
}

/// 会话直接关联或经由其 Task 关联的对话
pub async fn conversations_for_session(
    conn: &mut SqliteConnection,
    session_id: i64,
) -> Result<Vec<Conversation>, sqlx::Error> {
    sqlx::query(
        "SELECT * FROM conversations
         WHERE session_id = ?1 OR task_id IN (SELECT id FROM tasks WHERE session_id = ?1)
         ORDER BY id",
    )
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(conversation_from_row)
    .collect()
}

pub async fn conversations_for_answer(
    conn: &mut SqliteConnection,
    answer_id: i64,
    session_ids: &[i64],
) -> Result<Vec<Conversation>, sqlx::Error> {
    let sessions = json_text(session_ids)?;
    sqlx::query(
        "SELECT * FROM conversations
         WHERE task_id IN (SELECT id FROM tasks WHERE answer_id = ?1)
            OR session_id IN (SELECT value FROM json_each(?2))
         ORDER BY id",
    )
    .bind(answer_id)
    .bind(sessions)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(conversation_from_row)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{catalog, sessions, DirectionPlan, NewQuestion, SessionType, Store};
    use crate::core::state::ProgressState;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_scope_and_retry_lookup() {
        let store = Store::in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        let q = catalog::insert_question(
            &mut conn,
            &NewQuestion {
                question_type: "T3".into(),
                title: "t".into(),
                body: String::new(),
                direction_plan: DirectionPlan::default(),
            },
        )
        .await
        .unwrap();
        let s = sessions::insert_session(&mut conn, q.id, SessionType::First, None, &ProgressState::new(None))
            .await
            .unwrap();

        let t1 = insert_task(&mut conn, TaskType::Eval, TaskScope::Session(s.id), &json!({}))
            .await
            .unwrap();
        assert_eq!(t1.status, TaskStatus::Pending);
        assert_eq!(t1.scope(), Some(TaskScope::Session(s.id)));
        assert!(!has_retry(&mut conn, t1.id).await.unwrap());

        let t2 = insert_task(
            &mut conn,
            TaskType::Eval,
            TaskScope::Session(s.id),
            &json!({"retry_of": t1.id}),
        )
        .await
        .unwrap();
        assert!(has_retry(&mut conn, t1.id).await.unwrap());

        let done = finish_task(&mut conn, t2.id, TaskStatus::Succeeded, Some(&json!({"score": 4})), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.result_summary["score"], 4);

        // 终态不会被再次覆盖
        let again = finish_task(&mut conn, t2.id, TaskStatus::Failed, None, Some("late"))
            .await
            .unwrap();
        assert!(again.is_none());
        assert!(cancel_task(&mut conn, t2.id).await.unwrap().is_none());

        let canceled = cancel_task(&mut conn, t1.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(finish_task(&mut conn, t1.id, TaskStatus::Succeeded, None, None)
            .await
            .unwrap()
            .is_none());

        let filter = TaskFilter {
            question_id: Some(q.id),
            status: Some(TaskStatus::Succeeded),
            ..Default::default()
        };
        let found = list_tasks(&mut conn, &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, t2.id);
    }

    #[tokio::test]
    async fn test_conversation_task_reference_is_unique() {
        let store = Store::in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        let q = catalog::insert_question(
            &mut conn,
            &NewQuestion {
                question_type: "T3".into(),
                title: "t".into(),
                body: String::new(),
                direction_plan: DirectionPlan::default(),
            },
        )
        .await
        .unwrap();
        let s = sessions::insert_session(&mut conn, q.id, SessionType::First, None, &ProgressState::new(None))
            .await
            .unwrap();
        let t = insert_task(&mut conn, TaskType::Eval, TaskScope::Session(s.id), &json!({}))
            .await
            .unwrap();
        let new = NewConversation {
            session_id: Some(s.id),
            task_id: Some(t.id),
            purpose: "eval".into(),
            messages: json!({}),
            result: json!({}),
            model_name: None,
            latency_ms: Some(3),
        };
        insert_conversation(&mut conn, &new).await.unwrap();
        assert!(insert_conversation(&mut conn, &new).await.is_err());
        assert_eq!(conversations_for_session(&mut conn, s.id).await.unwrap().len(), 1);
    }
}
