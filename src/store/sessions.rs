//! 会话读写；progress_state 整体以 JSON 存储

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{
    enum_col, fmt_ts, json_col, json_text, now_ts, opt_ts_col, ts_col, Session, SessionStatus,
    SessionType,
};
use crate::core::state::ProgressState;

fn session_from_row(row: &SqliteRow) -> Result<Session, sqlx::Error> {
    Ok(Session {
        id: row.try_get("id")?,
        question_id: row.try_get("question_id")?,
        answer_id: row.try_get("answer_id")?,
        session_type: enum_col(row, "session_type", SessionType::parse)?,
        status: enum_col(row, "status", SessionStatus::parse)?,
        user_answer_draft: row.try_get("user_answer_draft")?,
        progress_state: json_col(row, "progress_state")?,
        started_at: ts_col(row, "started_at")?,
        completed_at: opt_ts_col(row, "completed_at")?,
    })
}

pub async fn insert_session(
    conn: &mut SqliteConnection,
    question_id: i64,
    session_type: SessionType,
    draft: Option<&str>,
    progress: &ProgressState,
) -> Result<Session, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO sessions (question_id, session_type, status, user_answer_draft, progress_state, started_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(question_id)
    .bind(session_type.as_str())
    .bind(SessionStatus::Draft.as_str())
    .bind(draft)
    .bind(json_text(progress)?)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_session(conn, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_session(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| session_from_row(&row))
        .transpose()
}

pub async fn list_sessions(
    conn: &mut SqliteConnection,
    question_id: Option<i64>,
) -> Result<Vec<Session>, sqlx::Error> {
    sqlx::query("SELECT * FROM sessions WHERE (? IS NULL OR question_id = ?) ORDER BY id DESC")
        .bind(question_id)
        .bind(question_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(session_from_row)
        .collect()
}

/// 产出该答案或以其为复习来源的会话
pub async fn sessions_for_answer(
    conn: &mut SqliteConnection,
    answer_id: i64,
) -> Result<Vec<Session>, sqlx::Error> {
    sqlx::query(
        "SELECT * FROM sessions
         WHERE answer_id = ? OR json_extract(progress_state, '$.review_source_answer_id') = ?
         ORDER BY id",
    )
    .bind(answer_id)
    .bind(answer_id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(session_from_row)
    .collect()
}

/// 写回所有可变字段
pub async fn save_session(
    conn: &mut SqliteConnection,
    session: &Session,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sessions
         SET answer_id = ?, status = ?, user_answer_draft = ?, progress_state = ?, completed_at = ?
         WHERE id = ?",
    )
    .bind(session.answer_id)
    .bind(session.status.as_str())
    .bind(&session.user_answer_draft)
    .bind(json_text(&session.progress_state)?)
    .bind(session.completed_at.map(fmt_ts))
    .bind(session.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn detach_answer(conn: &mut SqliteConnection, answer_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE sessions SET answer_id = NULL WHERE answer_id = ?")
        .bind(answer_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Task / Conversation / LiveTurn 由外键级联删除
pub async fn delete_session(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
