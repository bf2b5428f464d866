//! 实时对练轮次：turn_index 每会话从 1 连续递增，跨重连不断号

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{json_col, json_text, now_ts, ts_col, LiveTurn};

fn turn_from_row(row: &SqliteRow) -> Result<LiveTurn, sqlx::Error> {
    Ok(LiveTurn {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        turn_index: row.try_get("turn_index")?,
        candidate_query: row.try_get("candidate_query")?,
        examiner_reply: row.try_get("examiner_reply")?,
        candidate_followup: row.try_get("candidate_followup")?,
        meta: json_col(row, "meta")?,
        created_at: ts_col(row, "created_at")?,
    })
}

/// 在同一条语句里分配下一个 turn_index 并写入
pub async fn insert_turn(
    conn: &mut SqliteConnection,
    session_id: i64,
    candidate_query: &str,
    candidate_followup: Option<&str>,
) -> Result<LiveTurn, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO live_turns (session_id, turn_index, candidate_query, candidate_followup, meta, created_at)
         SELECT ?1, COALESCE(MAX(turn_index), 0) + 1, ?2, ?3, '{}', ?4
         FROM live_turns WHERE session_id = ?1",
    )
    .bind(session_id)
    .bind(candidate_query)
    .bind(candidate_followup)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_turn(conn, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_turn(conn: &mut SqliteConnection, id: i64) -> Result<Option<LiveTurn>, sqlx::Error> {
    sqlx::query("SELECT * FROM live_turns WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| turn_from_row(&row))
        .transpose()
}

pub async fn list_turns(
    conn: &mut SqliteConnection,
    session_id: i64,
) -> Result<Vec<LiveTurn>, sqlx::Error> {
    sqlx::query("SELECT * FROM live_turns WHERE session_id = ? ORDER BY turn_index")
        .bind(session_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(turn_from_row)
        .collect()
}

/// 写入考官回复与 meta（成功时清除旧的错误信息）
pub async fn set_reply(
    conn: &mut SqliteConnection,
    id: i64,
    examiner_reply: &str,
    meta: &Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE live_turns SET examiner_reply = ?, meta = ? WHERE id = ?")
        .bind(examiner_reply)
        .bind(json_text(meta)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_meta(conn: &mut SqliteConnection, id: i64, meta: &Value) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE live_turns SET meta = ? WHERE id = ?")
        .bind(json_text(meta)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
