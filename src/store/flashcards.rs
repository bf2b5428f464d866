//! 闪卡调度：简单的翻倍间隔

use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{enum_col, fmt_ts, json_text, now_ts, ts_col, Flashcard, FlashcardEntity};

/// 间隔上限（天）
pub const MAX_INTERVAL_DAYS: i64 = 60;

fn card_from_row(row: &SqliteRow) -> Result<Flashcard, sqlx::Error> {
    Ok(Flashcard {
        id: row.try_get("id")?,
        entity_type: enum_col(row, "entity_type", FlashcardEntity::parse)?,
        entity_id: row.try_get("entity_id")?,
        last_score: row.try_get("last_score")?,
        due_at: ts_col(row, "due_at")?,
        streak: row.try_get("streak")?,
        interval_days: row.try_get("interval_days")?,
        updated_at: ts_col(row, "updated_at")?,
    })
}

/// 评分后的 (streak, interval_days)：≥3 视为记住
pub fn next_schedule(streak: i64, interval_days: i64, score: i64) -> (i64, i64) {
    if score >= 3 {
        (streak + 1, (interval_days.max(1) * 2).min(MAX_INTERVAL_DAYS))
    } else {
        (0, 1)
    }
}

/// 幂等：同一实体只有一张卡，新卡立即到期
pub async fn get_or_create(
    conn: &mut SqliteConnection,
    entity_type: FlashcardEntity,
    entity_id: i64,
) -> Result<Flashcard, sqlx::Error> {
    let now = now_ts();
    sqlx::query(
        "INSERT OR IGNORE INTO flashcards (entity_type, entity_id, due_at, streak, interval_days, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, 1, ?3, ?3)",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT * FROM flashcards WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_one(&mut *conn)
        .await?;
    card_from_row(&row)
}

pub async fn get_card(conn: &mut SqliteConnection, id: i64) -> Result<Option<Flashcard>, sqlx::Error> {
    sqlx::query("SELECT * FROM flashcards WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| card_from_row(&row))
        .transpose()
}

pub async fn list_due(
    conn: &mut SqliteConnection,
    entity_type: Option<FlashcardEntity>,
    limit: i64,
) -> Result<Vec<Flashcard>, sqlx::Error> {
    let entity = entity_type.map(|e| e.as_str());
    sqlx::query(
        "SELECT * FROM flashcards
         WHERE due_at <= ?1 AND (?2 IS NULL OR entity_type = ?2)
         ORDER BY due_at, id
         LIMIT ?3",
    )
    .bind(now_ts())
    .bind(entity)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(card_from_row)
    .collect()
}

pub async fn record_review(
    conn: &mut SqliteConnection,
    card_id: i64,
    score: i64,
) -> Result<Option<Flashcard>, sqlx::Error> {
    let Some(card) = get_card(conn, card_id).await? else {
        return Ok(None);
    };
    let (streak, interval) = next_schedule(card.streak, card.interval_days, score);
    let now = Utc::now();
    sqlx::query(
        "UPDATE flashcards
         SET last_score = ?, streak = ?, interval_days = ?, due_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(score)
    .bind(streak)
    .bind(interval)
    .bind(fmt_ts(now + Duration::days(interval)))
    .bind(fmt_ts(now))
    .bind(card_id)
    .execute(&mut *conn)
    .await?;
    get_card(conn, card_id).await
}

pub async fn delete_for_entities(
    conn: &mut SqliteConnection,
    entity_type: FlashcardEntity,
    entity_ids: &[i64],
) -> Result<(), sqlx::Error> {
    if entity_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "DELETE FROM flashcards WHERE entity_type = ? AND entity_id IN (SELECT value FROM json_each(?))",
    )
    .bind(entity_type.as_str())
    .bind(json_text(entity_ids)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
