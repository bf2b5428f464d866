//! SQLite 持久化（sqlx）
//!
//! 每个函数接收 `&mut SqliteConnection`，调用方决定它运行在普通连接、事务还是 SAVEPOINT 中；
//! 一个步骤的所有写入放在同一个事务里提交。

pub mod catalog;
pub mod flashcards;
pub mod live_turns;
pub mod models;
pub mod sessions;
pub mod structure;
pub mod tasks;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

pub use models::*;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS questions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        question_type TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        direction_plan TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS answer_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
        slug TEXT NOT NULL,
        title TEXT NOT NULL,
        descriptor TEXT,
        dialogue_profile TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS answers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        answer_group_id INTEGER NOT NULL REFERENCES answer_groups(id) ON DELETE CASCADE,
        version_index INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        title TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (answer_group_id, version_index)
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
        answer_id INTEGER REFERENCES answers(id) ON DELETE SET NULL,
        session_type TEXT NOT NULL,
        status TEXT NOT NULL,
        user_answer_draft TEXT,
        progress_state TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        result_summary TEXT NOT NULL DEFAULT '{}',
        error_message TEXT,
        session_id INTEGER REFERENCES sessions(id) ON DELETE CASCADE,
        answer_id INTEGER REFERENCES answers(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK ((session_id IS NULL) <> (answer_id IS NULL))
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER REFERENCES sessions(id) ON DELETE CASCADE,
        task_id INTEGER UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
        purpose TEXT NOT NULL,
        messages TEXT NOT NULL DEFAULT '{}',
        result TEXT NOT NULL DEFAULT '{}',
        model_name TEXT,
        latency_ms INTEGER,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS live_turns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        turn_index INTEGER NOT NULL,
        candidate_query TEXT NOT NULL DEFAULT '',
        examiner_reply TEXT,
        candidate_followup TEXT,
        meta TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (session_id, turn_index)
    )",
    "CREATE TABLE IF NOT EXISTS paragraphs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        answer_id INTEGER NOT NULL REFERENCES answers(id) ON DELETE CASCADE,
        order_index INTEGER NOT NULL,
        role_label TEXT,
        summary TEXT,
        extra TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sentences (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        paragraph_id INTEGER NOT NULL REFERENCES paragraphs(id) ON DELETE CASCADE,
        order_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        translation_en TEXT,
        translation_zh TEXT,
        difficulty TEXT,
        extra TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sentence_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sentence_id INTEGER NOT NULL REFERENCES sentences(id) ON DELETE CASCADE,
        order_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        translation_en TEXT,
        translation_zh TEXT,
        chunk_type TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (sentence_id, order_index)
    )",
    "CREATE TABLE IF NOT EXISTS lexemes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        headword TEXT NOT NULL,
        sense_label TEXT,
        gloss TEXT,
        translation_en TEXT,
        translation_zh TEXT,
        pos_tags TEXT,
        difficulty TEXT,
        hash TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chunk_lexemes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chunk_id INTEGER NOT NULL REFERENCES sentence_chunks(id) ON DELETE CASCADE,
        lexeme_id INTEGER NOT NULL REFERENCES lexemes(id) ON DELETE CASCADE,
        order_index INTEGER NOT NULL,
        role TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (chunk_id, lexeme_id, order_index)
    )",
    "CREATE TABLE IF NOT EXISTS flashcards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        last_score INTEGER,
        due_at TEXT NOT NULL,
        streak INTEGER NOT NULL DEFAULT 0,
        interval_days INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (entity_type, entity_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_answer ON tasks(answer_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_question ON sessions(question_id)",
    "CREATE INDEX IF NOT EXISTS idx_paragraphs_answer ON paragraphs(answer_id)",
    "CREATE INDEX IF NOT EXISTS idx_sentences_paragraph ON sentences(paragraph_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunk_lexemes_lexeme ON chunk_lexemes(lexeme_id)",
    "CREATE INDEX IF NOT EXISTS idx_flashcards_due ON flashcards(due_at)",
];

/// 连接池句柄；克隆开销很小
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// 按连接串打开数据库并建表（幂等）
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 单连接内存库：连接一旦回收数据即丢失，因此禁用空闲回收
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// 行解码辅助
// ---------------------------------------------------------------------------

pub(crate) fn decode_err(message: impl Into<String>) -> sqlx::Error {
    sqlx::Error::Decode(message.into().into())
}

/// 固定格式的 UTC 时间串，保证按字典序比较即按时间比较
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    fmt_ts(Utc::now())
}

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| decode_err(format!("{}: {}", column, e)))
}

pub(crate) fn ts_col(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    parse_ts(column, &raw)
}

pub(crate) fn opt_ts_col(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| parse_ts(column, &r)).transpose()
}

pub(crate) fn json_col<T: DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| decode_err(format!("{}: {}", column, e)))
}

pub(crate) fn json_text<T: Serialize + ?Sized>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

pub(crate) fn enum_col<T>(
    row: &SqliteRow,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| decode_err(format!("{}: unknown value {}", column, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = fmt_ts(DateTime::parse_from_rfc3339("2024-01-01T00:00:09Z").unwrap().with_timezone(&Utc));
        let late = fmt_ts(DateTime::parse_from_rfc3339("2024-01-01T00:00:10.5Z").unwrap().with_timezone(&Utc));
        assert!(early < late);
        assert_eq!(early.len(), late.len());
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.init_tables().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert!(n >= 13);
    }
}
