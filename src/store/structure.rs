//! 段落 → 句子 → 语块 → 词条 四级结构
//!
//! 删除函数返回「可能成为孤儿」的词条 id，调用方在同一事务内交给 `delete_orphan_lexemes`。
//! 被删除实体的闪卡一并清理。

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::flashcards;
use super::{
    json_col, json_text, now_ts, ChunkLexeme, ChunkLexemeNode, ChunkNode, FlashcardEntity, Lexeme,
    Paragraph, ParagraphNode, Sentence, SentenceChunk, SentenceNode,
};
use crate::llm::schemas::{ChunkCandidate, LexemeCandidate};

fn paragraph_from_row(row: &SqliteRow) -> Result<Paragraph, sqlx::Error> {
    Ok(Paragraph {
        id: row.try_get("id")?,
        answer_id: row.try_get("answer_id")?,
        order_index: row.try_get("order_index")?,
        role_label: row.try_get("role_label")?,
        summary: row.try_get("summary")?,
        extra: json_col(row, "extra")?,
    })
}

fn sentence_from_row(row: &SqliteRow) -> Result<Sentence, sqlx::Error> {
    Ok(Sentence {
        id: row.try_get("id")?,
        paragraph_id: row.try_get("paragraph_id")?,
        order_index: row.try_get("order_index")?,
        text: row.try_get("text")?,
        translation_en: row.try_get("translation_en")?,
        translation_zh: row.try_get("translation_zh")?,
        difficulty: row.try_get("difficulty")?,
        extra: json_col(row, "extra")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<SentenceChunk, sqlx::Error> {
    Ok(SentenceChunk {
        id: row.try_get("id")?,
        sentence_id: row.try_get("sentence_id")?,
        order_index: row.try_get("order_index")?,
        text: row.try_get("text")?,
        translation_en: row.try_get("translation_en")?,
        translation_zh: row.try_get("translation_zh")?,
        chunk_type: row.try_get("chunk_type")?,
    })
}

fn lexeme_from_row(row: &SqliteRow) -> Result<Lexeme, sqlx::Error> {
    Ok(Lexeme {
        id: row.try_get("id")?,
        headword: row.try_get("headword")?,
        sense_label: row.try_get("sense_label")?,
        gloss: row.try_get("gloss")?,
        translation_en: row.try_get("translation_en")?,
        translation_zh: row.try_get("translation_zh")?,
        pos_tags: row.try_get("pos_tags")?,
        difficulty: row.try_get("difficulty")?,
        hash: row.try_get("hash")?,
    })
}

async fn ids(conn: &mut SqliteConnection, sql: &str, key: i64) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query(sql)
        .bind(key)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>(0))
        .collect()
}

// ---------------------------------------------------------------------------
// 段落 / 句子
// ---------------------------------------------------------------------------

/// 删除答案的整棵结构树，返回孤儿词条候选
pub async fn delete_answer_structure(
    conn: &mut SqliteConnection,
    answer_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let candidates = ids(
        conn,
        "SELECT DISTINCT cl.lexeme_id FROM chunk_lexemes cl
         JOIN sentence_chunks c ON c.id = cl.chunk_id
         JOIN sentences s ON s.id = c.sentence_id
         JOIN paragraphs p ON p.id = s.paragraph_id
         WHERE p.answer_id = ?",
        answer_id,
    )
    .await?;
    let chunk_ids = ids(
        conn,
        "SELECT c.id FROM sentence_chunks c
         JOIN sentences s ON s.id = c.sentence_id
         JOIN paragraphs p ON p.id = s.paragraph_id
         WHERE p.answer_id = ?",
        answer_id,
    )
    .await?;
    let sentence_ids = ids(
        conn,
        "SELECT s.id FROM sentences s JOIN paragraphs p ON p.id = s.paragraph_id WHERE p.answer_id = ?",
        answer_id,
    )
    .await?;

    flashcards::delete_for_entities(conn, FlashcardEntity::Chunk, &chunk_ids).await?;
    flashcards::delete_for_entities(conn, FlashcardEntity::Sentence, &sentence_ids).await?;

    sqlx::query("DELETE FROM paragraphs WHERE answer_id = ?")
        .bind(answer_id)
        .execute(&mut *conn)
        .await?;
    Ok(candidates)
}

pub async fn insert_paragraph(
    conn: &mut SqliteConnection,
    answer_id: i64,
    order_index: i64,
    role_label: Option<&str>,
    summary: Option<&str>,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO paragraphs (answer_id, order_index, role_label, summary, extra, created_at)
         VALUES (?, ?, ?, ?, '{}', ?)",
    )
    .bind(answer_id)
    .bind(order_index)
    .bind(role_label)
    .bind(summary)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_sentence(
    conn: &mut SqliteConnection,
    paragraph_id: i64,
    order_index: i64,
    text: &str,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO sentences (paragraph_id, order_index, text, extra, created_at)
         VALUES (?, ?, ?, '{}', ?)",
    )
    .bind(paragraph_id)
    .bind(order_index)
    .bind(text)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_paragraphs(
    conn: &mut SqliteConnection,
    answer_id: i64,
) -> Result<Vec<Paragraph>, sqlx::Error> {
    sqlx::query("SELECT * FROM paragraphs WHERE answer_id = ? ORDER BY order_index, id")
        .bind(answer_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(paragraph_from_row)
        .collect()
}

/// 答案的全部句子，按段落顺序再按句内顺序
pub async fn list_sentences_for_answer(
    conn: &mut SqliteConnection,
    answer_id: i64,
) -> Result<Vec<Sentence>, sqlx::Error> {
    sqlx::query(
        "SELECT s.* FROM sentences s JOIN paragraphs p ON p.id = s.paragraph_id
         WHERE p.answer_id = ?
         ORDER BY p.order_index, p.id, s.order_index, s.id",
    )
    .bind(answer_id)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(sentence_from_row)
    .collect()
}

pub async fn list_sentences(
    conn: &mut SqliteConnection,
    paragraph_id: i64,
) -> Result<Vec<Sentence>, sqlx::Error> {
    sqlx::query("SELECT * FROM sentences WHERE paragraph_id = ? ORDER BY order_index, id")
        .bind(paragraph_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(sentence_from_row)
        .collect()
}

pub async fn get_sentence(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Sentence>, sqlx::Error> {
    sqlx::query("SELECT * FROM sentences WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| sentence_from_row(&row))
        .transpose()
}

pub async fn answer_id_for_sentence(
    conn: &mut SqliteConnection,
    sentence_id: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT p.answer_id FROM sentences s JOIN paragraphs p ON p.id = s.paragraph_id WHERE s.id = ?",
    )
    .bind(sentence_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|r| r.try_get("answer_id")).transpose()
}

pub async fn update_sentence_translation(
    conn: &mut SqliteConnection,
    id: i64,
    translation_en: Option<&str>,
    translation_zh: Option<&str>,
    difficulty: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sentences
         SET translation_en = COALESCE(?, translation_en),
             translation_zh = COALESCE(?, translation_zh),
             difficulty = COALESCE(?, difficulty)
         WHERE id = ?",
    )
    .bind(translation_en)
    .bind(translation_zh)
    .bind(difficulty)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn update_sentence_extra(
    conn: &mut SqliteConnection,
    id: i64,
    extra: &Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sentences SET extra = ? WHERE id = ?")
        .bind(json_text(extra)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 语块
// ---------------------------------------------------------------------------

pub async fn list_chunks(
    conn: &mut SqliteConnection,
    sentence_id: i64,
) -> Result<Vec<SentenceChunk>, sqlx::Error> {
    sqlx::query("SELECT * FROM sentence_chunks WHERE sentence_id = ? ORDER BY order_index")
        .bind(sentence_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(chunk_from_row)
        .collect()
}

/// 删除句子的语块（级联其词条关联），返回孤儿词条候选
pub async fn delete_sentence_chunks(
    conn: &mut SqliteConnection,
    sentence_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let candidates = delete_sentence_chunk_lexemes(conn, sentence_id).await?;
    let chunk_ids = ids(
        conn,
        "SELECT id FROM sentence_chunks WHERE sentence_id = ?",
        sentence_id,
    )
    .await?;
    flashcards::delete_for_entities(conn, FlashcardEntity::Chunk, &chunk_ids).await?;
    sqlx::query("DELETE FROM sentence_chunks WHERE sentence_id = ?")
        .bind(sentence_id)
        .execute(&mut *conn)
        .await?;
    Ok(candidates)
}

pub async fn insert_chunk(
    conn: &mut SqliteConnection,
    sentence_id: i64,
    order_index: i64,
    candidate: &ChunkCandidate,
) -> Result<SentenceChunk, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO sentence_chunks (sentence_id, order_index, text, translation_en, translation_zh, chunk_type, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(sentence_id)
    .bind(order_index)
    .bind(candidate.text.trim())
    .bind(&candidate.translation_en)
    .bind(&candidate.translation_zh)
    .bind(&candidate.chunk_type)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let row = sqlx::query("SELECT * FROM sentence_chunks WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    chunk_from_row(&row)
}

// ---------------------------------------------------------------------------
// 词条
// ---------------------------------------------------------------------------

/// 删除句子所有语块的词条关联，返回孤儿词条候选
pub async fn delete_sentence_chunk_lexemes(
    conn: &mut SqliteConnection,
    sentence_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let candidates = ids(
        conn,
        "SELECT DISTINCT cl.lexeme_id FROM chunk_lexemes cl
         JOIN sentence_chunks c ON c.id = cl.chunk_id
         WHERE c.sentence_id = ?",
        sentence_id,
    )
    .await?;
    sqlx::query(
        "DELETE FROM chunk_lexemes
         WHERE chunk_id IN (SELECT id FROM sentence_chunks WHERE sentence_id = ?)",
    )
    .bind(sentence_id)
    .execute(&mut *conn)
    .await?;
    Ok(candidates)
}

pub async fn find_lexeme_by_hash(
    conn: &mut SqliteConnection,
    hash: &str,
) -> Result<Option<Lexeme>, sqlx::Error> {
    sqlx::query("SELECT * FROM lexemes WHERE hash = ?")
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| lexeme_from_row(&row))
        .transpose()
}

/// 按哈希去重：已存在则补齐缺失字段后返回，否则新建
pub async fn upsert_lexeme(
    conn: &mut SqliteConnection,
    hash: &str,
    candidate: &LexemeCandidate,
) -> Result<Lexeme, sqlx::Error> {
    let now = now_ts();
    sqlx::query(
        "INSERT INTO lexemes (headword, sense_label, gloss, translation_en, translation_zh, pos_tags, difficulty, hash, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(hash) DO UPDATE SET
             gloss = COALESCE(lexemes.gloss, excluded.gloss),
             translation_en = COALESCE(lexemes.translation_en, excluded.translation_en),
             translation_zh = COALESCE(lexemes.translation_zh, excluded.translation_zh),
             pos_tags = COALESCE(lexemes.pos_tags, excluded.pos_tags),
             difficulty = COALESCE(lexemes.difficulty, excluded.difficulty),
             updated_at = excluded.updated_at",
    )
    .bind(candidate.headword.trim())
    .bind(&candidate.sense_label)
    .bind(&candidate.gloss)
    .bind(&candidate.translation_en)
    .bind(&candidate.translation_zh)
    .bind(&candidate.pos_tags)
    .bind(&candidate.difficulty)
    .bind(hash)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    find_lexeme_by_hash(conn, hash)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn insert_chunk_lexeme(
    conn: &mut SqliteConnection,
    chunk_id: i64,
    lexeme_id: i64,
    order_index: i64,
    role: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO chunk_lexemes (chunk_id, lexeme_id, order_index, role, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(chunk_id)
    .bind(lexeme_id)
    .bind(order_index)
    .bind(role)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// 删除候选中已无任何 ChunkLexeme 引用的词条，返回删除数
pub async fn delete_orphan_lexemes(
    conn: &mut SqliteConnection,
    candidates: &[i64],
) -> Result<u64, sqlx::Error> {
    if candidates.is_empty() {
        return Ok(0);
    }
    let orphans: Vec<i64> = sqlx::query(
        "SELECT l.id FROM lexemes l
         WHERE l.id IN (SELECT value FROM json_each(?))
           AND NOT EXISTS (SELECT 1 FROM chunk_lexemes cl WHERE cl.lexeme_id = l.id)",
    )
    .bind(json_text(candidates)?)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|row| row.try_get::<i64, _>(0))
    .collect::<Result<_, _>>()?;

    if orphans.is_empty() {
        return Ok(0);
    }
    flashcards::delete_for_entities(conn, FlashcardEntity::Lexeme, &orphans).await?;
    let result = sqlx::query("DELETE FROM lexemes WHERE id IN (SELECT value FROM json_each(?))")
        .bind(json_text(&orphans)?)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn lexeme_reference_count(
    conn: &mut SqliteConnection,
    lexeme_id: i64,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM chunk_lexemes WHERE lexeme_id = ?")
        .bind(lexeme_id)
        .fetch_one(&mut *conn)
        .await?;
    row.try_get("n")
}

pub async fn count_lexemes(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM lexemes")
        .fetch_one(&mut *conn)
        .await?;
    row.try_get("n")
}

pub async fn list_chunk_lexemes(
    conn: &mut SqliteConnection,
    chunk_id: i64,
) -> Result<Vec<ChunkLexemeNode>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT cl.id AS link_id, cl.chunk_id, cl.lexeme_id, cl.order_index, cl.role, l.*
         FROM chunk_lexemes cl JOIN lexemes l ON l.id = cl.lexeme_id
         WHERE cl.chunk_id = ?
         ORDER BY cl.order_index, cl.id",
    )
    .bind(chunk_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ChunkLexemeNode {
                link: ChunkLexeme {
                    id: row.try_get("link_id")?,
                    chunk_id: row.try_get("chunk_id")?,
                    lexeme_id: row.try_get("lexeme_id")?,
                    order_index: row.try_get("order_index")?,
                    role: row.try_get("role")?,
                },
                lexeme: lexeme_from_row(row)?,
            })
        })
        .collect()
}

/// 嵌套视图：段落 → 句子 → 语块 → 词条
pub async fn answer_tree(
    conn: &mut SqliteConnection,
    answer_id: i64,
) -> Result<Vec<ParagraphNode>, sqlx::Error> {
    let mut tree = Vec::new();
    for paragraph in list_paragraphs(conn, answer_id).await? {
        let mut sentences = Vec::new();
        for sentence in list_sentences(conn, paragraph.id).await? {
            let mut chunks = Vec::new();
            for chunk in list_chunks(conn, sentence.id).await? {
                let lexemes = list_chunk_lexemes(conn, chunk.id).await?;
                chunks.push(ChunkNode { chunk, lexemes });
            }
            sentences.push(SentenceNode { sentence, chunks });
        }
        tree.push(ParagraphNode { paragraph, sentences });
    }
    Ok(tree)
}
