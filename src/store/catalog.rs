//! 题目、答案组与答案版本

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{json_col, json_text, now_ts, ts_col, Answer, AnswerGroup, AnswerGroupWithAnswers, NewQuestion, Question};

fn question_from_row(row: &SqliteRow) -> Result<Question, sqlx::Error> {
    Ok(Question {
        id: row.try_get("id")?,
        question_type: row.try_get("question_type")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        direction_plan: json_col(row, "direction_plan")?,
        created_at: ts_col(row, "created_at")?,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<AnswerGroup, sqlx::Error> {
    Ok(AnswerGroup {
        id: row.try_get("id")?,
        question_id: row.try_get("question_id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        descriptor: row.try_get("descriptor")?,
        dialogue_profile: json_col(row, "dialogue_profile")?,
        created_at: ts_col(row, "created_at")?,
    })
}

fn answer_from_row(row: &SqliteRow) -> Result<Answer, sqlx::Error> {
    Ok(Answer {
        id: row.try_get("id")?,
        answer_group_id: row.try_get("answer_group_id")?,
        version_index: row.try_get("version_index")?,
        status: row.try_get("status")?,
        title: row.try_get("title")?,
        text: row.try_get("text")?,
        created_at: ts_col(row, "created_at")?,
    })
}

pub async fn insert_question(
    conn: &mut SqliteConnection,
    new: &NewQuestion,
) -> Result<Question, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO questions (question_type, title, body, direction_plan, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&new.question_type)
    .bind(&new.title)
    .bind(&new.body)
    .bind(json_text(&new.direction_plan)?)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_question(conn, id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_question(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Question>, sqlx::Error> {
    sqlx::query("SELECT * FROM questions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| question_from_row(&row))
        .transpose()
}

pub async fn insert_answer_group(
    conn: &mut SqliteConnection,
    question_id: i64,
    slug: &str,
    title: &str,
    descriptor: Option<&str>,
    dialogue_profile: &Value,
) -> Result<AnswerGroup, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO answer_groups (question_id, slug, title, descriptor, dialogue_profile, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(question_id)
    .bind(slug)
    .bind(title)
    .bind(descriptor)
    .bind(json_text(dialogue_profile)?)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_answer_group(conn, id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_answer_group(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<AnswerGroup>, sqlx::Error> {
    sqlx::query("SELECT * FROM answer_groups WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| group_from_row(&row))
        .transpose()
}

pub async fn list_answer_groups(
    conn: &mut SqliteConnection,
    question_id: i64,
) -> Result<Vec<AnswerGroup>, sqlx::Error> {
    sqlx::query("SELECT * FROM answer_groups WHERE question_id = ? ORDER BY id")
        .bind(question_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(group_from_row)
        .collect()
}

/// 答案组按创建顺序，组内答案按 version_index
pub async fn list_answer_groups_with_answers(
    conn: &mut SqliteConnection,
    question_id: i64,
) -> Result<Vec<AnswerGroupWithAnswers>, sqlx::Error> {
    let groups = list_answer_groups(conn, question_id).await?;
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let answers = list_answers(conn, group.id).await?;
        out.push(AnswerGroupWithAnswers { group, answers });
    }
    Ok(out)
}

pub async fn list_answers(
    conn: &mut SqliteConnection,
    answer_group_id: i64,
) -> Result<Vec<Answer>, sqlx::Error> {
    sqlx::query("SELECT * FROM answers WHERE answer_group_id = ? ORDER BY version_index")
        .bind(answer_group_id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(answer_from_row)
        .collect()
}

pub async fn get_answer(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query("SELECT * FROM answers WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| answer_from_row(&row))
        .transpose()
}

pub async fn latest_answer(
    conn: &mut SqliteConnection,
    answer_group_id: i64,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query(
        "SELECT * FROM answers WHERE answer_group_id = ? ORDER BY version_index DESC LIMIT 1",
    )
    .bind(answer_group_id)
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| answer_from_row(&row))
    .transpose()
}

pub async fn next_version_index(
    conn: &mut SqliteConnection,
    answer_group_id: i64,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(version_index), 0) + 1 AS next FROM answers WHERE answer_group_id = ?",
    )
    .bind(answer_group_id)
    .fetch_one(&mut *conn)
    .await?;
    row.try_get("next")
}

pub async fn insert_answer(
    conn: &mut SqliteConnection,
    answer_group_id: i64,
    version_index: i64,
    title: &str,
    text: &str,
) -> Result<Answer, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO answers (answer_group_id, version_index, status, title, text, created_at)
         VALUES (?, ?, 'active', ?, ?, ?)",
    )
    .bind(answer_group_id)
    .bind(version_index)
    .bind(title)
    .bind(text)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_answer(conn, id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn delete_answer(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM answers WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirectionPlan, Store};

    async fn question(conn: &mut SqliteConnection) -> Question {
        insert_question(
            conn,
            &NewQuestion {
                question_type: "T3".into(),
                title: "Télétravail".into(),
                body: "Êtes-vous pour ?".into(),
                direction_plan: DirectionPlan::default(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_versions_are_allocated_per_group() {
        let store = Store::in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        let q = question(&mut conn).await;
        let g = insert_answer_group(&mut conn, q.id, "T3-1", "Pour", None, &Value::Null)
            .await
            .unwrap();

        assert_eq!(next_version_index(&mut conn, g.id).await.unwrap(), 1);
        insert_answer(&mut conn, g.id, 1, "v1", "texte").await.unwrap();
        assert_eq!(next_version_index(&mut conn, g.id).await.unwrap(), 2);
        let v2 = insert_answer(&mut conn, g.id, 2, "v2", "texte 2").await.unwrap();

        assert_eq!(latest_answer(&mut conn, g.id).await.unwrap().unwrap().id, v2.id);
        let groups = list_answer_groups_with_answers(&mut conn, q.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        let versions: Vec<i64> = groups[0].answers.iter().map(|a| a.version_index).collect();
        assert_eq!(versions, vec![1, 2]);
    }
}
