//! 结构拆解流水线：答案 → 段落/句子 → 翻译 → 语块 → 词条
//!
//! 每一步是一个独立、可重跑的 Task。删除后重建的写入包在 SAVEPOINT 中，
//! 中途失败回滚到上一棵完整的结构树。驱动器按句顺序执行，单句失败不影响后续句子。

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{Connection, SqliteConnection};

use crate::core::error::{CoachError, CoachResult};
use crate::core::ledger::{timed, StepRecord, TaskLedger};
use crate::core::orchestrator::{load_answer, load_session};
use crate::core::quality::{self, GateVerdict};
use crate::core::state::Phase;
use crate::llm::schemas::*;
use crate::llm::{GenerationError, Generator};
use crate::store::{
    catalog, flashcards, sessions, structure, FlashcardEntity, Sentence, Store, Task, TaskScope,
    TaskStatus, TaskType,
};

/// 驱动器一次运行的统计，写入 structure_pipeline Task 的 result_summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub answer_id: i64,
    pub sentences: usize,
    pub translated: bool,
    pub chunked: usize,
    pub lexemes_built: usize,
    pub chunk_failures: Vec<i64>,
    pub lexeme_failures: Vec<i64>,
}

#[derive(Clone)]
pub struct StructurePipeline {
    store: Store,
    generator: Arc<dyn Generator>,
    ledger: TaskLedger,
    chunk_min_coverage: f64,
}

fn payload_with(base: Value, retry_of: Option<i64>) -> Value {
    let mut payload = base;
    if let (Some(id), Value::Object(map)) = (retry_of, &mut payload) {
        map.insert("retry_of".into(), json!(id));
    }
    payload
}

impl StructurePipeline {
    pub fn new(
        store: Store,
        generator: Arc<dyn Generator>,
        ledger: TaskLedger,
        chunk_min_coverage: f64,
    ) -> Self {
        Self {
            store,
            generator,
            ledger,
            chunk_min_coverage,
        }
    }

    fn record<C: Serialize>(
        &self,
        step: GenerationStep,
        ctx: &C,
        latency_ms: i64,
    ) -> CoachResult<StepRecord> {
        Ok(StepRecord {
            purpose: step.as_str(),
            messages: serde_json::to_value(ctx)?,
            latency_ms,
            model: self.generator.model_name(),
        })
    }

    /// 生成失败的统一收尾：写 Conversation、Task 置 failed
    async fn settle_failure(
        &self,
        task: &Task,
        record: &StepRecord,
        err: GenerationError,
    ) -> CoachResult<Task> {
        let message = err.to_string();
        let mut tx = self.store.begin().await?;
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, task, record, json!({ "error": message }))
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }
        let done = self.ledger.fail(&mut tx, task, record, &message).await?;
        tx.commit().await?;
        Err(CoachError::GenerationFailed {
            task: Box::new(done),
            message,
        })
    }

    async fn load_sentence(
        conn: &mut SqliteConnection,
        sentence_id: i64,
    ) -> CoachResult<(Sentence, i64)> {
        let sentence = structure::get_sentence(conn, sentence_id)
            .await?
            .ok_or_else(|| CoachError::not_found("Sentence", sentence_id))?;
        let answer_id = structure::answer_id_for_sentence(conn, sentence_id)
            .await?
            .ok_or_else(|| CoachError::not_found("Sentence", sentence_id))?;
        Ok((sentence, answer_id))
    }

    // -----------------------------------------------------------------------
    // 1. structure
    // -----------------------------------------------------------------------

    pub async fn run_structure(&self, answer_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let answer = load_answer(&mut tx, answer_id).await?;
        let group_title = catalog::get_answer_group(&mut tx, answer.answer_group_id)
            .await?
            .map(|g| g.title)
            .unwrap_or_default();
        let ctx = StructureContext {
            answer_title: if answer.title.is_empty() { group_title } else { answer.title.clone() },
            text: answer.text.clone(),
        };
        let task = self
            .ledger
            .open(
                &mut tx,
                TaskType::Structure,
                TaskScope::Answer(answer_id),
                payload_with(json!({ "answer_id": answer_id }), retry_of),
            )
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.structure(&ctx)).await;
        let record = self.record(GenerationStep::Structure, &ctx, latency_ms)?;
        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.settle_failure(&task, &record, e).await,
        };

        let mut tx = self.store.begin().await?;
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, &task, &record, serde_json::to_value(&output)?)
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }
        let counts = {
            let mut savepoint = tx.begin().await?;
            match rewrite_structure(&mut savepoint, answer_id, &output).await {
                Ok((_, 0)) => Err("structure produced no sentences".to_string()),
                Ok(counts) => {
                    savepoint.commit().await?;
                    Ok(counts)
                }
                Err(e) => Err(format!("structure rewrite failed: {}", e)),
            }
        };
        let (paragraphs, sentences) = match counts {
            Ok(counts) => counts,
            Err(message) => {
                // 保存点已回滚，旧结构仍在
                let done = self.ledger.fail(&mut tx, &task, &record, &message).await?;
                tx.commit().await?;
                return Err(CoachError::GenerationFailed {
                    task: Box::new(done),
                    message,
                });
            }
        };
        let done = self
            .ledger
            .succeed(
                &mut tx,
                &task,
                &record,
                serde_json::to_value(&output)?,
                json!({ "paragraphs": paragraphs, "sentences": sentences }),
            )
            .await?;
        tx.commit().await?;
        Ok(done)
    }

    // -----------------------------------------------------------------------
    // 2. sentence_translate
    // -----------------------------------------------------------------------

    pub async fn run_translate(&self, answer_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        load_answer(&mut tx, answer_id).await?;
        let sentences = structure::list_sentences_for_answer(&mut tx, answer_id).await?;
        if sentences.is_empty() {
            return Err(CoachError::NotReady(format!(
                "answer {} has no sentences, run structure first",
                answer_id
            )));
        }
        let ctx = TranslateContext {
            sentences: sentences
                .iter()
                .enumerate()
                .map(|(i, s)| IndexedText {
                    index: i as i64 + 1,
                    text: s.text.clone(),
                })
                .collect(),
        };
        let task = self
            .ledger
            .open(
                &mut tx,
                TaskType::SentenceTranslate,
                TaskScope::Answer(answer_id),
                payload_with(json!({ "answer_id": answer_id }), retry_of),
            )
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.translate_sentences(&ctx)).await;
        let record = self.record(GenerationStep::TranslateSentences, &ctx, latency_ms)?;
        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.settle_failure(&task, &record, e).await,
        };

        let mut tx = self.store.begin().await?;
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, &task, &record, serde_json::to_value(&output)?)
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }
        let mut updated = 0usize;
        let mut ignored = 0usize;
        for item in &output.sentences {
            let Some(sentence) = usize::try_from(item.index - 1)
                .ok()
                .and_then(|i| sentences.get(i))
            else {
                ignored += 1;
                continue;
            };
            structure::update_sentence_translation(
                &mut tx,
                sentence.id,
                item.translation_en.as_deref(),
                item.translation_zh.as_deref(),
                item.difficulty.as_deref(),
            )
            .await?;
            flashcards::get_or_create(&mut tx, FlashcardEntity::Sentence, sentence.id).await?;
            updated += 1;
        }
        let done = self
            .ledger
            .succeed(
                &mut tx,
                &task,
                &record,
                serde_json::to_value(&output)?,
                json!({ "updated": updated, "ignored": ignored }),
            )
            .await?;
        tx.commit().await?;
        Ok(done)
    }

    // -----------------------------------------------------------------------
    // 3. chunk_sentence
    // -----------------------------------------------------------------------

    pub async fn run_chunk(&self, sentence_id: i64, retry_of: Option<i64>) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let (sentence, answer_id) = Self::load_sentence(&mut tx, sentence_id).await?;
        let ctx = ChunkContext {
            sentence: sentence.text.clone(),
            translation: sentence
                .translation_en
                .clone()
                .or_else(|| sentence.translation_zh.clone()),
            previous_candidates: string_list(&sentence.extra, "chunk_candidates"),
            previous_issues: string_list(&sentence.extra, "chunk_issues"),
        };
        let task = self
            .ledger
            .open(
                &mut tx,
                TaskType::ChunkSentence,
                TaskScope::Answer(answer_id),
                payload_with(json!({ "sentence_id": sentence_id }), retry_of),
            )
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.chunk_sentence(&ctx)).await;
        let record = self.record(GenerationStep::ChunkSentence, &ctx, latency_ms)?;
        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.settle_failure(&task, &record, e).await,
        };
        let verdict = quality::check_chunks(&sentence.text, &output.chunks, self.chunk_min_coverage);

        let mut tx = self.store.begin().await?;
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, &task, &record, serde_json::to_value(&output)?)
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }
        {
            let mut savepoint = tx.begin().await?;
            let orphans = structure::delete_sentence_chunks(&mut savepoint, sentence_id).await?;
            let mut extra = sentence.extra.clone();
            match &verdict {
                GateVerdict::Accepted => {
                    for (i, candidate) in output.chunks.iter().enumerate() {
                        let chunk =
                            structure::insert_chunk(&mut savepoint, sentence_id, i as i64 + 1, candidate)
                                .await?;
                        flashcards::get_or_create(&mut savepoint, FlashcardEntity::Chunk, chunk.id)
                            .await?;
                    }
                    remove_keys(&mut extra, &["chunk_candidates", "chunk_issues"]);
                }
                GateVerdict::Rejected(issues) => {
                    let texts: Vec<&str> = output.chunks.iter().map(|c| c.text.as_str()).collect();
                    set_key(&mut extra, "chunk_candidates", json!(texts));
                    set_key(&mut extra, "chunk_issues", json!(issues));
                }
            }
            structure::update_sentence_extra(&mut savepoint, sentence_id, &extra).await?;
            structure::delete_orphan_lexemes(&mut savepoint, &orphans).await?;
            savepoint.commit().await?;
        }

        let output_value = serde_json::to_value(&output)?;
        match verdict {
            GateVerdict::Accepted => {
                let done = self
                    .ledger
                    .succeed(
                        &mut tx,
                        &task,
                        &record,
                        output_value,
                        json!({ "sentence_id": sentence_id, "chunks": output.chunks.len() }),
                    )
                    .await?;
                tx.commit().await?;
                Ok(done)
            }
            GateVerdict::Rejected(issues) => {
                let done = self
                    .ledger
                    .reject(&mut tx, &task, &record, output_value, &issues)
                    .await?;
                tx.commit().await?;
                Err(CoachError::QualityGateRejected {
                    task: Box::new(done),
                    issues,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. chunk_lexeme
    // -----------------------------------------------------------------------

    pub async fn run_chunk_lexemes(
        &self,
        sentence_id: i64,
        retry_of: Option<i64>,
    ) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        let (sentence, answer_id) = Self::load_sentence(&mut tx, sentence_id).await?;
        let chunks = structure::list_chunks(&mut tx, sentence_id).await?;
        if chunks.is_empty() {
            return Err(CoachError::NotReady(format!(
                "sentence {} has no chunks",
                sentence_id
            )));
        }
        let ctx = ChunkLexemeContext {
            sentence: sentence.text.clone(),
            chunks: chunks
                .iter()
                .enumerate()
                .map(|(i, c)| IndexedText {
                    index: i as i64 + 1,
                    text: c.text.clone(),
                })
                .collect(),
            previous_issues: string_list(&sentence.extra, "lexeme_issues"),
        };
        let task = self
            .ledger
            .open(
                &mut tx,
                TaskType::ChunkLexeme,
                TaskScope::Answer(answer_id),
                payload_with(json!({ "sentence_id": sentence_id }), retry_of),
            )
            .await?;
        tx.commit().await?;

        let (outcome, latency_ms) = timed(self.generator.build_chunk_lexemes(&ctx)).await;
        let record = self.record(GenerationStep::BuildChunkLexemes, &ctx, latency_ms)?;
        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.settle_failure(&task, &record, e).await,
        };
        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let verdict = quality::check_chunk_lexemes(&chunk_texts, &output.chunks);
        let output_value = serde_json::to_value(&output)?;

        let mut tx = self.store.begin().await?;
        if let Some(canceled) = self
            .ledger
            .discard_if_canceled(&mut tx, &task, &record, output_value.clone())
            .await?
        {
            tx.commit().await?;
            return Err(canceled);
        }
        let mut extra = sentence.extra.clone();
        match verdict {
            GateVerdict::Accepted => {
                let mut linked = 0usize;
                {
                    let mut savepoint = tx.begin().await?;
                    let orphans =
                        structure::delete_sentence_chunk_lexemes(&mut savepoint, sentence_id).await?;
                    for group in &output.chunks {
                        let Some(chunk) = usize::try_from(group.chunk_index - 1)
                            .ok()
                            .and_then(|i| chunks.get(i))
                        else {
                            continue;
                        };
                        let valid = group.lexemes.iter().filter(|l| !l.headword.trim().is_empty());
                        for (order, candidate) in valid.enumerate() {
                            let hash = quality::candidate_hash(candidate);
                            let lexeme = structure::upsert_lexeme(&mut savepoint, &hash, candidate).await?;
                            structure::insert_chunk_lexeme(
                                &mut savepoint,
                                chunk.id,
                                lexeme.id,
                                order as i64 + 1,
                                candidate.role.as_deref(),
                            )
                            .await?;
                            flashcards::get_or_create(&mut savepoint, FlashcardEntity::Lexeme, lexeme.id)
                                .await?;
                            linked += 1;
                        }
                    }
                    structure::delete_orphan_lexemes(&mut savepoint, &orphans).await?;
                    remove_keys(&mut extra, &["lexeme_issues"]);
                    structure::update_sentence_extra(&mut savepoint, sentence_id, &extra).await?;
                    savepoint.commit().await?;
                }
                let done = self
                    .ledger
                    .succeed(
                        &mut tx,
                        &task,
                        &record,
                        output_value,
                        json!({ "sentence_id": sentence_id, "lexemes": linked }),
                    )
                    .await?;
                tx.commit().await?;
                Ok(done)
            }
            GateVerdict::Rejected(issues) => {
                // 旧的词条关联保持不变
                set_key(&mut extra, "lexeme_issues", json!(issues));
                structure::update_sentence_extra(&mut tx, sentence_id, &extra).await?;
                let done = self
                    .ledger
                    .reject(&mut tx, &task, &record, output_value, &issues)
                    .await?;
                tx.commit().await?;
                Err(CoachError::QualityGateRejected {
                    task: Box::new(done),
                    issues,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // 驱动器
    // -----------------------------------------------------------------------

    /// 完整跑一遍 1-4；`session_id` 存在时结束后把会话推进到 learning
    pub async fn run(
        &self,
        answer_id: i64,
        session_id: Option<i64>,
        retry_of: Option<i64>,
    ) -> CoachResult<Task> {
        let mut tx = self.store.begin().await?;
        load_answer(&mut tx, answer_id).await?;
        let scope = match session_id {
            Some(id) => {
                let mut session = load_session(&mut tx, id).await?;
                if !matches!(
                    session.progress_state.phase,
                    Phase::StructurePipeline | Phase::Learning
                ) {
                    return Err(CoachError::InvalidPhase(format!(
                        "session {} is at {}, not structure_pipeline",
                        id, session.progress_state.phase
                    )));
                }
                session.progress_state.begin_step();
                sessions::save_session(&mut tx, &session).await?;
                TaskScope::Session(id)
            }
            None => TaskScope::Answer(answer_id),
        };
        let mut payload = json!({ "answer_id": answer_id });
        if let Some(id) = session_id {
            set_key(&mut payload, "session_id", json!(id));
        }
        let pipeline_task = self
            .ledger
            .open(
                &mut tx,
                TaskType::StructurePipeline,
                scope,
                payload_with(payload, retry_of),
            )
            .await?;
        tx.commit().await?;
        tracing::info!(answer_id, task_id = pipeline_task.id, "structure pipeline started");

        match self.drive(answer_id).await {
            Ok(summary) => {
                let mut tx = self.store.begin().await?;
                if let Some(current) = self.ledger.settled(&mut tx, &pipeline_task).await? {
                    tracing::info!(answer_id, task_id = current.id, "structure pipeline canceled");
                    return Err(CoachError::canceled(current));
                }
                if let Some(id) = session_id {
                    let mut session = load_session(&mut tx, id).await?;
                    session.progress_state.transition(Phase::Learning)?;
                    session.progress_state.finish_step();
                    sessions::save_session(&mut tx, &session).await?;
                }
                let done = self
                    .ledger
                    .close(
                        &mut tx,
                        &pipeline_task,
                        TaskStatus::Succeeded,
                        serde_json::to_value(&summary)?,
                        None,
                    )
                    .await?;
                tx.commit().await?;
                tracing::info!(
                    answer_id,
                    sentences = summary.sentences,
                    chunk_failures = summary.chunk_failures.len(),
                    lexeme_failures = summary.lexeme_failures.len(),
                    "structure pipeline finished"
                );
                Ok(done)
            }
            Err(e) => {
                let message = e.to_string();
                let mut tx = self.store.begin().await?;
                if let Some(current) = self.ledger.settled(&mut tx, &pipeline_task).await? {
                    tracing::info!(answer_id, task_id = current.id, error = %message, "structure pipeline canceled");
                    return Err(CoachError::canceled(current));
                }
                if let Some(id) = session_id {
                    let mut session = load_session(&mut tx, id).await?;
                    session.progress_state.fail_step(&message);
                    sessions::save_session(&mut tx, &session).await?;
                }
                let done = self
                    .ledger
                    .close(
                        &mut tx,
                        &pipeline_task,
                        TaskStatus::Failed,
                        json!({ "answer_id": answer_id }),
                        Some(&message),
                    )
                    .await?;
                tx.commit().await?;
                tracing::warn!(answer_id, error = %message, "structure pipeline failed");
                if e.is_step_failure() {
                    Err(CoachError::GenerationFailed {
                        task: Box::new(done),
                        message,
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn drive(&self, answer_id: i64) -> CoachResult<PipelineSummary> {
        let mut summary = PipelineSummary {
            answer_id,
            ..Default::default()
        };

        self.run_structure(answer_id, None).await?;

        let sentences = {
            let mut conn = self.store.acquire().await?;
            structure::list_sentences_for_answer(&mut conn, answer_id).await?
        };
        summary.sentences = sentences.len();

        match self.run_translate(answer_id, None).await {
            Ok(_) => summary.translated = true,
            Err(e) if e.is_step_failure() => {
                tracing::warn!(answer_id, error = %e, "sentence translation failed, continuing");
            }
            Err(e) => return Err(e),
        }

        for sentence in &sentences {
            match self.run_chunk(sentence.id, None).await {
                Ok(_) => summary.chunked += 1,
                Err(e) if e.is_step_failure() => {
                    tracing::warn!(sentence_id = sentence.id, error = %e, "chunking failed, next sentence");
                    summary.chunk_failures.push(sentence.id);
                    continue;
                }
                Err(e) => return Err(e),
            }
            match self.run_chunk_lexemes(sentence.id, None).await {
                Ok(_) => summary.lexemes_built += 1,
                Err(e) if e.is_step_failure() => {
                    tracing::warn!(sentence_id = sentence.id, error = %e, "lexeme build failed, next sentence");
                    summary.lexeme_failures.push(sentence.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }
}

/// 删除旧树后按生成结果重建；调用方负责保存点
async fn rewrite_structure(
    conn: &mut SqliteConnection,
    answer_id: i64,
    output: &StructureResult,
) -> Result<(usize, usize), sqlx::Error> {
    let orphans = structure::delete_answer_structure(conn, answer_id).await?;
    let mut paragraphs = 0usize;
    let mut sentences = 0usize;
    for paragraph in &output.paragraphs {
        let texts: Vec<&str> = paragraph
            .sentences
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if texts.is_empty() {
            continue;
        }
        paragraphs += 1;
        let paragraph_id = structure::insert_paragraph(
            conn,
            answer_id,
            paragraphs as i64,
            paragraph.role.as_deref(),
            paragraph.summary.as_deref(),
        )
        .await?;
        for (i, text) in texts.iter().enumerate() {
            structure::insert_sentence(conn, paragraph_id, i as i64 + 1, text).await?;
            sentences += 1;
        }
    }
    structure::delete_orphan_lexemes(conn, &orphans).await?;
    Ok((paragraphs, sentences))
}

fn string_list(extra: &Value, key: &str) -> Vec<String> {
    extra
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn set_key(target: &mut Value, key: &str, value: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(map) = target {
        map.insert(key.to_string(), value);
    }
}

fn remove_keys(target: &mut Value, keys: &[&str]) {
    if let Value::Object(map) = target {
        for key in keys {
            map.remove(*key);
        }
    }
}
