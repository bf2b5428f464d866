//! 结构拆解流水线集成测试：幂等重建、质量门、词条去重与孤儿清理

mod common;

use common::{harness, question, seed_answer};
use parole::core::CoachError;
use parole::llm::GenerationStep;
use parole::store::{structure, Answer, TaskStatus, TaskType};
use parole::Orchestrator;
use serde_json::json;

const FIRST: &str = "Nous devons protéger la planète.";
const SECOND: &str = "La planète appartient à nos enfants.";

async fn answer(orch: &Orchestrator) -> Answer {
    let q = question(orch, "T3").await;
    let (_, answer) = seed_answer(orch, q.id, &format!("{} {}", FIRST, SECOND)).await;
    answer
}

fn two_sentences() -> serde_json::Value {
    json!({"paragraphs": [
        {"role": "thèse", "sentences": [{"text": FIRST}, {"text": "   "}]},
        {"role": "vide", "sentences": []},
        {"role": "exemple", "sentences": [{"text": SECOND}]}
    ]})
}

async fn sentence_ids(orch: &Orchestrator, answer_id: i64) -> Vec<i64> {
    let mut conn = orch.store().acquire().await.unwrap();
    structure::list_sentences_for_answer(&mut conn, answer_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect()
}

async fn lexeme_count(orch: &Orchestrator) -> i64 {
    let mut conn = orch.store().acquire().await.unwrap();
    structure::count_lexemes(&mut conn).await.unwrap()
}

#[tokio::test]
async fn test_structure_rerun_replaces_tree() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;

    gen.push(GenerationStep::Structure, two_sentences());
    let task = orch.pipeline().run_structure(answer.id, None).await.unwrap();
    assert_eq!(task.task_type, TaskType::Structure);
    assert_eq!(task.answer_id, Some(answer.id));
    assert_eq!(task.result_summary["paragraphs"], 2);
    assert_eq!(task.result_summary["sentences"], 2);

    let tree = orch.answer_tree(answer.id).await.unwrap();
    assert_eq!(tree.len(), 2);
    assert_eq!(tree[0].paragraph.order_index, 1);
    assert_eq!(tree[1].paragraph.role_label.as_deref(), Some("exemple"));

    gen.push(
        GenerationStep::Structure,
        json!({"paragraphs": [{"sentences": [{"text": FIRST}]}]}),
    );
    orch.pipeline().run_structure(answer.id, None).await.unwrap();
    let tree = orch.answer_tree(answer.id).await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].sentences.len(), 1);
    assert_eq!(sentence_ids(&orch, answer.id).await.len(), 1);
}

#[tokio::test]
async fn test_translate_maps_by_index() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;

    assert!(matches!(
        orch.pipeline().run_translate(answer.id, None).await,
        Err(CoachError::NotReady(_))
    ));

    gen.push(GenerationStep::Structure, two_sentences()).push(
        GenerationStep::TranslateSentences,
        json!({"sentences": [
            {"index": 2, "translation_en": "The planet belongs to our children.", "difficulty": "B1"},
            {"index": 7, "translation_en": "out of range"}
        ]}),
    );
    orch.pipeline().run_structure(answer.id, None).await.unwrap();
    let task = orch.pipeline().run_translate(answer.id, None).await.unwrap();
    assert_eq!(task.result_summary["updated"], 1);
    assert_eq!(task.result_summary["ignored"], 1);

    let tree = orch.answer_tree(answer.id).await.unwrap();
    assert!(tree[0].sentences[0].sentence.translation_en.is_none());
    let second = &tree[1].sentences[0].sentence;
    assert_eq!(
        second.translation_en.as_deref(),
        Some("The planet belongs to our children.")
    );
    assert_eq!(second.difficulty.as_deref(), Some("B1"));
}

#[tokio::test]
async fn test_low_coverage_rejection_leaves_no_chunks() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;
    gen.push(GenerationStep::Structure, two_sentences());
    orch.pipeline().run_structure(answer.id, None).await.unwrap();
    let sid = sentence_ids(&orch, answer.id).await[0];

    gen.push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": "Nous"}]}));
    let rejected = match orch.pipeline().run_chunk(sid, None).await {
        Err(CoachError::QualityGateRejected { task, issues }) => {
            assert!(!issues.is_empty());
            *task
        }
        other => panic!("expected rejection, got {:?}", other.map(|t| t.id)),
    };
    assert_eq!(rejected.status, TaskStatus::Failed);
    assert_eq!(rejected.task_type, TaskType::ChunkSentence);

    let tree = orch.answer_tree(answer.id).await.unwrap();
    let sentence = &tree[0].sentences[0];
    assert!(sentence.chunks.is_empty());
    assert_eq!(sentence.sentence.extra["chunk_candidates"], json!(["Nous"]));
    assert!(sentence.sentence.extra["chunk_issues"].is_array());

    // 重试时带上上次的问题；通过后清理
    gen.push(
        GenerationStep::ChunkSentence,
        json!({"chunks": [{"text": "Nous devons"}, {"text": "protéger la planète."}]}),
    );
    let retried = orch.retry_task(rejected.id).await.unwrap();
    assert_eq!(retried.payload["retry_of"], rejected.id);
    let (_, ctx) = gen
        .calls()
        .into_iter()
        .filter(|(step, _)| *step == GenerationStep::ChunkSentence)
        .last()
        .unwrap();
    assert_eq!(ctx["previous_candidates"], json!(["Nous"]));
    assert!(!ctx["previous_issues"].as_array().unwrap().is_empty());

    let tree = orch.answer_tree(answer.id).await.unwrap();
    let sentence = &tree[0].sentences[0];
    assert_eq!(sentence.chunks.len(), 2);
    assert_eq!(sentence.chunks[1].chunk.order_index, 2);
    assert!(sentence.sentence.extra.get("chunk_issues").is_none());
}

#[tokio::test]
async fn test_lexemes_dedup_and_orphan_cleanup() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;
    gen.push(GenerationStep::Structure, two_sentences());
    orch.pipeline().run_structure(answer.id, None).await.unwrap();
    let ids = sentence_ids(&orch, answer.id).await;

    for (sid, (text, headword)) in ids.iter().zip([(FIRST, "Planète"), (SECOND, " planète ")]) {
        gen.push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": text}]}))
            .push(
                GenerationStep::BuildChunkLexemes,
                json!({"chunks": [{"chunk_index": 1, "lexemes": [
                    {"headword": headword, "translation_en": "planet"},
                    {"headword": "  "}
                ]}]}),
            );
        orch.pipeline().run_chunk(*sid, None).await.unwrap();
        let task = orch.pipeline().run_chunk_lexemes(*sid, None).await.unwrap();
        assert_eq!(task.result_summary["lexemes"], 1);
    }
    // 同一 (headword, sense, phrase) 只存一条，大小写与空白不敏感
    assert_eq!(lexeme_count(&orch).await, 1);

    // 第一句重新切分：旧语块与其关联删除，词条仍被第二句引用
    gen.push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": FIRST}]}));
    orch.pipeline().run_chunk(ids[0], None).await.unwrap();
    assert_eq!(lexeme_count(&orch).await, 1);

    // 第二句也重新切分后词条成为孤儿
    gen.push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": SECOND}]}));
    orch.pipeline().run_chunk(ids[1], None).await.unwrap();
    assert_eq!(lexeme_count(&orch).await, 0);
}

#[tokio::test]
async fn test_lexeme_gate_keeps_previous_links() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;
    gen.push(GenerationStep::Structure, two_sentences());
    orch.pipeline().run_structure(answer.id, None).await.unwrap();
    let sid = sentence_ids(&orch, answer.id).await[0];

    assert!(matches!(
        orch.pipeline().run_chunk_lexemes(sid, None).await,
        Err(CoachError::NotReady(_))
    ));

    gen.push(
        GenerationStep::ChunkSentence,
        json!({"chunks": [{"text": "Nous devons"}, {"text": "protéger la planète."}]}),
    )
    .push(
        GenerationStep::BuildChunkLexemes,
        json!({"chunks": [
            {"chunk_index": 1, "lexemes": [{"headword": "devoir"}]},
            {"chunk_index": 2, "lexemes": [{"headword": "protéger"}, {"headword": "planète"}]}
        ]}),
    );
    orch.pipeline().run_chunk(sid, None).await.unwrap();
    orch.pipeline().run_chunk_lexemes(sid, None).await.unwrap();
    assert_eq!(lexeme_count(&orch).await, 3);

    // 第二个语块没有词条：整批拒绝，原关联保留
    gen.push(
        GenerationStep::BuildChunkLexemes,
        json!({"chunks": [
            {"chunk_index": 1, "lexemes": [{"headword": "nous"}]},
            {"chunk_index": 2, "lexemes": []}
        ]}),
    );
    assert!(matches!(
        orch.pipeline().run_chunk_lexemes(sid, None).await,
        Err(CoachError::QualityGateRejected { .. })
    ));
    let tree = orch.answer_tree(answer.id).await.unwrap();
    let sentence = &tree[0].sentences[0];
    assert_eq!(sentence.chunks[0].lexemes[0].lexeme.headword, "devoir");
    assert_eq!(sentence.chunks[1].lexemes.len(), 2);
    assert!(sentence.sentence.extra["lexeme_issues"].is_array());
    assert_eq!(lexeme_count(&orch).await, 3);
}

#[tokio::test]
async fn test_driver_tolerates_sentence_failures() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;

    gen.push(GenerationStep::Structure, two_sentences())
        .push_error(GenerationStep::TranslateSentences, "translation down")
        .push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": "x"}]}))
        .push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": SECOND}]}))
        .push(
            GenerationStep::BuildChunkLexemes,
            json!({"chunks": [{"chunk_index": 1, "lexemes": [{"headword": "enfant"}]}]}),
        );
    let task = orch.pipeline().run(answer.id, None, None).await.unwrap();
    assert_eq!(task.task_type, TaskType::StructurePipeline);
    assert_eq!(task.status, TaskStatus::Succeeded);

    let ids = sentence_ids(&orch, answer.id).await;
    let summary = &task.result_summary;
    assert_eq!(summary["sentences"], 2);
    assert_eq!(summary["translated"], false);
    assert_eq!(summary["chunked"], 1);
    assert_eq!(summary["lexemes_built"], 1);
    assert_eq!(summary["chunk_failures"], json!([ids[0]]));
    assert_eq!(gen.call_count(GenerationStep::BuildChunkLexemes), 1);
}

#[tokio::test]
async fn test_driver_fails_when_structure_fails() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;

    gen.push_error(GenerationStep::Structure, "model overloaded");
    match orch.pipeline().run(answer.id, None, None).await {
        Err(CoachError::GenerationFailed { task, .. }) => {
            assert_eq!(task.task_type, TaskType::StructurePipeline);
            assert_eq!(task.status, TaskStatus::Failed);
        }
        other => panic!("expected failure, got {:?}", other.map(|t| t.id)),
    }
    assert_eq!(gen.call_count(GenerationStep::TranslateSentences), 0);
    assert!(orch.answer_tree(answer.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_blank_structure_keeps_previous_tree() {
    let (orch, gen) = harness().await;
    let answer = answer(&orch).await;

    gen.push(GenerationStep::Structure, two_sentences());
    orch.pipeline().run_structure(answer.id, None).await.unwrap();
    let before = sentence_ids(&orch, answer.id).await;
    assert_eq!(before.len(), 2);

    gen.push(
        GenerationStep::Structure,
        json!({"paragraphs": [{"sentences": [{"text": "  "}]}, {"sentences": []}]}),
    );
    match orch.pipeline().run_structure(answer.id, None).await {
        Err(CoachError::GenerationFailed { task, message }) => {
            assert_eq!(task.task_type, TaskType::Structure);
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(message.contains("no sentences"));
        }
        other => panic!("expected failure, got {:?}", other.map(|t| t.id)),
    }
    assert_eq!(sentence_ids(&orch, answer.id).await, before);
}
