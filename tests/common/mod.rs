//! 集成测试公共夹具：内存库 + 按步骤排队的生成替身

#![allow(dead_code)]

use std::sync::Arc;

use parole::config::AppConfig;
use parole::llm::{GenerationStep, ScriptedGenerator};
use parole::store::{catalog, Answer, AnswerGroup, Direction, DirectionPlan, NewQuestion, Question};
use parole::Orchestrator;
use serde_json::json;

pub async fn harness() -> (Orchestrator, Arc<ScriptedGenerator>) {
    harness_with(AppConfig::default()).await
}

pub async fn harness_with(cfg: AppConfig) -> (Orchestrator, Arc<ScriptedGenerator>) {
    let store = parole::Store::in_memory().await.unwrap();
    let gen = Arc::new(ScriptedGenerator::new());
    let orch = Orchestrator::new(store, gen.clone(), &cfg);
    (orch, gen)
}

pub fn plan(direction: &str) -> DirectionPlan {
    DirectionPlan {
        recommended: Some(Direction {
            title: direction.to_string(),
            ..Default::default()
        }),
        alternatives: vec![],
    }
}

pub async fn question(orch: &Orchestrator, question_type: &str) -> Question {
    orch.create_question(NewQuestion {
        question_type: question_type.to_string(),
        title: "Le télétravail".to_string(),
        body: "Êtes-vous pour ou contre le télétravail ?".to_string(),
        direction_plan: plan("Pour, avec nuances"),
    })
    .await
    .unwrap()
}

/// 直接写入一个答案组及其第一版答案
pub async fn seed_answer(orch: &Orchestrator, question_id: i64, text: &str) -> (AnswerGroup, Answer) {
    let mut conn = orch.store().acquire().await.unwrap();
    let group = catalog::insert_answer_group(&mut conn, question_id, "seed", "Version initiale", None, &json!({}))
        .await
        .unwrap();
    let answer = catalog::insert_answer(&mut conn, group.id, 1, "Version initiale v1", text)
        .await
        .unwrap();
    (group, answer)
}

/// 单句答案的完整流水线脚本：structure → translate → chunk → lexemes
pub fn script_pipeline(gen: &ScriptedGenerator, sentence: &str, headword: &str) {
    gen.push(
        GenerationStep::Structure,
        json!({"paragraphs": [{"role": "body", "sentences": [{"text": sentence}]}]}),
    )
    .push(
        GenerationStep::TranslateSentences,
        json!({"sentences": [{"index": 1, "translation_en": "translated"}]}),
    )
    .push(GenerationStep::ChunkSentence, json!({"chunks": [{"text": sentence}]}))
    .push(
        GenerationStep::BuildChunkLexemes,
        json!({"chunks": [{"chunk_index": 1, "lexemes": [{"headword": headword}]}]}),
    );
}
