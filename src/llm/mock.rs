//! 测试替身（无需 API）
//!
//! - `MockLlmClient`：按最后一条 User 消息中的步骤标记返回固定 JSON，便于本地跑通完整流程。
//! - `ScriptedGenerator`：按步骤排队预设结果，供集成测试精确控制每次生成。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::llm::schemas::*;
use crate::llm::traits::{GenerationError, Generator, LlmClient, Message, Role};

/// Mock 客户端：识别 Prompt 中的 `[step:xxx]` 标记，回复该步骤合法的最小 JSON
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn reply_for(step: &str, input: &str) -> Value {
        match step {
            "evaluate" => json!({"feedback": "Mock: structure claire.", "score": 3}),
            "compose" => json!({"title": "Mock", "text": input}),
            "compare" => json!({"decision": "new_group", "reason": "mock"}),
            "highlight_gaps" => json!({"coverage_score": 50.0, "missing_points": []}),
            "refine" => json!({"refined_text": input, "notes": []}),
            "structure" => json!({"paragraphs": [{"role": "body", "sentences": [{"text": input}]}]}),
            "translate_sentences" => json!({"sentences": []}),
            "chunk_sentence" => json!({"chunks": [{"text": input}]}),
            "build_chunk_lexemes" => {
                json!({"chunks": [{"chunk_index": 1, "lexemes": [{"headword": input}]}]})
            }
            _ => json!({"text": "D'accord, continuez."}),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let step = last_user
            .strip_prefix("[step:")
            .and_then(|rest| rest.split(']').next())
            .unwrap_or("live_reply");

        Ok(Self::reply_for(step, "Mock").to_string())
    }
}

/// 单次预设结果：JSON 值或错误
type Scripted = Result<Value, GenerationError>;

/// 按步骤排队的生成替身；某步骤队列为空时返回 Transport 错误
#[derive(Default)]
pub struct ScriptedGenerator {
    queues: Mutex<HashMap<GenerationStep, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(GenerationStep, Value)>>,
    holds: Mutex<HashMap<GenerationStep, Arc<Notify>>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个成功结果（任意可序列化值，按步骤的结果类型解析）
    pub fn push(&self, step: GenerationStep, value: Value) -> &Self {
        self.enqueue(step, Ok(value))
    }

    pub fn push_error(&self, step: GenerationStep, message: &str) -> &Self {
        self.enqueue(step, Err(GenerationError::Transport(message.to_string())))
    }

    fn enqueue(&self, step: GenerationStep, item: Scripted) -> &Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(step).or_default().push_back(item);
        }
        self
    }

    /// 之后该步骤的每次调用都挂起，直到对返回的 Notify 调用一次 notify_one
    pub fn hold(&self, step: GenerationStep) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        if let Ok(mut holds) = self.holds.lock() {
            holds.insert(step, gate.clone());
        }
        gate
    }

    /// 已发生的调用（步骤 + 上下文 JSON），按调用顺序
    pub fn calls(&self) -> Vec<(GenerationStep, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, step: GenerationStep) -> usize {
        self.calls().iter().filter(|(s, _)| *s == step).count()
    }

    async fn next<C: serde::Serialize, T: DeserializeOwned>(
        &self,
        step: GenerationStep,
        ctx: &C,
    ) -> Result<T, GenerationError> {
        let ctx_json = serde_json::to_value(ctx).unwrap_or(Value::Null);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((step, ctx_json));
        }
        let gate = self
            .holds
            .lock()
            .ok()
            .and_then(|holds| holds.get(&step).cloned());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let item = self
            .queues
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(&step).and_then(|items| items.pop_front()));
        match item {
            Some(Ok(value)) => {
                serde_json::from_value(value).map_err(|e| GenerationError::Parse(e.to_string()))
            }
            Some(Err(e)) => Err(e),
            None => Err(GenerationError::Transport(format!(
                "no scripted response for {}",
                step.as_str()
            ))),
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> String {
        "scripted".to_string()
    }

    async fn evaluate(&self, ctx: &DraftContext) -> Result<EvalResult, GenerationError> {
        self.next(GenerationStep::Evaluate, ctx).await
    }

    async fn compose(&self, ctx: &DraftContext) -> Result<ComposeResult, GenerationError> {
        self.next(GenerationStep::Compose, ctx).await
    }

    async fn compare(&self, ctx: &CompareContext) -> Result<CompareResult, GenerationError> {
        self.next(GenerationStep::Compare, ctx).await
    }

    async fn highlight_gaps(
        &self,
        ctx: &GapContext,
    ) -> Result<GapHighlightResult, GenerationError> {
        self.next(GenerationStep::HighlightGaps, ctx).await
    }

    async fn refine(&self, ctx: &RefineContext) -> Result<RefineResult, GenerationError> {
        self.next(GenerationStep::Refine, ctx).await
    }

    async fn structure(&self, ctx: &StructureContext) -> Result<StructureResult, GenerationError> {
        self.next(GenerationStep::Structure, ctx).await
    }

    async fn translate_sentences(
        &self,
        ctx: &TranslateContext,
    ) -> Result<SentenceTranslationResult, GenerationError> {
        self.next(GenerationStep::TranslateSentences, ctx).await
    }

    async fn chunk_sentence(&self, ctx: &ChunkContext) -> Result<ChunkResult, GenerationError> {
        self.next(GenerationStep::ChunkSentence, ctx).await
    }

    async fn build_chunk_lexemes(
        &self,
        ctx: &ChunkLexemeContext,
    ) -> Result<ChunkLexemeResult, GenerationError> {
        self.next(GenerationStep::BuildChunkLexemes, ctx).await
    }

    async fn live_reply(&self, ctx: &LiveReplyContext) -> Result<LiveReply, GenerationError> {
        self.next(GenerationStep::LiveReply, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_generator_pops_in_order() {
        let gen = ScriptedGenerator::new();
        gen.push(
            GenerationStep::LiveReply,
            json!({"text": "Bonjour"}),
        )
        .push_error(GenerationStep::LiveReply, "down");

        let ctx = LiveReplyContext {
            question: QuestionContext {
                question_type: "T2".into(),
                title: "t".into(),
                body: "b".into(),
                direction: None,
            },
            history: vec![],
            candidate_query: "Salut".into(),
            candidate_followup: None,
        };
        assert_eq!(gen.live_reply(&ctx).await.unwrap().text, "Bonjour");
        assert!(matches!(
            gen.live_reply(&ctx).await,
            Err(GenerationError::Transport(_))
        ));
        assert!(gen.live_reply(&ctx).await.is_err());
        assert_eq!(gen.call_count(GenerationStep::LiveReply), 3);
    }

    #[tokio::test]
    async fn test_mock_client_answers_by_step_marker() {
        let client = MockLlmClient;
        let out = client
            .complete(&[Message::user("[step:evaluate]\n{}")])
            .await
            .unwrap();
        let parsed: EvalResult = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.score, 3);
    }
}
