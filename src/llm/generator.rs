//! LlmGenerator：基于 LlmClient 的生成协作方实现
//!
//! 每步：上下文序列化为 JSON → 渲染 Prompt → complete → 提取 JSON → 反序列化为结果类型 → 基本校验。

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::llm::prompts;
use crate::llm::schemas::*;
use crate::llm::traits::{GenerationError, Generator, LlmClient};

/// 从模型输出中提取 JSON 对象（```json 代码块，或首个 `{` 到末个 `}`）
pub fn extract_json(output: &str) -> Result<&str, GenerationError> {
    let trimmed = output.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Ok(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&trimmed[start..=end]),
        _ => Err(GenerationError::Parse(format!(
            "no JSON object in output: {}",
            trimmed
        ))),
    }
}

pub fn parse_output<T: DeserializeOwned>(output: &str) -> Result<T, GenerationError> {
    let json_str = extract_json(output)?;
    serde_json::from_str(json_str).map_err(|e| GenerationError::Parse(format!("{}: {}", e, json_str)))
}

pub struct LlmGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    async fn run<C: Serialize + Sync, T: DeserializeOwned>(
        &self,
        step: GenerationStep,
        ctx: &C,
    ) -> Result<T, GenerationError> {
        let context_json = serde_json::to_string_pretty(ctx)
            .map_err(|e| GenerationError::InvalidOutput(e.to_string()))?;
        let messages = prompts::render(step, &context_json);
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(GenerationError::Transport)?;
        tracing::debug!(step = step.as_str(), len = raw.len(), "llm output received");
        parse_output(&raw)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), GenerationError> {
    if value.trim().is_empty() {
        Err(GenerationError::InvalidOutput(format!("{} is empty", field)))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn evaluate(&self, ctx: &DraftContext) -> Result<EvalResult, GenerationError> {
        let out: EvalResult = self.run(GenerationStep::Evaluate, ctx).await?;
        if out.score > 5 {
            return Err(GenerationError::InvalidOutput(format!(
                "score {} out of range 0-5",
                out.score
            )));
        }
        Ok(out)
    }

    async fn compose(&self, ctx: &DraftContext) -> Result<ComposeResult, GenerationError> {
        let out: ComposeResult = self.run(GenerationStep::Compose, ctx).await?;
        require_non_empty("text", &out.text)?;
        Ok(out)
    }

    async fn compare(&self, ctx: &CompareContext) -> Result<CompareResult, GenerationError> {
        let out: CompareResult = self.run(GenerationStep::Compare, ctx).await?;
        if out.decision == CompareDecision::Reuse {
            let known = ctx.candidates.iter().any(|c| {
                Some(c.answer_group_id) == out.matched_answer_group_id
                    || Some(c.answer_id) == out.matched_answer_id
            });
            if !known {
                return Err(GenerationError::InvalidOutput(
                    "reuse decision without a known matched answer".into(),
                ));
            }
        }
        Ok(out)
    }

    async fn highlight_gaps(
        &self,
        ctx: &GapContext,
    ) -> Result<GapHighlightResult, GenerationError> {
        let mut out: GapHighlightResult = self.run(GenerationStep::HighlightGaps, ctx).await?;
        out.coverage_score = out.coverage_score.clamp(0.0, 100.0);
        Ok(out)
    }

    async fn refine(&self, ctx: &RefineContext) -> Result<RefineResult, GenerationError> {
        let out: RefineResult = self.run(GenerationStep::Refine, ctx).await?;
        require_non_empty("refined_text", &out.refined_text)?;
        Ok(out)
    }

    async fn structure(&self, ctx: &StructureContext) -> Result<StructureResult, GenerationError> {
        let out: StructureResult = self.run(GenerationStep::Structure, ctx).await?;
        if out
            .paragraphs
            .iter()
            .flat_map(|p| &p.sentences)
            .all(|s| s.text.trim().is_empty())
        {
            return Err(GenerationError::InvalidOutput("no sentences produced".into()));
        }
        Ok(out)
    }

    async fn translate_sentences(
        &self,
        ctx: &TranslateContext,
    ) -> Result<SentenceTranslationResult, GenerationError> {
        self.run(GenerationStep::TranslateSentences, ctx).await
    }

    async fn chunk_sentence(&self, ctx: &ChunkContext) -> Result<ChunkResult, GenerationError> {
        self.run(GenerationStep::ChunkSentence, ctx).await
    }

    async fn build_chunk_lexemes(
        &self,
        ctx: &ChunkLexemeContext,
    ) -> Result<ChunkLexemeResult, GenerationError> {
        self.run(GenerationStep::BuildChunkLexemes, ctx).await
    }

    async fn live_reply(&self, ctx: &LiveReplyContext) -> Result<LiveReply, GenerationError> {
        let out: LiveReply = self.run(GenerationStep::LiveReply, ctx).await?;
        require_non_empty("text", &out.text)?;
        Ok(out)
    }
}
