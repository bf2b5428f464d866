//! LLM 客户端与生成协作方抽象
//!
//! - `LlmClient`：传输层，所有后端（OpenAI 兼容 / Mock）实现 complete（非流式）。
//! - `Generator`：每个编排步骤一个方法，输入结构化上下文，返回解析后的结构化结果或失败。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::schemas::*;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),
}

/// 生成协作方：编排层只依赖此 trait
#[async_trait]
pub trait Generator: Send + Sync {
    /// 写入 Conversation.model 的模型标识
    fn model_name(&self) -> String;

    async fn evaluate(&self, ctx: &DraftContext) -> Result<EvalResult, GenerationError>;

    async fn compose(&self, ctx: &DraftContext) -> Result<ComposeResult, GenerationError>;

    async fn compare(&self, ctx: &CompareContext) -> Result<CompareResult, GenerationError>;

    async fn highlight_gaps(&self, ctx: &GapContext)
        -> Result<GapHighlightResult, GenerationError>;

    async fn refine(&self, ctx: &RefineContext) -> Result<RefineResult, GenerationError>;

    async fn structure(&self, ctx: &StructureContext) -> Result<StructureResult, GenerationError>;

    async fn translate_sentences(
        &self,
        ctx: &TranslateContext,
    ) -> Result<SentenceTranslationResult, GenerationError>;

    async fn chunk_sentence(&self, ctx: &ChunkContext) -> Result<ChunkResult, GenerationError>;

    async fn build_chunk_lexemes(
        &self,
        ctx: &ChunkLexemeContext,
    ) -> Result<ChunkLexemeResult, GenerationError>;

    async fn live_reply(&self, ctx: &LiveReplyContext) -> Result<LiveReply, GenerationError>;
}
