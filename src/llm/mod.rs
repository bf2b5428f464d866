//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、生成协作方、结构化上下文与结果

pub mod generator;
pub mod mock;
pub mod openai;
pub mod prompts;
pub mod schemas;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use generator::LlmGenerator;
pub use mock::{MockLlmClient, ScriptedGenerator};
pub use openai::{OpenAiClient, TokenUsage, DEEPSEEK_BASE_URL};
pub use schemas::GenerationStep;
pub use traits::{GenerationError, Generator, LlmClient, Message, Role};

use crate::config::LlmSection;

/// 按 [llm] 配置构建生成协作方：openai / deepseek / mock
pub fn create_generator(cfg: &LlmSection) -> Arc<dyn Generator> {
    let timeout = Duration::from_secs(cfg.timeouts.request);
    let client: Arc<dyn LlmClient> = match cfg.provider.as_str() {
        "mock" => Arc::new(MockLlmClient),
        "deepseek" => {
            let key = std::env::var("DEEPSEEK_API_KEY").ok();
            let base = cfg.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            Arc::new(
                OpenAiClient::new(Some(base), &cfg.model, key.as_deref(), timeout)
                    .with_temperature(cfg.temperature),
            )
        }
        other => {
            if other != "openai" {
                tracing::warn!(provider = other, "unknown llm provider, using openai");
            }
            Arc::new(
                OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, None, timeout)
                    .with_temperature(cfg.temperature),
            )
        }
    };
    tracing::info!(provider = %cfg.provider, model = %cfg.model, "generator ready");
    Arc::new(LlmGenerator::new(client, cfg.model.clone()))
}
