//! Parole - 法语口语考试陪练后端
//!
//! 模块划分：
//! - **api**: HTTP 接口（axum）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话阶段机、任务台账、编排、结构拆解流水线、实时对练控制
//! - **gateway**: 实时对练 WebSocket 网关
//! - **llm**: 生成协作方（OpenAI 兼容 / Mock）与结构化上下文、结果
//! - **observability**: tracing 初始化
//! - **store**: SQLite 持久化（sqlx）

pub mod api;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod store;

pub use crate::core::{CoachError, CoachResult, Orchestrator};
pub use crate::store::Store;
