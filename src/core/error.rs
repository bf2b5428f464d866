//! 编排层错误类型
//!
//! 主步骤把 GenerationFailed / QualityGateRejected 作为「失败且可重试的 Task」返回给调用方；
//! 自动串联的尽力步骤只吞掉这两类（Task 已落库为 failed）以及调用期间被取消的 Task，
//! 其余错误一律向上传播。

use thiserror::Error;

use crate::store::Task;

#[derive(Error, Debug)]
pub enum CoachError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid phase: {0}")]
    InvalidPhase(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Generation failed (task {}): {message}", .task.id)]
    GenerationFailed { task: Box<Task>, message: String },

    #[error("Quality gate rejected (task {}): {}", .task.id, .issues.join("; "))]
    QualityGateRejected { task: Box<Task>, issues: Vec<String> },

    #[error("Task {} was canceled before its result arrived", .task.id)]
    Canceled { task: Box<Task> },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoachError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn canceled(task: Task) -> Self {
        Self::Canceled {
            task: Box::new(task),
        }
    }

    /// 步骤级失败（Task 已是终态），尽力步骤可安全吞掉
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::GenerationFailed { .. } | Self::QualityGateRejected { .. } | Self::Canceled { .. }
        )
    }

    /// 失败步骤对应的 Task（仅步骤级失败才有）
    pub fn failed_task(&self) -> Option<&Task> {
        match self {
            Self::GenerationFailed { task, .. }
            | Self::QualityGateRejected { task, .. }
            | Self::Canceled { task } => Some(task),
            _ => None,
        }
    }
}

pub type CoachResult<T> = Result<T, CoachError>;
