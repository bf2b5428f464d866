//! 会话进度状态：枚举阶段 + 每阶段的类型化结果
//!
//! 阶段迁移统一经 `ProgressState::transition` 校验；整份状态以 JSON 存入 sessions.progress_state。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{CoachError, CoachResult};
use crate::llm::schemas::{
    CompareResult, ComposeResult, EvalResult, GapHighlightResult, RefineResult,
};

/// 会话所处的工作流阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Draft,
    AwaitEvalConfirm,
    GapHighlight,
    AwaitNewGroup,
    Refine,
    AwaitFinalize,
    StructurePipeline,
    Learning,
    Completed,
    Live,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::AwaitEvalConfirm => "await_eval_confirm",
            Self::GapHighlight => "gap_highlight",
            Self::AwaitNewGroup => "await_new_group",
            Self::Refine => "refine",
            Self::AwaitFinalize => "await_finalize",
            Self::StructurePipeline => "structure_pipeline",
            Self::Learning => "learning",
            Self::Completed => "completed",
            Self::Live => "live",
        }
    }

    /// 定稿之前的编辑阶段（可重新评估 / 重置为草稿）
    pub fn is_pre_finalize(&self) -> bool {
        matches!(
            self,
            Self::Draft
                | Self::AwaitEvalConfirm
                | Self::GapHighlight
                | Self::AwaitNewGroup
                | Self::Refine
                | Self::AwaitFinalize
        )
    }

    /// 工作流图：目标阶段允许的前驱
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match next {
            Draft => self.is_pre_finalize() || *self == Live,
            AwaitEvalConfirm => self.is_pre_finalize(),
            GapHighlight | AwaitNewGroup => matches!(
                self,
                AwaitEvalConfirm | GapHighlight | AwaitNewGroup | Refine | AwaitFinalize
            ),
            Refine => matches!(self, GapHighlight | Refine | AwaitFinalize),
            AwaitFinalize => matches!(self, Refine | AwaitFinalize),
            StructurePipeline => matches!(self, AwaitFinalize | AwaitNewGroup | Live | StructurePipeline),
            Learning => matches!(self, StructurePipeline | Learning),
            Completed => *self == Learning,
            Live => matches!(self, Draft | Live),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 当前步骤的执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Idle,
    Running,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Standard,
    Live,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Active,
    Stopped,
    Completed,
}

/// 带保存时间的步骤结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    #[serde(flatten)]
    pub value: T,
    pub saved_at: DateTime<Utc>,
}

impl<T> Stamped<T> {
    pub fn now(value: T) -> Self {
        Self {
            value,
            saved_at: Utc::now(),
        }
    }
}

/// 实时对练字段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub status: LiveStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// 最近一次写入的轮次
    pub last_turn_index: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub phase: Phase,
    #[serde(default)]
    pub phase_status: PhaseStatus,
    #[serde(default)]
    pub phase_error: Option<String>,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub last_eval: Option<Stamped<EvalResult>>,
    #[serde(default)]
    pub last_compose: Option<Stamped<ComposeResult>>,
    #[serde(default)]
    pub last_compare: Option<Stamped<CompareResult>>,
    #[serde(default)]
    pub last_gap_highlight: Option<Stamped<GapHighlightResult>>,
    #[serde(default)]
    pub last_refine: Option<Stamped<RefineResult>>,
    #[serde(default)]
    pub live: Option<LiveState>,
    #[serde(default)]
    pub selected_answer_group_id: Option<i64>,
    #[serde(default)]
    pub selected_direction: Option<String>,
    #[serde(default)]
    pub review_source_answer_id: Option<i64>,
}

impl ProgressState {
    pub fn new(direction: Option<String>) -> Self {
        Self {
            phase: Phase::Draft,
            phase_status: PhaseStatus::Idle,
            phase_error: None,
            mode: SessionMode::Standard,
            last_eval: None,
            last_compose: None,
            last_compare: None,
            last_gap_highlight: None,
            last_refine: None,
            live: None,
            selected_answer_group_id: None,
            selected_direction: direction,
            review_source_answer_id: None,
        }
    }

    /// 校验并切换阶段
    pub fn transition(&mut self, next: Phase) -> CoachResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(CoachError::InvalidPhase(format!(
                "cannot move from {} to {}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// 仅校验，不切换
    pub fn ensure_can_transition(&self, next: Phase) -> CoachResult<()> {
        if self.phase.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoachError::InvalidPhase(format!(
                "cannot move from {} to {}",
                self.phase, next
            )))
        }
    }

    pub fn begin_step(&mut self) {
        self.phase_status = PhaseStatus::Running;
        self.phase_error = None;
    }

    pub fn finish_step(&mut self) {
        self.phase_status = PhaseStatus::Idle;
        self.phase_error = None;
    }

    /// 失败不推进阶段，只记录错误
    pub fn fail_step(&mut self, message: impl Into<String>) {
        self.phase_status = PhaseStatus::Failed;
        self.phase_error = Some(message.into());
    }

    /// 草稿被改写：回到 draft，丢弃缓存的评估 / 对比 / 参考答案结果
    pub fn reset_to_draft(&mut self) -> CoachResult<()> {
        self.transition(Phase::Draft)?;
        self.mode = SessionMode::Standard;
        self.live = None;
        self.phase_status = PhaseStatus::Idle;
        self.phase_error = None;
        self.last_eval = None;
        self.last_compose = None;
        self.last_compare = None;
        self.last_gap_highlight = None;
        self.last_refine = None;
        self.selected_answer_group_id = None;
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.mode == SessionMode::Live
    }

    pub fn set_live_status(&mut self, status: LiveStatus) {
        if let Some(live) = self.live.as_mut() {
            live.status = status;
            if status != LiveStatus::Active {
                live.stopped_at = Some(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval() -> EvalResult {
        EvalResult {
            feedback: "ok".into(),
            score: 3,
        }
    }

    #[test]
    fn test_main_path_is_accepted() {
        let mut state = ProgressState::new(Some("pour".into()));
        for next in [
            Phase::AwaitEvalConfirm,
            Phase::GapHighlight,
            Phase::Refine,
            Phase::AwaitFinalize,
            Phase::StructurePipeline,
            Phase::Learning,
            Phase::Completed,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state.phase, Phase::Completed);
    }

    #[test]
    fn test_cannot_skip_predecessors() {
        let mut state = ProgressState::new(None);
        assert!(matches!(
            state.transition(Phase::StructurePipeline),
            Err(CoachError::InvalidPhase(_))
        ));
        assert!(state.transition(Phase::Refine).is_err());
        assert_eq!(state.phase, Phase::Draft);

        state.transition(Phase::AwaitEvalConfirm).unwrap();
        assert!(state.transition(Phase::Learning).is_err());
    }

    #[test]
    fn test_live_branch() {
        let mut state = ProgressState::new(None);
        state.transition(Phase::Live).unwrap();
        assert!(state.transition(Phase::AwaitEvalConfirm).is_err());
        state.transition(Phase::StructurePipeline).unwrap();
        assert!(state.transition(Phase::Live).is_err());
    }

    #[test]
    fn test_reset_discards_cached_results() {
        let mut state = ProgressState::new(None);
        state.transition(Phase::AwaitEvalConfirm).unwrap();
        state.last_eval = Some(Stamped::now(eval()));
        state.fail_step("boom");

        state.reset_to_draft().unwrap();
        assert_eq!(state.phase, Phase::Draft);
        assert_eq!(state.phase_status, PhaseStatus::Idle);
        assert!(state.last_eval.is_none());
        assert!(state.phase_error.is_none());
    }

    #[test]
    fn test_reset_refused_after_finalize() {
        let mut state = ProgressState::new(None);
        state.phase = Phase::Learning;
        assert!(state.reset_to_draft().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_stamp() {
        let mut state = ProgressState::new(Some("dir".into()));
        state.last_eval = Some(Stamped::now(eval()));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "draft");
        assert_eq!(json["last_eval"]["score"], 3);
        assert!(json["last_eval"]["saved_at"].is_string());

        let back: ProgressState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
