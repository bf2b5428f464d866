//! 核心编排层：错误、阶段状态、任务台账、状态机、结构拆解、质量门、实时对练、关闭信号

pub mod error;
pub mod ledger;
pub mod live;
pub mod orchestrator;
pub mod pipeline;
pub mod quality;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::{CoachError, CoachResult};
pub use ledger::{best_effort, TaskLedger};
pub use live::{render_transcript, Advisory, ConnectionState, LiveController};
pub use orchestrator::{
    AnswerHistory, CreateSession, FinalizeOutcome, FinalizeRequest, Orchestrator, SessionHistory,
};
pub use pipeline::{PipelineSummary, StructurePipeline};
pub use shutdown::{
    CloseStore, DrainLiveReplies, ShutdownCoordinator, ShutdownManager, ShutdownReason, ShutdownStep,
};
pub use state::{Phase, PhaseStatus, ProgressState};
pub use task_scheduler::ReplyWorkerPool;
