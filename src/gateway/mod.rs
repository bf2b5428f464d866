//! 实时对练网关
//!
//! - **hub**：WebSocket 监听与每连接的读循环（发言落库 → ack → 线程池生成回复 → 回写）
//! - **message**：客户端 / 服务端 JSON 消息

mod hub;
mod message;

pub use hub::{parse_session_path, HubConfig, LiveHub};
pub use message::{LiveClientMessage, LiveServerMessage};
