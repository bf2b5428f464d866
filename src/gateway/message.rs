//! 实时对练连接的消息协议（JSON，按 type 字段区分）

use serde::{Deserialize, Serialize};

use crate::core::live::Advisory;

/// 客户端 → 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveClientMessage {
    /// 考生发言
    CandidateTurn {
        text: String,
        #[serde(default)]
        followup: Option<String>,
    },

    /// 结束对练（会话置为 stopped，连接关闭）
    Stop,
}

/// 服务端 → 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveServerMessage {
    /// 发言已落库
    Ack { turn: i64 },

    ExaminerReply { turn: i64, text: String },

    Notice { message: String },

    Warning { message: String },

    /// 出错不断开连接
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn: Option<i64>,
        message: String,
    },

    Stopped,
}

impl LiveServerMessage {
    pub fn error(turn: Option<i64>, message: impl Into<String>) -> Self {
        Self::Error {
            turn,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<Advisory> for LiveServerMessage {
    fn from(advisory: Advisory) -> Self {
        match advisory {
            Advisory::Notice(message) => Self::Notice { message },
            Advisory::Warning(message) => Self::Warning { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_parse() {
        let turn: LiveClientMessage =
            serde_json::from_str(r#"{"type":"candidate_turn","text":"Bonjour"}"#).unwrap();
        assert_eq!(
            turn,
            LiveClientMessage::CandidateTurn {
                text: "Bonjour".into(),
                followup: None
            }
        );
        let stop: LiveClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, LiveClientMessage::Stop);
        assert!(serde_json::from_str::<LiveClientMessage>(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&LiveServerMessage::ExaminerReply { turn: 2, text: "Oui".into() }.to_json())
                .unwrap();
        assert_eq!(json["type"], "examiner_reply");
        assert_eq!(json["turn"], 2);

        let error: serde_json::Value =
            serde_json::from_str(&LiveServerMessage::error(None, "reply pending").to_json()).unwrap();
        assert!(error.get("turn").is_none());
        assert_eq!(LiveServerMessage::Stopped.to_json(), r#"{"type":"stopped"}"#);
    }
}
