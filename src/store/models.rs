//! 持久化实体
//!
//! 枚举以 TEXT 存储（as_str / parse），JSON 字段以 TEXT 存储，时间为 RFC3339（UTC，微秒）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state::ProgressState;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(SessionType {
    First => "first",
    Review => "review",
});

text_enum!(SessionStatus {
    Draft => "draft",
    InProgress => "in_progress",
    Completed => "completed",
});

text_enum!(TaskStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

text_enum!(TaskType {
    Eval => "eval",
    Compose => "compose",
    Compare => "compare",
    GapHighlight => "gap_highlight",
    Refine => "refine",
    StructurePipeline => "structure_pipeline",
    Structure => "structure",
    SentenceTranslate => "sentence_translate",
    ChunkSentence => "chunk_sentence",
    ChunkLexeme => "chunk_lexeme",
    LiveReply => "live_reply",
});

text_enum!(FlashcardEntity {
    Sentence => "sentence",
    Chunk => "chunk",
    Lexeme => "lexeme",
});

// ---------------------------------------------------------------------------
// 题目与答案
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub stance: Option<String>,
    #[serde(default)]
    pub structure: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionPlan {
    #[serde(default)]
    pub recommended: Option<Direction>,
    #[serde(default)]
    pub alternatives: Vec<Direction>,
}

impl DirectionPlan {
    /// 推荐方向的标题；未解析时为 None
    pub fn resolved_direction(&self) -> Option<&str> {
        self.recommended
            .as_ref()
            .map(|d| d.title.trim())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    /// T2 = 互动对话，T3 = 独白
    pub question_type: String,
    pub title: String,
    pub body: String,
    pub direction_plan: DirectionPlan,
    pub created_at: DateTime<Utc>,
}

impl Question {
    pub fn is_dialogue(&self) -> bool {
        self.question_type.eq_ignore_ascii_case("T2")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewQuestion {
    pub question_type: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub direction_plan: DirectionPlan,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerGroup {
    pub id: i64,
    pub question_id: i64,
    pub slug: String,
    pub title: String,
    pub descriptor: Option<String>,
    pub dialogue_profile: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub answer_group_id: i64,
    pub version_index: i64,
    pub status: String,
    pub title: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnswerGroupWithAnswers {
    #[serde(flatten)]
    pub group: AnswerGroup,
    pub answers: Vec<Answer>,
}

// ---------------------------------------------------------------------------
// 会话、任务、审计
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct Session {
    pub id: i64,
    pub question_id: i64,
    pub answer_id: Option<i64>,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub user_answer_draft: Option<String>,
    pub progress_state: ProgressState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Task 的作用域：只属于一个 Session 或一个 Answer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskScope {
    Session(i64),
    Answer(i64),
}

impl TaskScope {
    pub fn session_id(&self) -> Option<i64> {
        match self {
            Self::Session(id) => Some(*id),
            Self::Answer(_) => None,
        }
    }

    pub fn answer_id(&self) -> Option<i64> {
        match self {
            Self::Answer(id) => Some(*id),
            Self::Session(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Task {
    pub id: i64,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: Value,
    pub result_summary: Value,
    pub error_message: Option<String>,
    pub session_id: Option<i64>,
    pub answer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn scope(&self) -> Option<TaskScope> {
        match (self.session_id, self.answer_id) {
            (Some(id), None) => Some(TaskScope::Session(id)),
            (None, Some(id)) => Some(TaskScope::Answer(id)),
            _ => None,
        }
    }

    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TaskFilter {
    pub session_id: Option<i64>,
    pub answer_id: Option<i64>,
    pub question_id: Option<i64>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: Option<i64>,
    pub task_id: Option<i64>,
    pub purpose: String,
    pub messages: Value,
    pub result: Value,
    pub model_name: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewConversation {
    pub session_id: Option<i64>,
    pub task_id: Option<i64>,
    pub purpose: String,
    pub messages: Value,
    pub result: Value,
    pub model_name: Option<String>,
    pub latency_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LiveTurn {
    pub id: i64,
    pub session_id: i64,
    pub turn_index: i64,
    pub candidate_query: String,
    pub examiner_reply: Option<String>,
    pub candidate_followup: Option<String>,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 结构拆解
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Paragraph {
    pub id: i64,
    pub answer_id: i64,
    pub order_index: i64,
    pub role_label: Option<String>,
    pub summary: Option<String>,
    pub extra: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sentence {
    pub id: i64,
    pub paragraph_id: i64,
    pub order_index: i64,
    pub text: String,
    pub translation_en: Option<String>,
    pub translation_zh: Option<String>,
    pub difficulty: Option<String>,
    /// 质量门拒绝时记录 chunk_issues / chunk_candidates / lexeme_issues
    pub extra: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SentenceChunk {
    pub id: i64,
    pub sentence_id: i64,
    pub order_index: i64,
    pub text: String,
    pub translation_en: Option<String>,
    pub translation_zh: Option<String>,
    pub chunk_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Lexeme {
    pub id: i64,
    pub headword: String,
    pub sense_label: Option<String>,
    pub gloss: Option<String>,
    pub translation_en: Option<String>,
    pub translation_zh: Option<String>,
    pub pos_tags: Option<String>,
    pub difficulty: Option<String>,
    pub hash: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChunkLexeme {
    pub id: i64,
    pub chunk_id: i64,
    pub lexeme_id: i64,
    pub order_index: i64,
    pub role: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChunkLexemeNode {
    #[serde(flatten)]
    pub link: ChunkLexeme,
    pub lexeme: Lexeme,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChunkNode {
    #[serde(flatten)]
    pub chunk: SentenceChunk,
    pub lexemes: Vec<ChunkLexemeNode>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SentenceNode {
    #[serde(flatten)]
    pub sentence: Sentence,
    pub chunks: Vec<ChunkNode>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ParagraphNode {
    #[serde(flatten)]
    pub paragraph: Paragraph,
    pub sentences: Vec<SentenceNode>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Flashcard {
    pub id: i64,
    pub entity_type: FlashcardEntity,
    pub entity_id: i64,
    pub last_score: Option<i64>,
    pub due_at: DateTime<Utc>,
    pub streak: i64,
    pub interval_days: i64,
    pub updated_at: DateTime<Utc>,
}
