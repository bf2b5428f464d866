//! 生成步骤的结构化输入（上下文）与输出
//!
//! 上下文既用于渲染 Prompt，也原样写入 Conversation.messages 作为审计记录。

use serde::{Deserialize, Serialize};

/// 生成协作方的各个步骤
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStep {
    Evaluate,
    Compose,
    Compare,
    HighlightGaps,
    Refine,
    Structure,
    TranslateSentences,
    ChunkSentence,
    BuildChunkLexemes,
    LiveReply,
}

impl GenerationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluate => "evaluate",
            Self::Compose => "compose",
            Self::Compare => "compare",
            Self::HighlightGaps => "highlight_gaps",
            Self::Refine => "refine",
            Self::Structure => "structure",
            Self::TranslateSentences => "translate_sentences",
            Self::ChunkSentence => "chunk_sentence",
            Self::BuildChunkLexemes => "build_chunk_lexemes",
            Self::LiveReply => "live_reply",
        }
    }
}

// ---------------------------------------------------------------------------
// 上下文
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionContext {
    pub question_type: String,
    pub title: String,
    pub body: String,
    /// 已确定的推荐作答方向
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftContext {
    pub question: QuestionContext,
    pub draft: String,
}

/// 已有答案组中的最新版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSummary {
    pub answer_group_id: i64,
    pub answer_id: i64,
    pub group_title: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareContext {
    pub question: QuestionContext,
    pub draft: String,
    pub candidates: Vec<AnswerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapContext {
    pub question: QuestionContext,
    pub draft: String,
    pub reference: AnswerSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineContext {
    pub question: QuestionContext,
    pub draft: String,
    pub eval: Option<EvalResult>,
    pub gaps: Option<GapHighlightResult>,
    pub reference_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureContext {
    pub answer_title: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedText {
    /// 从 1 开始
    pub index: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateContext {
    pub sentences: Vec<IndexedText>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkContext {
    pub sentence: String,
    pub translation: Option<String>,
    /// 上一次被质量门拒绝的候选与问题，供重试参考
    pub previous_candidates: Vec<String>,
    pub previous_issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLexemeContext {
    pub sentence: String,
    pub chunks: Vec<IndexedText>,
    pub previous_issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveExchange {
    pub candidate: String,
    pub examiner: Option<String>,
    pub followup: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveReplyContext {
    pub question: QuestionContext,
    pub history: Vec<LiveExchange>,
    pub candidate_query: String,
    pub candidate_followup: Option<String>,
}

// ---------------------------------------------------------------------------
// 输出
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub feedback: String,
    /// 0-5
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeResult {
    pub title: String,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareDecision {
    Reuse,
    NewGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareResult {
    pub decision: CompareDecision,
    #[serde(default)]
    pub matched_answer_group_id: Option<i64>,
    #[serde(default)]
    pub matched_answer_id: Option<i64>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapHighlightResult {
    /// 0-100
    pub coverage_score: f64,
    #[serde(default)]
    pub missing_points: Vec<String>,
    #[serde(default)]
    pub extra_points: Vec<String>,
    #[serde(default)]
    pub language_issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineResult {
    pub refined_text: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredSentence {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredParagraph {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sentences: Vec<StructuredSentence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureResult {
    pub paragraphs: Vec<StructuredParagraph>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceTranslation {
    /// 对应 TranslateContext.sentences 的 index（从 1 开始）
    pub index: i64,
    #[serde(default)]
    pub translation_en: Option<String>,
    #[serde(default)]
    pub translation_zh: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceTranslationResult {
    pub sentences: Vec<SentenceTranslation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkCandidate {
    pub text: String,
    #[serde(default)]
    pub translation_en: Option<String>,
    #[serde(default)]
    pub translation_zh: Option<String>,
    #[serde(default)]
    pub chunk_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunks: Vec<ChunkCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexemeCandidate {
    pub headword: String,
    #[serde(default)]
    pub sense_label: Option<String>,
    /// 词条在语块中的原始短语，缺省时按 headword 计
    #[serde(default)]
    pub phrase: Option<String>,
    #[serde(default)]
    pub gloss: Option<String>,
    #[serde(default)]
    pub translation_en: Option<String>,
    #[serde(default)]
    pub translation_zh: Option<String>,
    #[serde(default)]
    pub pos_tags: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkLexemeGroup {
    /// 对应 ChunkLexemeContext.chunks 的 index（从 1 开始）
    pub chunk_index: i64,
    #[serde(default)]
    pub lexemes: Vec<LexemeCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkLexemeResult {
    pub chunks: Vec<ChunkLexemeGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveReply {
    pub text: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}
