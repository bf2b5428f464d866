//! 各步骤的系统提示词
//!
//! User 消息首行固定为 `[step:xxx]` 标记，其后是上下文 JSON；模型必须只输出一个 JSON 对象。

use crate::llm::schemas::GenerationStep;
use crate::llm::traits::Message;

const COMMON_RULES: &str = "你是 TCF Canada 口语考试的备考教练。只输出一个 JSON 对象，不要输出解释或 Markdown 以外的文字。";

fn step_instruction(step: GenerationStep) -> &'static str {
    match step {
        GenerationStep::Evaluate => {
            "评估考生草稿：给出中文反馈 feedback 与 0-5 的整数分 score。输出 {\"feedback\": str, \"score\": int}。"
        }
        GenerationStep::Compose => {
            "根据题目与推荐方向写一篇参考答案（法语）。输出 {\"title\": str, \"text\": str}。"
        }
        GenerationStep::Compare => {
            "将草稿与已有答案组比较：思路一致则 decision=reuse 并给出 matched_answer_group_id 与 matched_answer_id，否则 decision=new_group。输出 {\"decision\": \"reuse\"|\"new_group\", \"matched_answer_group_id\": int|null, \"matched_answer_id\": int|null, \"reason\": str}。"
        }
        GenerationStep::HighlightGaps => {
            "对照参考答案找出草稿的差距：coverage_score 为 0-100，missing_points / extra_points / language_issues 为字符串数组。"
        }
        GenerationStep::Refine => {
            "结合评估与差距改写草稿（法语），保持考生原意。输出 {\"refined_text\": str, \"notes\": [str]}。"
        }
        GenerationStep::Structure => {
            "把答案拆成段落，每段给出 role 与 summary，并按原文顺序拆成句子（只含 text，不改写原文）。输出 {\"paragraphs\": [{\"role\": str, \"summary\": str, \"sentences\": [{\"text\": str}]}]}。"
        }
        GenerationStep::TranslateSentences => {
            "翻译每个句子：index 与输入一致（从 1 开始），给出 translation_en、translation_zh 与 difficulty（A1-C2）。输出 {\"sentences\": [...]}。"
        }
        GenerationStep::ChunkSentence => {
            "把句子切成适合背诵的语块，语块文本必须逐字取自原句并覆盖句子主体。若提供了 previous_issues，请针对性修正。输出 {\"chunks\": [{\"text\": str, \"translation_en\": str, \"translation_zh\": str, \"chunk_type\": str}]}。"
        }
        GenerationStep::BuildChunkLexemes => {
            "为每个语块（chunk_index 与输入一致）提取至少一个核心词条：headword、sense_label、phrase（语块中的原文）、gloss、translation_en、translation_zh、pos_tags、difficulty。输出 {\"chunks\": [{\"chunk_index\": int, \"lexemes\": [...]}]}。"
        }
        GenerationStep::LiveReply => {
            "你是考官，正在进行 T2 互动对话。根据历史与考生最新发言，用自然的法语回应并推动对话。输出 {\"text\": str}。"
        }
    }
}

/// 渲染某一步骤的消息列表
pub fn render(step: GenerationStep, context_json: &str) -> Vec<Message> {
    vec![
        Message::system(format!("{}\n{}", COMMON_RULES, step_instruction(step))),
        Message::user(format!("[step:{}]\n{}", step.as_str(), context_json)),
    ]
}
