//! 结构化输出的质量门与词条去重哈希

use sha2::{Digest, Sha256};

use crate::llm::schemas::{ChunkCandidate, ChunkLexemeGroup, LexemeCandidate};

/// 质量门结论
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Accepted,
    Rejected(Vec<String>),
}

impl GateVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// 小写、去首尾空白、折叠内部空白
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// (headword, sense_label, phrase) 的去重哈希；phrase 缺省时取 headword
pub fn lexeme_hash(headword: &str, sense_label: Option<&str>, phrase: Option<&str>) -> String {
    let head = normalize(headword);
    let sense = normalize(sense_label.unwrap_or_default());
    let phrase = phrase
        .map(normalize)
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| head.clone());

    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", head, sense, phrase).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn candidate_hash(candidate: &LexemeCandidate) -> String {
    lexeme_hash(
        &candidate.headword,
        candidate.sense_label.as_deref(),
        candidate.phrase.as_deref(),
    )
}

fn char_len(text: &str) -> usize {
    normalize(text).chars().count()
}

/// 语块覆盖率：拼接后的字符数 / 句子字符数（均按折叠空白后计算）
pub fn chunk_coverage(sentence: &str, chunks: &[ChunkCandidate]) -> f64 {
    let total = char_len(sentence);
    if total == 0 {
        return 0.0;
    }
    let covered: usize = chunks.iter().map(|c| char_len(&c.text)).sum();
    covered as f64 / total as f64
}

pub fn check_chunks(sentence: &str, chunks: &[ChunkCandidate], min_coverage: f64) -> GateVerdict {
    let mut issues = Vec::new();
    if chunks.is_empty() {
        issues.push("no chunks returned".to_string());
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.text.trim().is_empty() {
            issues.push(format!("chunk {} is empty", i + 1));
        }
    }
    let coverage = chunk_coverage(sentence, chunks);
    if coverage < min_coverage {
        issues.push(format!(
            "chunks cover {:.0}% of the sentence, need at least {:.0}%",
            coverage * 100.0,
            min_coverage * 100.0
        ));
    }

    if issues.is_empty() {
        GateVerdict::Accepted
    } else {
        GateVerdict::Rejected(issues)
    }
}

/// 每个语块（1 起始序号）至少分到一个 headword 非空的词条；越界序号忽略
pub fn check_chunk_lexemes(chunk_texts: &[String], groups: &[ChunkLexemeGroup]) -> GateVerdict {
    let issues: Vec<String> = chunk_texts
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            let index = *i as i64 + 1;
            !groups.iter().any(|g| {
                g.chunk_index == index && g.lexemes.iter().any(|l| !l.headword.trim().is_empty())
            })
        })
        .map(|(i, text)| format!("chunk {} \"{}\" has no lexeme", i + 1, text))
        .collect();

    if issues.is_empty() {
        GateVerdict::Accepted
    } else {
        GateVerdict::Rejected(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> ChunkCandidate {
        ChunkCandidate {
            text: text.into(),
            translation_en: None,
            translation_zh: None,
            chunk_type: None,
        }
    }

    fn lexeme(headword: &str) -> LexemeCandidate {
        LexemeCandidate {
            headword: headword.into(),
            sense_label: None,
            phrase: None,
            gloss: None,
            translation_en: None,
            translation_zh: None,
            pos_tags: None,
            difficulty: None,
            role: None,
        }
    }

    #[test]
    fn test_hash_normalizes_and_defaults_phrase() {
        let a = lexeme_hash("  Prendre ", Some("Décision"), None);
        let b = lexeme_hash("prendre", Some("décision"), Some("PRENDRE"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_sense = lexeme_hash("prendre", Some("transport"), None);
        assert_ne!(a, other_sense);
    }

    #[test]
    fn test_coverage_gate_boundary() {
        let sentence = "abcdefghij";
        assert!(check_chunks(sentence, &[chunk("abcd")], 0.4).is_accepted());
        match check_chunks(sentence, &[chunk("abc")], 0.4) {
            GateVerdict::Rejected(issues) => assert!(issues[0].contains("30%")),
            GateVerdict::Accepted => panic!("30% must be rejected"),
        }
        assert!(!check_chunks(sentence, &[], 0.4).is_accepted());
    }

    #[test]
    fn test_lexeme_gate_reports_each_unmatched_chunk() {
        let chunks = vec!["je pense".to_string(), "que".to_string(), "c'est bien".to_string()];
        let groups = vec![
            ChunkLexemeGroup {
                chunk_index: 1,
                lexemes: vec![lexeme("penser")],
            },
            ChunkLexemeGroup {
                chunk_index: 2,
                lexemes: vec![lexeme(" ")],
            },
            ChunkLexemeGroup {
                chunk_index: 9,
                lexemes: vec![lexeme("hors")],
            },
        ];
        match check_chunk_lexemes(&chunks, &groups) {
            GateVerdict::Rejected(issues) => {
                assert_eq!(issues.len(), 2);
                assert!(issues[0].starts_with("chunk 2"));
                assert!(issues[1].starts_with("chunk 3"));
            }
            GateVerdict::Accepted => panic!("unmatched chunks must be rejected"),
        }
    }
}
