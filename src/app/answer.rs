//! 答案清洗与选项匹配
//!
//! 保守策略：先用原始回答匹配选项，匹配不到再轻度清洗后匹配，
//! 最后才尝试选项字母与判断题的语义词。

use std::sync::LazyLock;

use regex::Regex;

use crate::app::question::QuestionType;

static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(答案[是为：:]*|正确答案[是为：:]*|选择[：:]*)").expect("prefix regex")
});
static MARKDOWN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*`_]").expect("markdown regex"));
static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][.、)]\s*").expect("label regex"));
static PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[。，、；：！？\s]").expect("punct regex"));
static MULTI_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[#;；、\n]").expect("split regex"));

const POSITIVE_WORDS: [&str; 7] = ["正确", "对", "true", "√", "是", "yes", "成立"];
const NEGATIVE_WORDS: [&str; 7] = ["错误", "错", "false", "×", "否", "no", "不成立"];

/// 清洗后的答案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedAnswer {
    pub text: String,
    /// 答案是否落在给定选项内；没有选项的题目恒为 true
    pub matched: bool,
}

impl ProcessedAnswer {
    fn matched(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            matched: true,
        }
    }

    fn unmatched(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            matched: false,
        }
    }
}

/// 轻度清洗，只去掉明显的格式标记
pub fn clean_answer(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = PREFIX_RE.replace(text, "");
    let text = MARKDOWN_RE.replace_all(text.trim(), "");
    let text = LABEL_RE.replace(text.trim(), "");
    text.trim().to_string()
}

/// 答案与选项匹配：忽略大小写相等、互相包含、去标点后相等
pub fn match_option(answer: &str, option: &str) -> bool {
    let answer = answer.trim();
    let option = option.trim();
    if answer.is_empty() || option.is_empty() {
        return false;
    }

    let a = answer.to_lowercase();
    let o = option.to_lowercase();
    if a == o || o.contains(&a) || a.contains(&o) {
        return true;
    }

    PUNCT_RE.replace_all(&a, "") == PUNCT_RE.replace_all(&o, "")
}

fn find_option<'a>(answer: &str, options: &'a [String]) -> Option<&'a str> {
    options
        .iter()
        .find(|opt| match_option(answer, opt))
        .map(|opt| opt.trim())
}

fn exact_option<'a>(answer: &str, options: &'a [String]) -> Option<&'a str> {
    let a = answer.trim().to_lowercase();
    options
        .iter()
        .map(|opt| opt.trim())
        .find(|opt| !a.is_empty() && opt.to_lowercase() == a)
}

/// 完全相等优先，其次选项字母，最后才做包含匹配
fn pick_option<'a>(answer: &str, options: &'a [String]) -> Option<&'a str> {
    exact_option(answer, options)
        .or_else(|| letter_option(&clean_answer(answer), options))
        .or_else(|| find_option(answer, options))
}

/// 单独的选项字母（如 "B"）映射回选项内容
fn letter_option<'a>(answer: &str, options: &'a [String]) -> Option<&'a str> {
    let mut chars = answer.trim().chars();
    let c = chars.next()?;
    if chars.next().is_some() || !c.is_ascii_uppercase() {
        return None;
    }
    options.get((c as u8 - b'A') as usize).map(|o| o.trim())
}

/// 全是选项字母的片段（如 "ACD"）展开为多个选项
fn letters_options<'a>(answer: &str, options: &'a [String]) -> Option<Vec<&'a str>> {
    let answer = answer.trim();
    if answer.is_empty() || !answer.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    answer
        .chars()
        .map(|c| options.get((c as u8 - b'A') as usize).map(|o| o.trim()))
        .collect()
}

pub fn process_answer(raw_answer: &str, q_type: QuestionType, options: &[String]) -> ProcessedAnswer {
    let raw_answer = raw_answer.trim();
    if raw_answer.is_empty() {
        return ProcessedAnswer::unmatched("");
    }

    match q_type {
        QuestionType::Single => process_single_choice(raw_answer, options),
        QuestionType::Multiple => process_multiple_choice(raw_answer, options),
        QuestionType::Judgement => process_judgement(raw_answer, options),
        QuestionType::Completion => {
            let cleaned = clean_answer(raw_answer);
            ProcessedAnswer::matched(if cleaned.is_empty() { raw_answer.to_string() } else { cleaned })
        }
    }
}

fn fallback(raw_answer: &str, cleaned: String) -> ProcessedAnswer {
    ProcessedAnswer::unmatched(if cleaned.is_empty() { raw_answer.to_string() } else { cleaned })
}

fn process_single_choice(raw_answer: &str, options: &[String]) -> ProcessedAnswer {
    if options.is_empty() {
        return ProcessedAnswer::matched(clean_answer(raw_answer));
    }

    if let Some(opt) = pick_option(raw_answer, options) {
        return ProcessedAnswer::matched(opt);
    }

    let cleaned = clean_answer(raw_answer);
    if cleaned != raw_answer {
        if let Some(opt) = find_option(&cleaned, options) {
            return ProcessedAnswer::matched(opt);
        }
    }

    if let Some(opt) = letter_option(&cleaned, options) {
        return ProcessedAnswer::matched(opt);
    }

    fallback(raw_answer, cleaned)
}

fn process_multiple_choice(raw_answer: &str, options: &[String]) -> ProcessedAnswer {
    if options.is_empty() {
        return ProcessedAnswer::matched(clean_answer(raw_answer));
    }

    let segments: Vec<&str> = MULTI_SPLIT_RE
        .split(raw_answer)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut matched: Vec<&str> = Vec::new();
    // 第一轮：原始片段
    for seg in &segments {
        let found: Vec<&str> = match exact_option(seg, options) {
            Some(opt) => vec![opt],
            None => letters_options(&clean_answer(seg), options)
                .or_else(|| find_option(seg, options).map(|opt| vec![opt]))
                .unwrap_or_default(),
        };
        for opt in found {
            if !matched.contains(&opt) {
                matched.push(opt);
            }
        }
    }

    // 第二轮：清洗后的片段，选项字母兜底
    if matched.is_empty() {
        for seg in &segments {
            let cleaned = clean_answer(seg);
            let found: Vec<&str> = match find_option(&cleaned, options) {
                Some(opt) => vec![opt],
                None => letters_options(&cleaned, options).unwrap_or_default(),
            };
            for opt in found {
                if !matched.contains(&opt) {
                    matched.push(opt);
                }
            }
        }
    }

    if matched.is_empty() {
        return fallback(raw_answer, clean_answer(raw_answer));
    }
    ProcessedAnswer::matched(matched.join("#"))
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

fn process_judgement(raw_answer: &str, options: &[String]) -> ProcessedAnswer {
    if options.is_empty() {
        return ProcessedAnswer::matched(clean_answer(raw_answer));
    }

    if let Some(opt) = pick_option(raw_answer, options) {
        return ProcessedAnswer::matched(opt);
    }

    let cleaned = clean_answer(raw_answer);
    if cleaned != raw_answer {
        if let Some(opt) = find_option(&cleaned, options) {
            return ProcessedAnswer::matched(opt);
        }
    }

    // 语义匹配：只在倾向明确时使用
    let lower = cleaned.to_lowercase();
    let positive = contains_any(&lower, &POSITIVE_WORDS);
    let negative = contains_any(&lower, &NEGATIVE_WORDS);

    if positive && !negative {
        let opt = options
            .iter()
            .find(|o| contains_any(&o.to_lowercase(), &POSITIVE_WORDS))
            .or_else(|| options.first());
        if let Some(opt) = opt {
            return ProcessedAnswer::matched(opt.trim());
        }
    }
    if negative && !positive {
        let opt = options
            .iter()
            .find(|o| contains_any(&o.to_lowercase(), &NEGATIVE_WORDS))
            .or_else(|| options.get(1));
        if let Some(opt) = opt {
            return ProcessedAnswer::matched(opt.trim());
        }
    }

    if let Some(opt) = letter_option(&cleaned, options) {
        return ProcessedAnswer::matched(opt);
    }

    fallback(raw_answer, cleaned)
}
