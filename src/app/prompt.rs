//! 按题型构建提示词

use crate::app::question::QuestionType;

/// 纯文本请求的系统消息
pub const SYSTEM_PROMPT_TEXT: &str = "你是一个专业、严谨的答题助手。你必须根据题目和选项给出准确的答案，严格按照要求的格式输出，不要有任何多余的内容。";

/// 带图片请求的系统消息
pub const SYSTEM_PROMPT_IMAGE: &str = "你是一个专业、严谨的答题助手。你必须根据题目、图片和选项给出准确的答案，严格按照要求的格式输出，不要有任何多余的内容。";

/// 选项编号：A. xxx
fn lettered_options(options: &[String]) -> String {
    options
        .iter()
        .enumerate()
        .map(|(i, opt)| format!("{}. {}", option_letter(i), opt))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 第 i 个选项的字母，超过 26 个时继续沿用 ASCII 顺序
pub fn option_letter(index: usize) -> char {
    char::from_u32(65 + index as u32).unwrap_or('?')
}

pub fn build_prompt(question: &str, options: &[String], q_type: QuestionType) -> String {
    match q_type {
        QuestionType::Single => single_choice(question, options),
        QuestionType::Multiple => multiple_choice(question, options),
        QuestionType::Judgement => judgement(question, options),
        QuestionType::Completion => completion(question),
    }
}

fn single_choice(question: &str, options: &[String]) -> String {
    format!(
        r#"你是一个专业的在线考试答题助手，请严格按照要求回答。

【题目类型】单选题（只能选择一个正确答案）

【题目】
{question}

【选项】
{options}

【回答要求】
1. 仔细分析题目和所有选项
2. 只选择一个最正确的答案
3. 必须从给定的选项中选择，不能自己编造
4. 回答格式：直接输出选项内容，不要包含A、B、C等标识符
5. 只输出答案内容，不要有任何解释、分析或额外文字

【示例】
如果正确答案是选项"北京"，则只输出：北京

现在请回答上述题目："#,
        options = lettered_options(options)
    )
}

fn multiple_choice(question: &str, options: &[String]) -> String {
    format!(
        r#"你是一个专业的在线考试答题助手，请严格按照要求回答。

【题目类型】多选题（可能有多个正确答案）

【题目】
{question}

【选项】
{options}

【回答要求】
1. 仔细分析题目，找出所有正确的选项
2. 多选题通常有2个或以上的正确答案
3. 必须从给定的选项中选择，不能自己编造
4. 多个答案之间用井号#分隔
5. 回答格式：选项1#选项2#选项3（不要包含A、B、C等标识符）
6. 只输出答案内容，不要有任何解释、分析或额外文字

【示例】
如果正确答案是"北京"和"上海"两个选项，则输出：北京#上海

现在请回答上述题目："#,
        options = lettered_options(options)
    )
}

fn judgement(question: &str, options: &[String]) -> String {
    let choices = if options.is_empty() {
        "正确 / 错误".to_string()
    } else {
        options.join("\n")
    };
    format!(
        r#"你是一个专业的在线考试答题助手，请严格按照要求回答。

【题目类型】判断题（判断对错/是否）

【题目】
{question}

【可选答案】
{choices}

【回答要求】
1. 仔细分析题目陈述是否正确
2. 必须从给定的选项中选择（如：正确/错误、对/错、是/否、√/×等）
3. 只输出一个判断结果
4. 不要有任何解释、分析或额外文字

【示例】
如果题目陈述正确，且选项中有"正确"，则输出：正确

现在请判断上述题目："#
    )
}

fn completion(question: &str) -> String {
    format!(
        r#"你是一个专业的在线考试答题助手，请严格按照要求回答。

【题目类型】填空题

【题目】
{question}

【回答要求】
1. 仔细理解题目要求
2. 给出准确、简洁的答案
3. 如果有多个空，答案之间用井号#分隔
4. 答案要具体、准确，避免模糊表述
5. 只输出答案内容，不要有序号、解释或额外文字

【示例】
- 单空题：如果答案是"北京"，则输出：北京
- 多空题：如果答案是"氢"和"氧"，则输出：氢#氧

现在请回答上述填空题："#
    )
}
