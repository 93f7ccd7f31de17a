//! 意图启发式：按关键词把用户消息粗分为问候 / 告别 / 致谢 / 求助 / 提问 / 其它
//!
//! 供 RuleBased 状态机与 Emergency 模板查表使用；中英文关键词并存。

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Greeting,
    Farewell,
    Thanks,
    /// 询问能做什么 / 怎么用
    Help,
    Question,
    Generic,
}

pub fn classify_intent(message: &str) -> Intent {
    let content = message.trim().to_lowercase();
    if content.is_empty() {
        return Intent::Generic;
    }

    if contains_help_keywords(&content) {
        return Intent::Help;
    }
    if contains_thanks_keywords(&content) {
        return Intent::Thanks;
    }
    if contains_farewell_keywords(&content) {
        return Intent::Farewell;
    }
    // 问候只看短消息，避免「hi, can you refactor ...」被当作寒暄
    if content.chars().count() <= 40 && contains_greeting_keywords(&content) {
        return Intent::Greeting;
    }
    if content.ends_with('?') || content.ends_with('？') || contains_question_keywords(&content) {
        return Intent::Question;
    }
    Intent::Generic
}

fn words(content: &str) -> impl Iterator<Item = &str> {
    content
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
}

fn has_word(content: &str, keywords: &[&str]) -> bool {
    words(content).any(|w| keywords.contains(&w))
}

fn contains_greeting_keywords(content: &str) -> bool {
    has_word(content, &["hello", "hi", "hey", "howdy", "greetings", "yo"])
        || ["good morning", "good afternoon", "good evening", "你好", "您好", "嗨", "早上好"]
            .iter()
            .any(|k| content.contains(k))
}

fn contains_farewell_keywords(content: &str) -> bool {
    has_word(content, &["bye", "goodbye", "farewell", "cya"])
        || ["see you", "good night", "再见", "拜拜", "晚安"]
            .iter()
            .any(|k| content.contains(k))
}

fn contains_thanks_keywords(content: &str) -> bool {
    has_word(content, &["thanks", "thank", "thx", "ty", "cheers"])
        || ["谢谢", "多谢", "感谢"].iter().any(|k| content.contains(k))
}

fn contains_help_keywords(content: &str) -> bool {
    [
        "what can you do",
        "how do i use",
        "how to use you",
        "help me get started",
        "你能做什么",
        "怎么用",
        "帮助",
    ]
    .iter()
    .any(|k| content.contains(k))
        || content == "help"
}

fn contains_question_keywords(content: &str) -> bool {
    (has_word(
        content,
        &["what", "why", "how", "when", "where", "who", "which", "can", "could", "is", "are"],
    ) && content.split_whitespace().count() > 1)
        || ["什么", "为什么", "怎么", "如何", "吗", "哪"]
            .iter()
            .any(|k| content.contains(k))
}
