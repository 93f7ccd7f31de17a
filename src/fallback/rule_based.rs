//! RuleBased 级别：规则驱动的有限状态机
//!
//! 对话状态由上下文推出（第几轮、调用目的、意图），转移表给出一条回复或不给（NoRule -> 前进到 Emergency）。
//! 不调用任何外部服务，只能回答寒暄、求助、故障说明这类不需要知识的话题。

use async_trait::async_trait;

use crate::core::Purpose;
use crate::fallback::intent::{classify_intent, Intent};
use crate::fallback::{FallbackContext, FallbackError, FallbackStrategy};

/// 主题预览最大字符数
const TOPIC_PREVIEW_CHARS: usize = 60;

/// 状态机所处的对话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// 会话第一轮
    Opening,
    /// 后续轮次
    Engaged,
    /// agent 失败后的恢复
    Recovering,
    /// 派发预算耗尽
    Exhausted,
}

impl DialogState {
    pub fn from_context(context: &FallbackContext) -> Self {
        match context.purpose {
            Purpose::ErrorRecovery => DialogState::Recovering,
            Purpose::BudgetExhausted => DialogState::Exhausted,
            Purpose::DirectResponse if context.user_turn <= 1 => DialogState::Opening,
            Purpose::DirectResponse => DialogState::Engaged,
        }
    }
}

fn topic_preview(message: &str) -> String {
    let flat = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > TOPIC_PREVIEW_CHARS {
        format!("{}...", flat.chars().take(TOPIC_PREVIEW_CHARS).collect::<String>())
    } else {
        flat
    }
}

fn capabilities(agents: &[String]) -> String {
    if agents.is_empty() {
        "I can answer general questions directly.".to_string()
    } else {
        format!(
            "I can answer questions directly or bring in a specialist: {}.",
            agents.join(", ")
        )
    }
}

/// 转移表：（状态, 意图）-> 回复
pub fn transition(
    state: DialogState,
    intent: Intent,
    message: &str,
    context: &FallbackContext,
) -> Option<String> {
    use DialogState::*;
    use Intent::*;

    match (state, intent) {
        (_, Thanks) => Some("You're welcome! Anything else I can help with?".to_string()),
        (_, Farewell) => Some("Goodbye! Your conversation is saved for next time.".to_string()),
        (_, Help) => Some(format!(
            "{} Just describe what you need.",
            capabilities(&context.available_agents)
        )),
        (Opening, Greeting) => Some(format!(
            "Hello! {} What would you like to do?",
            capabilities(&context.available_agents)
        )),
        (Engaged, Greeting) => Some("Hi again! What else can I help with?".to_string()),
        (Recovering, Greeting) => {
            Some("Hello! I hit a snag a moment ago, but I'm ready to continue.".to_string())
        }
        (Recovering, Question | Generic) if !message.trim().is_empty() => Some(format!(
            "I ran into a problem while working on \"{}\". Please try again, or rephrase the request \
             and I'll route it differently.",
            topic_preview(message)
        )),
        (Exhausted, Question | Generic) if !message.trim().is_empty() => Some(format!(
            "\"{}\" needed more steps than I'm allowed in a single turn. \
             Could you split it into smaller requests?",
            topic_preview(message)
        )),
        // 实质性问题规则层回答不了
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct RuleBasedResponder;

impl RuleBasedResponder {
    pub fn new() -> Self {
        Self
    }

    pub fn respond(&self, message: &str, context: &FallbackContext) -> Option<String> {
        let state = DialogState::from_context(context);
        let intent = classify_intent(message);
        tracing::debug!(?state, ?intent, "rule based transition");
        transition(state, intent, message, context)
    }
}

#[async_trait]
impl FallbackStrategy for RuleBasedResponder {
    async fn generate(
        &self,
        message: &str,
        _conversation_id: &str,
        context: &FallbackContext,
    ) -> Result<String, FallbackError> {
        self.respond(message, context).ok_or(FallbackError::NoRule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[test]
    fn test_dialog_state_from_context() {
        let first = FallbackContext::new(Purpose::DirectResponse).with_history(vec![Message::user("hi")]);
        assert_eq!(DialogState::from_context(&first), DialogState::Opening);

        let later = FallbackContext::new(Purpose::DirectResponse).with_history(vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("hi again"),
        ]);
        assert_eq!(DialogState::from_context(&later), DialogState::Engaged);

        let rec = FallbackContext::new(Purpose::ErrorRecovery);
        assert_eq!(DialogState::from_context(&rec), DialogState::Recovering);
    }

    #[test]
    fn test_opening_greeting_lists_agents() {
        let ctx = FallbackContext::new(Purpose::DirectResponse)
            .with_agents(vec!["code".into(), "research".into()]);
        let out = RuleBasedResponder.respond("Hello", &ctx).unwrap();
        assert!(out.starts_with("Hello!"));
        assert!(out.contains("code, research"));
    }

    #[test]
    fn test_substantive_question_has_no_rule() {
        let ctx = FallbackContext::new(Purpose::DirectResponse);
        assert_eq!(RuleBasedResponder.respond("what is a monad?", &ctx), None);
    }

    #[test]
    fn test_recovery_mentions_topic() {
        let ctx = FallbackContext::new(Purpose::ErrorRecovery);
        let out = RuleBasedResponder
            .respond("summarize   the quarterly report", &ctx)
            .unwrap();
        assert!(out.contains("\"summarize the quarterly report\""));
    }

    #[tokio::test]
    async fn test_strategy_reports_no_rule() {
        let ctx = FallbackContext::new(Purpose::DirectResponse);
        let err = RuleBasedResponder
            .generate("explain lifetimes", "c1", &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, FallbackError::NoRule);
    }
}
