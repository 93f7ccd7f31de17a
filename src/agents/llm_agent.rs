//! 配置驱动的 LLM agent
//!
//! 每个 [[agents]] 条目对应一个 LlmAgent：system prompt + 共享 LLM 客户端。
//! 回复末行可带委派指示 `next_agent: <id>`（交给指定 agent）、`next_agent: supervisor`（交回重新选择）
//! 或 `END`（结束），指示行不会出现在最终回复里。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{Agent, AgentContext, AgentReply, NextStep};
use crate::config::AgentEntry;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{Message, MessageMetadata};

const DIRECTIVE_PREFIX: &str = "next_agent:";

/// 拆出末行的委派指示，返回（去掉指示后的正文，下一步）
pub fn parse_directive(output: &str) -> (String, NextStep) {
    let trimmed = output.trim_end();
    let (body, last) = match trimmed.rfind('\n') {
        Some(idx) => (&trimmed[..idx], trimmed[idx + 1..].trim()),
        None => ("", trimmed.trim()),
    };

    // 关键字不区分大小写，委派目标保留原样
    let next = if last.eq_ignore_ascii_case("end") {
        Some(NextStep::Finish)
    } else if last
        .get(..DIRECTIVE_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(DIRECTIVE_PREFIX))
    {
        let target = last[DIRECTIVE_PREFIX.len()..].trim();
        Some(match target.to_ascii_lowercase().as_str() {
            "" | "end" | "none" => NextStep::Finish,
            "supervisor" => NextStep::Reroute,
            _ => NextStep::Delegate(target.to_string()),
        })
    } else {
        None
    };

    match next {
        Some(step) => (body.trim_end().to_string(), step),
        None => (trimmed.to_string(), NextStep::Finish),
    }
}

pub struct LlmAgent {
    id: String,
    description: String,
    prompt: String,
    llm: Arc<dyn LlmClient>,
}

impl LlmAgent {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            prompt: prompt.into(),
            llm,
        }
    }

    pub fn from_entry(entry: &AgentEntry, llm: Arc<dyn LlmClient>) -> Self {
        let prompt = if entry.prompt.trim().is_empty() {
            format!(
                "You are the '{}' agent. {}\nAnswer the user's latest request within your specialty.",
                entry.id, entry.description
            )
        } else {
            entry.prompt.clone()
        };
        Self::new(entry.id.clone(), entry.description.clone(), prompt, llm)
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(
        &self,
        messages: &[Message],
        context: &AgentContext,
        _metadata: &MessageMetadata,
    ) -> Result<AgentReply, AgentError> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(Message::system(format!(
            "{}\n\nIf another agent should continue, end your reply with a final line `next_agent: <id>`; \
             use `next_agent: supervisor` to hand back, or `END` when you are done.",
            self.prompt
        )));
        full.extend(messages.iter().filter(|m| !m.is_end_of_turn()).cloned());

        let output = self.llm.complete(&full).await?;
        let (response, next) = parse_directive(&output);
        tracing::debug!(
            agent = %self.id,
            conversation_id = %context.conversation_id,
            next = ?next,
            "llm agent replied"
        );
        let (prompt_tokens, completion_tokens, _) = self.llm.token_usage();
        Ok(AgentReply {
            response,
            metadata: MessageMetadata::from([
                ("model".to_string(), self.llm.model_name().into()),
                ("prompt_tokens".to_string(), prompt_tokens.into()),
                ("completion_tokens".to_string(), completion_tokens.into()),
            ]),
            next,
        })
    }
}
