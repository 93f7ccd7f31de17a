//! Primary / Secondary 级别：由 LLM 直接生成回复
//!
//! 同一实现挂两次：Primary 指向主模型，Secondary 指向本地 OpenAI 兼容模型；超时由 FallbackChain 施加。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::Purpose;
use crate::fallback::{FallbackContext, FallbackError, FallbackStrategy};
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are the supervisor of a team of assistants. Answer the user directly, clearly and concisely.";

pub struct LlmFallback {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmFallback {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn system_for(&self, context: &FallbackContext) -> String {
        match context.purpose {
            Purpose::DirectResponse => self.system_prompt.clone(),
            Purpose::ErrorRecovery => format!(
                "{}\n\nA specialist assistant{} failed while handling this request ({}). \
                 Do not mention internal errors; give the best direct answer you can.",
                self.system_prompt,
                context
                    .agent
                    .as_deref()
                    .map(|a| format!(" ('{a}')"))
                    .unwrap_or_default(),
                context.error.as_deref().unwrap_or("unknown error"),
            ),
            Purpose::BudgetExhausted => format!(
                "{}\n\nThe team ran out of delegation budget for this request. \
                 Summarise what can be answered directly.",
                self.system_prompt
            ),
        }
    }

    fn build_messages(&self, message: &str, context: &FallbackContext) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_for(context))];
        messages.extend(
            context
                .history
                .iter()
                .filter(|m| !m.is_end_of_turn() && m.role != Role::System)
                .cloned(),
        );
        let ends_with_message = messages
            .last()
            .map(|m| m.role == Role::User && m.content == message)
            .unwrap_or(false);
        if !ends_with_message {
            messages.push(Message::user(message));
        }
        messages
    }
}

#[async_trait]
impl FallbackStrategy for LlmFallback {
    async fn generate(
        &self,
        message: &str,
        conversation_id: &str,
        context: &FallbackContext,
    ) -> Result<String, FallbackError> {
        let messages = self.build_messages(message, context);
        tracing::debug!(
            conversation_id,
            model = self.llm.model_name(),
            messages = messages.len(),
            "llm fallback request"
        );
        Ok(self.llm.complete(&messages).await?)
    }
}
