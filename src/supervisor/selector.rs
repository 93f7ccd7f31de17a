//! Agent 选择：Routing 阶段决定派发给哪个 agent，或由 supervisor 直接作答（None）
//!
//! - NoAgentSelector：总是直接作答
//! - KeywordAgentSelector：按 [[agents]].keywords 匹配最新用户消息
//! - LlmAgentSelector：让 LLM 从 agent 列表中挑一个 id，回复 none 表示直接作答

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AgentEntry;
use crate::core::SupervisorError;
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

#[async_trait]
pub trait AgentSelector: Send + Sync {
    /// 返回 Some(agent_id) 派发，None 直接作答；Err 由路由器转为直接作答
    async fn select_agent(
        &self,
        messages: &[Message],
        available: &[String],
    ) -> Result<Option<String>, SupervisorError>;
}

/// 最新用户消息之后出现的消息（即本轮已产生的 agent 输出）
fn current_turn(messages: &[Message]) -> (&str, &[Message]) {
    match messages.iter().rposition(|m| m.role == Role::User) {
        Some(i) => (messages[i].content.as_str(), &messages[i + 1..]),
        None => ("", &[]),
    }
}

/// 本轮已经回复过的 agent
fn replied_this_turn(messages: &[Message]) -> Vec<String> {
    let (_, turn) = current_turn(messages);
    turn.iter()
        .filter_map(|m| m.agent_id().map(String::from))
        .collect()
}

pub struct NoAgentSelector;

#[async_trait]
impl AgentSelector for NoAgentSelector {
    async fn select_agent(
        &self,
        _messages: &[Message],
        _available: &[String],
    ) -> Result<Option<String>, SupervisorError> {
        Ok(None)
    }
}

/// 关键词选择器：规则按配置顺序匹配，首个命中的可用 agent 胜出；
/// 本轮已回复过的 agent 不再被选中（重新路由时交给别人或直接作答）
pub struct KeywordAgentSelector {
    rules: Vec<(String, Vec<String>)>,
}

impl KeywordAgentSelector {
    pub fn new(rules: Vec<(String, Vec<String>)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(id, kws)| {
                let kws = kws
                    .into_iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                (id, kws)
            })
            .collect();
        Self { rules }
    }

    pub fn from_entries(entries: &[AgentEntry]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|e| (e.id.clone(), e.keywords.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl AgentSelector for KeywordAgentSelector {
    async fn select_agent(
        &self,
        messages: &[Message],
        available: &[String],
    ) -> Result<Option<String>, SupervisorError> {
        let (user, _) = current_turn(messages);
        let text = user.to_lowercase();
        let replied = replied_this_turn(messages);
        let hit = self.rules.iter().find(|(id, kws)| {
            available.contains(id)
                && !replied.contains(id)
                && kws.iter().any(|k| text.contains(k.as_str()))
        });
        Ok(hit.map(|(id, _)| id.clone()))
    }
}

/// LLM 路由：只回复 agent id 或 none
pub struct LlmAgentSelector {
    llm: Arc<dyn LlmClient>,
    descriptions: Vec<(String, String)>,
}

impl LlmAgentSelector {
    pub fn new(llm: Arc<dyn LlmClient>, descriptions: Vec<(String, String)>) -> Self {
        Self { llm, descriptions }
    }

    fn build_prompt(&self, messages: &[Message], available: &[String]) -> Vec<Message> {
        let list_text = self
            .descriptions
            .iter()
            .filter(|(id, _)| available.contains(id))
            .map(|(id, desc)| format!("- {}: {}", id, desc))
            .collect::<Vec<_>>()
            .join("\n");
        let system = format!(
            "You are a router. Given the user's request and the agents below, choose the single most suitable agent.\n\
             Reply with ONLY the agent id. Reply \"none\" if you can answer directly or the request is already handled.\n\
             No explanation, no punctuation.\n\nAvailable agents:\n{}",
            list_text
        );

        let (user, turn) = current_turn(messages);
        let mut prompt = format!("User request:\n{}", user);
        for m in turn.iter().filter(|m| m.role == Role::Agent) {
            prompt.push_str(&format!(
                "\n\nOutput from agent {}:\n{}",
                m.agent_id().unwrap_or("unknown"),
                m.content
            ));
        }
        vec![Message::system(system), Message::user(prompt)]
    }
}

#[async_trait]
impl AgentSelector for LlmAgentSelector {
    async fn select_agent(
        &self,
        messages: &[Message],
        available: &[String],
    ) -> Result<Option<String>, SupervisorError> {
        if available.is_empty() {
            return Ok(None);
        }
        let output = self
            .llm
            .complete(&self.build_prompt(messages, available))
            .await
            .map_err(|e| SupervisorError::Routing(e.to_string()))?;
        let id = output
            .trim()
            .split(|c: char| c.is_whitespace() || c == '.' || c == '。' || c == '`')
            .find(|s| !s.is_empty())
            .unwrap_or("none")
            .to_lowercase();

        if matches!(id.as_str(), "none" | "supervisor" | "direct") {
            return Ok(None);
        }
        match available.iter().find(|a| a.to_lowercase() == id) {
            Some(agent) => Ok(Some(agent.clone())),
            None => {
                tracing::warn!(reply = %id, "router picked unknown agent, answering directly");
                Ok(None)
            }
        }
    }
}
