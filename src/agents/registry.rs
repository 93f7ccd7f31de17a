//! Agent 注册表
//!
//! 所有 agent 实现 Agent trait（id / description / invoke），由 AgentRegistry 按 id 注册与查找。
//! 注册只发生在启动阶段，之后以 Arc<AgentRegistry> 只读共享，读取无需加锁。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::memory::{Message, MessageMetadata};

/// 本次调用的上下文
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub conversation_id: String,
    /// 本轮第几次派发（从 1 开始）
    pub iteration: u32,
    /// 本轮委派跳数（首次派发为 0）
    pub hop: u32,
    /// 委派来源 agent
    pub delegated_by: Option<String>,
}

/// agent 给出的下一步指示
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NextStep {
    /// 本轮结束，结果即最终回复
    #[default]
    Finish,
    /// 直接交给指定 agent
    Delegate(String),
    /// 交回 supervisor 重新选择
    Reroute,
}

/// agent 调用结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentReply {
    pub response: String,
    pub metadata: MessageMetadata,
    pub next: NextStep,
}

impl AgentReply {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Default::default()
        }
    }

    pub fn delegate_to(mut self, agent_id: impl Into<String>) -> Self {
        self.next = NextStep::Delegate(agent_id.into());
        self
    }

    pub fn reroute(mut self) -> Self {
        self.next = NextStep::Reroute;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// 能力提供方：内部逻辑对 supervisor 不透明
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// 描述（供选择器理解该 agent 擅长什么）
    fn description(&self) -> &str;

    async fn invoke(
        &self,
        messages: &[Message],
        context: &AgentContext,
        metadata: &MessageMetadata,
    ) -> Result<AgentReply, AgentError>;
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同 id 重复注册时后者覆盖前者
    pub fn register(&mut self, agent: impl Agent + 'static) {
        self.register_arc(Arc::new(agent));
    }

    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        if self.agents.insert(id.clone(), agent).is_some() {
            tracing::warn!(agent = %id, "agent re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 已注册的 id（排序后返回，保证选择 prompt 稳定）
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// (id, description) 列表，用于生成选择器 prompt
    pub fn agent_descriptions(&self) -> Vec<(String, String)> {
        self.agent_ids()
            .into_iter()
            .filter_map(|id| {
                self.agents
                    .get(&id)
                    .map(|a| (id.clone(), a.description().to_string()))
            })
            .collect()
    }

    pub async fn invoke(
        &self,
        agent_id: &str,
        messages: &[Message],
        context: &AgentContext,
        metadata: &MessageMetadata,
    ) -> Result<AgentReply, AgentError> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))?;
        agent.invoke(messages, context, metadata).await
    }
}
