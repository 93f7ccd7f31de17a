//! 对话消息模型
//!
//! 一条消息 = 角色 + 内容 + 创建时间戳 + 可选元数据（使用的 agent、延迟、降级级别等）。
//! 元数据只做附加说明，控制流不依赖它（end-of-turn 哨兵除外）。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// end-of-turn 哨兵消息的内容
pub const END_OF_TURN: &str = "<end_of_turn>";

/// 元数据键：哨兵标记
pub const META_END_OF_TURN: &str = "end_of_turn";
/// 元数据键：产生该消息的 agent id
pub const META_AGENT: &str = "agent";
/// 元数据键：降级链命中的级别
pub const META_FALLBACK_LEVEL: &str = "fallback_level";

/// 自由格式的附加元数据（BTreeMap 保证序列化顺序稳定）
pub type MessageMetadata = BTreeMap<String, serde_json::Value>;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// 专职 agent 的中间输出
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Agent => "agent",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 创建时间（UTC 毫秒）；写入会话时保证严格递增
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: MessageMetadata,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_millis(),
            metadata: MessageMetadata::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// agent 输出，元数据里记录 agent id
    pub fn agent(agent_id: &str, content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content).with_meta(META_AGENT, agent_id)
    }

    /// 显式的 end-of-turn 哨兵：本轮结束但没有实质回复（如用户取消）
    pub fn end_of_turn(reason: &str) -> Self {
        Self::new(Role::System, END_OF_TURN)
            .with_meta(META_END_OF_TURN, true)
            .with_meta("reason", reason)
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_end_of_turn(&self) -> bool {
        self.role == Role::System
            && self
                .metadata
                .get(META_END_OF_TURN)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.metadata.get(META_AGENT).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_turn_sentinel() {
        let m = Message::end_of_turn("cancelled");
        assert!(m.is_end_of_turn());
        assert_eq!(m.content, END_OF_TURN);
        assert_eq!(m.metadata["reason"], "cancelled");

        // 普通 system 消息不是哨兵
        assert!(!Message::system(END_OF_TURN).is_end_of_turn());
    }

    #[test]
    fn test_agent_message_carries_id() {
        let m = Message::agent("research", "found 3 papers");
        assert_eq!(m.role, Role::Agent);
        assert_eq!(m.agent_id(), Some("research"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
        assert!(!json.contains("metadata"));
    }
}
