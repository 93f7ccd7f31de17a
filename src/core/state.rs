//! 会话状态与安全访问器
//!
//! ConversationState 的字段全部私有：消息只能通过 get_messages / set_messages / append_message 读写，
//! 计数器只能由 Loop Guard 与路由器（crate 内）修改。外部框架或快照产生的「结构相同、类型不同」的
//! 表示（JSON mapping）统一经 normalize_state 转回规范形态。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::SupervisorError;
use crate::memory::conversation::now_millis;
use crate::memory::{Message, MessageMetadata, Role};

pub type ConversationId = String;

/// 会话状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    AwaitingAgent,
    Finalizing,
    Ended,
}

impl ConversationStatus {
    fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "active" => Some(Self::Active),
            "awaitingagent" => Some(Self::AwaitingAgent),
            "finalizing" => Some(Self::Finalizing),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// 单个会话的规范状态
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationState {
    conversation_id: ConversationId,
    messages: Vec<Message>,
    agent_attempts: BTreeMap<String, u32>,
    total_iterations: u32,
    status: ConversationStatus,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            agent_attempts: BTreeMap::new(),
            total_iterations: 0,
            status: ConversationStatus::Active,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn total_iterations(&self) -> u32 {
        self.total_iterations
    }

    pub fn attempts_for(&self, agent_id: &str) -> u32 {
        self.agent_attempts.get(agent_id).copied().unwrap_or(0)
    }

    pub fn agent_attempts(&self) -> BTreeMap<String, u32> {
        self.agent_attempts.clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.messages.last().cloned()
    }

    /// 返回消息的副本，调用方无法触及内部存储
    pub fn get_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// 最近 n 条消息的副本（按时间顺序）
    pub fn recent_messages(&self, n: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    /// 整体替换消息序列。
    ///
    /// 新序列必须以当前已提交的消息为前缀（不缩短、不重排、不改写）；违反属于编程错误，
    /// 由 debug 断言在测试中暴露。
    pub fn set_messages(&mut self, new_messages: Vec<Message>) {
        debug_assert!(
            new_messages.len() >= self.messages.len()
                && new_messages[..self.messages.len()] == self.messages[..],
            "set_messages must keep committed messages as an unchanged prefix"
        );
        self.messages = new_messages;
        self.resequence_timestamps();
    }

    /// 追加一条消息；时间戳不大于上一条时顺延为上一条 + 1
    pub fn append_message(&mut self, mut message: Message) {
        if let Some(last) = self.messages.last() {
            if message.timestamp <= last.timestamp {
                message.timestamp = last.timestamp.saturating_add(1);
            }
        }
        self.messages.push(message);
    }

    /// 幂等的原地规范化：时间戳严格递增、去掉计数为 0 的 agent 条目
    pub fn normalize(&mut self) {
        self.resequence_timestamps();
        self.agent_attempts.retain(|_, count| *count > 0);
    }

    /// 以 JSON mapping 形式导出（快照 / 传输用）
    pub fn to_mapping(&self) -> Result<Value, SupervisorError> {
        serde_json::to_value(self).map_err(|e| SupervisorError::InvalidState(e.to_string()))
    }

    pub(crate) fn set_status(&mut self, status: ConversationStatus) {
        self.status = status;
    }

    pub(crate) fn record_dispatch(&mut self, agent_id: &str) {
        self.total_iterations += 1;
        *self.agent_attempts.entry(agent_id.to_string()).or_insert(0) += 1;
    }

    /// Ended -> Idle：清零本轮计数，消息历史保留
    pub(crate) fn reset_turn_counters(&mut self) {
        self.total_iterations = 0;
        self.agent_attempts.clear();
    }

    fn resequence_timestamps(&mut self) {
        let mut prev: Option<i64> = None;
        for m in self.messages.iter_mut() {
            if let Some(p) = prev {
                if m.timestamp <= p {
                    m.timestamp = p.saturating_add(1);
                }
            }
            prev = Some(m.timestamp);
        }
    }
}

/// normalize_state 的输入：规范类型，或外部框架 / 快照产生的 mapping
#[derive(Debug, Clone)]
pub enum StateRepr {
    Typed(ConversationState),
    Mapping(Value),
}

impl From<ConversationState> for StateRepr {
    fn from(state: ConversationState) -> Self {
        StateRepr::Typed(state)
    }
}

impl From<Value> for StateRepr {
    fn from(value: Value) -> Self {
        StateRepr::Mapping(value)
    }
}

/// 把任意结构等价的表示转换为规范 ConversationState；对规范输入幂等
pub fn normalize_state(repr: impl Into<StateRepr>) -> Result<ConversationState, SupervisorError> {
    let mut state = match repr.into() {
        StateRepr::Typed(state) => state,
        StateRepr::Mapping(value) => state_from_mapping(&value)?,
    };
    state.normalize();
    Ok(state)
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn invalid(msg: impl Into<String>) -> SupervisorError {
    SupervisorError::InvalidState(msg.into())
}

fn state_from_mapping(value: &Value) -> Result<ConversationState, SupervisorError> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("state must be a mapping"))?;

    let conversation_id = match field(obj, &["conversation_id", "conversationId", "id"]) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(invalid("missing conversation id")),
    };

    let mut state = ConversationState::new(conversation_id);

    if let Some(raw) = field(obj, &["messages"]) {
        let items = raw
            .as_array()
            .ok_or_else(|| invalid("messages must be a sequence"))?;
        for item in items {
            state.messages.push(message_from_value(item)?);
        }
    }

    if let Some(raw) = field(obj, &["agent_attempts", "agentAttempts"]) {
        let map = raw
            .as_object()
            .ok_or_else(|| invalid("agent_attempts must be a mapping"))?;
        for (agent, count) in map {
            state.agent_attempts.insert(agent.clone(), counter(count, "agent_attempts")?);
        }
    }

    if let Some(raw) = field(obj, &["total_iterations", "totalIterations"]) {
        state.total_iterations = counter(raw, "total_iterations")?;
    }

    if let Some(raw) = field(obj, &["status"]) {
        let s = raw.as_str().ok_or_else(|| invalid("status must be a string"))?;
        state.status =
            ConversationStatus::parse(s).ok_or_else(|| invalid(format!("unknown status: {s}")))?;
    }

    Ok(state)
}

fn counter(value: &Value, name: &str) -> Result<u32, SupervisorError> {
    value
        .as_u64()
        .map(|n| n.min(u32::MAX as u64) as u32)
        .ok_or_else(|| invalid(format!("{name} must be a non-negative integer")))
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw.to_ascii_lowercase().as_str() {
        "user" | "human" => Some(Role::User),
        "assistant" | "ai" => Some(Role::Assistant),
        "system" => Some(Role::System),
        "agent" | "tool" | "function" => Some(Role::Agent),
        _ => None,
    }
}

/// 内容可以是字符串，也可以是 [{"type": "text", "text": "..."}] 片段数组
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(o) => o.get("text").and_then(|t| t.as_str()),
                    _ => None,
                })
                .collect::<String>(),
        ),
        _ => None,
    }
}

fn message_from_value(value: &Value) -> Result<Message, SupervisorError> {
    // ["user", "hello"] 二元组
    if let Some(pair) = value.as_array() {
        if let [role, content] = pair.as_slice() {
            let role = role
                .as_str()
                .and_then(parse_role)
                .ok_or_else(|| invalid("unknown message role"))?;
            let content = content_text(content).ok_or_else(|| invalid("message content"))?;
            return Ok(Message {
                role,
                content,
                timestamp: 0,
                metadata: MessageMetadata::new(),
            });
        }
        return Err(invalid("message tuples must be [role, content]"));
    }

    let obj = value
        .as_object()
        .ok_or_else(|| invalid("message must be a mapping or a [role, content] pair"))?;
    let role = field(obj, &["role", "type"])
        .and_then(|r| r.as_str())
        .and_then(parse_role)
        .ok_or_else(|| invalid("unknown message role"))?;
    let content = field(obj, &["content", "text"])
        .and_then(content_text)
        .unwrap_or_default();
    // 外部时间戳不晚于当前时刻
    let timestamp = field(obj, &["timestamp", "created_at", "createdAt"])
        .and_then(|t| t.as_i64())
        .map(|t| t.clamp(0, now_millis()))
        .unwrap_or(0);
    let metadata = match field(obj, &["metadata", "additional_kwargs"]) {
        Some(Value::Object(m)) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => MessageMetadata::new(),
    };

    Ok(Message {
        role,
        content,
        timestamp,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_messages_is_a_copy() {
        let mut state = ConversationState::new("c1");
        state.append_message(Message::user("hi"));
        let mut view = state.get_messages();
        view[0].content = "tampered".to_string();
        view.push(Message::assistant("x"));
        assert_eq!(state.get_messages()[0].content, "hi");
        assert_eq!(state.message_count(), 1);
    }

    #[test]
    fn test_append_keeps_timestamps_strictly_increasing() {
        let mut state = ConversationState::new("c1");
        let mut first = Message::user("a");
        first.timestamp = 1_000;
        let mut second = Message::assistant("b");
        second.timestamp = 1_000;
        let mut third = Message::user("c");
        third.timestamp = 10;
        state.append_message(first);
        state.append_message(second);
        state.append_message(third);
        let ts: Vec<i64> = state.get_messages().iter().map(|m| m.timestamp).collect();
        assert_eq!(ts, vec![1_000, 1_001, 1_002]);
    }

    #[test]
    fn test_set_messages_extends_history() {
        let mut state = ConversationState::new("c1");
        state.append_message(Message::user("a"));
        let mut next = state.get_messages();
        next.push(Message::assistant("b"));
        state.set_messages(next);
        assert_eq!(state.message_count(), 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "unchanged prefix")]
    fn test_set_messages_rejects_shrinking() {
        let mut state = ConversationState::new("c1");
        state.append_message(Message::user("a"));
        state.append_message(Message::assistant("b"));
        state.set_messages(vec![Message::user("a")]);
    }

    #[test]
    fn test_normalize_mapping_camel_case_and_pairs() {
        let raw = json!({
            "conversationId": "abc",
            "messages": [
                ["human", "hello"],
                {"type": "ai", "content": [{"type": "text", "text": "hi "}, {"type": "text", "text": "there"}]},
                {"role": "agent", "content": "done", "metadata": {"agent": "code"}}
            ],
            "agentAttempts": {"code": 1, "idle": 0},
            "totalIterations": 1,
            "status": "awaiting-agent"
        });
        let state = normalize_state(raw).unwrap();
        assert_eq!(state.conversation_id(), "abc");
        let msgs = state.get_messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].content, "hi there");
        assert_eq!(msgs[2].agent_id(), Some("code"));
        assert_eq!(state.attempts_for("code"), 1);
        assert!(!state.agent_attempts().contains_key("idle"));
        assert_eq!(state.status(), ConversationStatus::AwaitingAgent);
        assert!(msgs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = json!({
            "conversation_id": "c9",
            "messages": [{"role": "user", "content": "q", "timestamp": 5}, ["assistant", "a"]],
            "agent_attempts": {"research": 2},
            "total_iterations": 2,
        });
        let once = normalize_state(raw).unwrap();
        let twice = normalize_state(once.clone()).unwrap();
        assert_eq!(once, twice);

        let via_mapping = normalize_state(once.to_mapping().unwrap()).unwrap();
        assert_eq!(once, via_mapping);
    }

    #[test]
    fn test_normalize_survives_extreme_timestamps() {
        let raw = json!({
            "id": "x",
            "messages": [
                {"role": "user", "content": "q", "timestamp": i64::MAX},
                {"role": "assistant", "content": "a", "timestamp": 1}
            ]
        });
        let state = normalize_state(raw).unwrap();
        let ts: Vec<i64> = state.get_messages().iter().map(|m| m.timestamp).collect();
        assert!(ts[0] <= now_millis());
        assert!(ts[0] < ts[1]);

        let mut late = Message::user("late");
        late.timestamp = i64::MAX;
        let mut state = ConversationState::new("y");
        state.append_message(late);
        state.append_message(Message::assistant("after"));
        assert_eq!(state.last_message().unwrap().timestamp, i64::MAX);
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        assert!(normalize_state(json!("nope")).is_err());
        assert!(normalize_state(json!({"messages": []})).is_err());
        assert!(normalize_state(json!({"id": "x", "totalIterations": -1})).is_err());
        assert!(normalize_state(json!({"id": "x", "messages": [["wizard", "hi"]]})).is_err());
    }

    #[test]
    fn test_reset_turn_counters_keeps_history() {
        let mut state = ConversationState::new("c1");
        state.append_message(Message::user("a"));
        state.record_dispatch("code");
        state.reset_turn_counters();
        assert_eq!(state.total_iterations(), 0);
        assert_eq!(state.attempts_for("code"), 0);
        assert_eq!(state.message_count(), 1);
    }
}
