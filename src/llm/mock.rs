//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! MockLlmClient 回显最后一条 User 消息；ScriptedLlmClient 按队列依次返回预设回复 / 错误 / 延迟。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {last_user}"))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// 脚本化回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(LlmError),
    /// 先等待再返回文本（配合 tokio::time::pause 测超时）
    Delayed(Duration, String),
}

/// 脚本化客户端：按顺序消费回复，用完后返回 Unavailable
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: AtomicUsize,
    /// 每次调用收到的消息（断言 prompt 用）
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(|t| ScriptedReply::Text(t.into())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        self.replies.lock().ok().and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        match self.next_reply() {
            Some(ScriptedReply::Text(t)) => Ok(t),
            Some(ScriptedReply::Error(e)) => Err(e),
            Some(ScriptedReply::Delayed(delay, t)) => {
                tokio::time::sleep(delay).await;
                Ok(t)
            }
            None => Err(LlmError::Unavailable("script exhausted".to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
