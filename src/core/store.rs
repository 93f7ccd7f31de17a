//! 会话存储：conversation_id -> 独占的 ConversationState
//!
//! 每个会话一把 tokio Mutex，整轮持锁；不同会话互不阻塞。外层 RwLock 只保护映射本身。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::core::state::{ConversationId, ConversationState};
use crate::memory::Message;

pub type SharedState = Arc<Mutex<ConversationState>>;

#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<ConversationId, SharedState>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, conversation_id: &str) -> Option<SharedState> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    pub async fn get_or_create(&self, conversation_id: &str) -> SharedState {
        if let Some(state) = self.get(conversation_id).await {
            return state;
        }
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationState::new(conversation_id))))
            .clone()
    }

    /// 以给定 id 放入一个已有状态（如从快照恢复）；已存在时保留内存中的版本。
    /// 状态自带的 id 与 key 不一致时拒绝，返回 None
    pub async fn insert(
        &self,
        conversation_id: &str,
        state: ConversationState,
    ) -> Option<SharedState> {
        if state.conversation_id() != conversation_id {
            tracing::warn!(
                conversation_id,
                stored_id = state.conversation_id(),
                "refusing to store state under a different conversation id"
            );
            return None;
        }
        let shared = self
            .conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone();
        Some(shared)
    }

    /// 会话消息的副本；轮次进行中会等待该轮结束
    pub async fn history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let state = self.get(conversation_id).await?;
        let guard = state.lock().await;
        Some(guard.get_messages())
    }

    pub async fn snapshot(&self, conversation_id: &str) -> Option<ConversationState> {
        let state = self.get(conversation_id).await?;
        let guard = state.lock().await;
        Some(guard.clone())
    }

    pub async fn ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.conversations.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_returns_same_state() {
        let store = ConversationStore::new();
        let a1 = store.get_or_create("a").await;
        let a2 = store.get_or_create("a").await;
        assert!(Arc::ptr_eq(&a1, &a2));
        a1.lock().await.append_message(Message::user("hi"));
        assert_eq!(store.history("a").await.unwrap().len(), 1);
        assert!(store.history("b").await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_keeps_live_state() {
        let store = ConversationStore::new();
        let live = store.get_or_create("a").await;
        live.lock().await.append_message(Message::user("live"));

        let mut restored = ConversationState::new("a");
        restored.append_message(Message::user("stale"));
        store.insert("a", restored).await.unwrap();

        let history = store.history("a").await.unwrap();
        assert_eq!(history[0].content, "live");
    }

    #[tokio::test]
    async fn test_insert_rejects_mismatched_key() {
        let store = ConversationStore::new();
        let mut other = ConversationState::new("a/b");
        other.append_message(Message::user("secret"));
        assert!(store.insert("a_b", other).await.is_none());
        assert!(store.is_empty().await);
    }
}
