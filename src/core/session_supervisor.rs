//! 会话监管：进程级关停与每轮取消
//!
//! 根 token 在进程退出时触发；每个会话的当前轮次拿到一个子 token，用户点击「停止生成」时只取消该会话。

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::state::ConversationId;

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 进程关停时触发，所有轮次一并取消
    shutdown: CancellationToken,
    turns: RwLock<HashMap<ConversationId, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            turns: RwLock::new(HashMap::new()),
        }
    }

    /// 为一轮创建取消令牌（根 token 的子 token）；同一会话的旧令牌被替换
    pub async fn begin_turn(&self, conversation_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.turns
            .write()
            .await
            .insert(conversation_id.to_string(), token.clone());
        token
    }

    /// 取消该会话正在进行的轮次；没有进行中的轮次时返回 false
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        match self.turns.read().await.get(conversation_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(conversation_id, "turn cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn end_turn(&self, conversation_id: &str) {
        self.turns.write().await.remove(conversation_id);
    }

    pub async fn active_turns(&self) -> usize {
        self.turns.read().await.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_only_targets_one_conversation() {
        let sup = SessionSupervisor::new();
        let a = sup.begin_turn("a").await;
        let b = sup.begin_turn("b").await;
        assert!(sup.cancel("a").await);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sup.cancel("missing").await);

        sup.end_turn("a").await;
        assert!(!sup.cancel("a").await);
        assert_eq!(sup.active_turns().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_turns() {
        let sup = SessionSupervisor::new();
        let a = sup.begin_turn("a").await;
        let b = sup.begin_turn("b").await;
        sup.shutdown();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
