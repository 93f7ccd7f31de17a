//! Supervisor 服务：会话存储 + 路由器 + 取消 + 快照
//!
//! 传输层（CLI / Web）只和这里打交道：submit 在后台任务中跑完一轮并返回事件流，
//! 消费端断开不会中止该轮，结果照常写入会话并落盘。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_config, AppConfig};
use crate::core::builder::SupervisorBuilder;
use crate::core::state::ConversationId;
use crate::core::store::{ConversationStore, SharedState};
use crate::core::{SessionSupervisor, SupervisorError};
use crate::memory::{ConversationPersistence, Message};
use crate::observability::Metrics;
use crate::supervisor::{channel, StreamingEmitter, SupervisorRouter, TurnOutcome, TurnStream};

pub struct Supervisor {
    router: SupervisorRouter,
    store: ConversationStore,
    sessions: SessionSupervisor,
    persistence: Option<ConversationPersistence>,
    metrics: Arc<Metrics>,
}

impl Supervisor {
    pub fn new(router: SupervisorRouter, metrics: Arc<Metrics>) -> Self {
        Self {
            router,
            store: ConversationStore::new(),
            sessions: SessionSupervisor::new(),
            persistence: None,
            metrics,
        }
    }

    pub fn with_persistence(mut self, persistence: Option<ConversationPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn router(&self) -> &SupervisorRouter {
        &self.router
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// 内存中没有时尝试从快照恢复，否则新建
    async fn state_for(&self, conversation_id: &str) -> SharedState {
        if let Some(state) = self.store.get(conversation_id).await {
            return state;
        }
        if let Some(p) = &self.persistence {
            match p.load(conversation_id) {
                Ok(Some(state)) => {
                    if let Some(shared) = self.store.insert(conversation_id, state).await {
                        tracing::info!(conversation_id, "conversation restored from snapshot");
                        return shared;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(conversation_id, error = %e, "snapshot unreadable, starting fresh");
                }
            }
        }
        self.store.get_or_create(conversation_id).await
    }

    /// 在当前任务中跑完一轮；同一会话的轮次按到达顺序串行
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        message: &str,
        emitter: &mut StreamingEmitter,
    ) -> Result<TurnOutcome, SupervisorError> {
        let shared = self.state_for(conversation_id).await;
        let mut state = shared.lock().await;
        let cancel = self.sessions.begin_turn(conversation_id).await;

        let result = self.router.run_turn(&mut state, message, emitter, &cancel).await;
        self.sessions.end_turn(conversation_id).await;

        if let Some(p) = &self.persistence {
            if let Err(e) = p.save(&state) {
                tracing::warn!(conversation_id, error = %e, "failed to save conversation snapshot");
            }
        }
        result
    }

    /// 后台执行一轮并返回会话 id 与事件流；未给 id 时新建会话
    pub fn submit(
        self: &Arc<Self>,
        conversation_id: Option<String>,
        message: String,
    ) -> (ConversationId, TurnStream) {
        let id = conversation_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (mut emitter, stream) = channel(id.clone());
        let this = Arc::clone(self);
        let turn_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_turn(&turn_id, &message, &mut emitter).await {
                tracing::error!(conversation_id = %turn_id, error = %e, "turn failed");
            }
        });
        (id, stream)
    }

    pub async fn cancel(&self, conversation_id: &str) -> bool {
        self.sessions.cancel(conversation_id).await
    }

    /// 会话历史：内存优先，其次快照
    pub async fn history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        if let Some(messages) = self.store.history(conversation_id).await {
            return Some(messages);
        }
        let p = self.persistence.as_ref()?;
        match p.load(conversation_id) {
            Ok(state) => state.map(|s| s.get_messages()),
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "snapshot unreadable");
                None
            }
        }
    }

    /// 取消所有进行中的轮次
    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }
}

/// 加载配置并构建 Supervisor；配置读取失败时使用默认值
pub fn create_supervisor(config_path: Option<PathBuf>) -> anyhow::Result<Arc<Supervisor>> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let supervisor = SupervisorBuilder::new(cfg).build()?;
    Ok(Arc::new(supervisor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use crate::supervisor::StreamEvent;

    fn supervisor(persistence: Option<ConversationPersistence>) -> Arc<Supervisor> {
        let s = SupervisorBuilder::new(AppConfig::default())
            .with_llms(None, None)
            .with_metrics(Arc::new(Metrics::new()))
            .with_persistence(persistence)
            .build()
            .unwrap();
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_submit_streams_and_stores() {
        let sup = supervisor(None);
        let (id, stream) = sup.submit(None, "Hello".into());
        let events = stream.collect_all().await;
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

        let history = sup.history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = supervisor(Some(ConversationPersistence::new(dir.path())));
        let mut emitter = StreamingEmitter::detached("c1");
        first.run_turn("c1", "Hello", &mut emitter).await.unwrap();

        let second = supervisor(Some(ConversationPersistence::new(dir.path())));
        assert_eq!(second.history("c1").await.unwrap().len(), 2);
        let mut emitter = StreamingEmitter::detached("c1");
        second.run_turn("c1", "thanks", &mut emitter).await.unwrap();
        assert_eq!(second.history("c1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_lookalike_ids_stay_separate_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = supervisor(Some(ConversationPersistence::new(dir.path())));
        let mut emitter = StreamingEmitter::detached("a/b");
        first.run_turn("a/b", "secret for a/b", &mut emitter).await.unwrap();

        let second = supervisor(Some(ConversationPersistence::new(dir.path())));
        assert!(second.history("a_b").await.is_none());

        let mut emitter = StreamingEmitter::detached("a_b");
        let outcome = second.run_turn("a_b", "Hello", &mut emitter).await.unwrap();
        assert_eq!(outcome.conversation_id, "a_b");

        let history = second.history("a_b").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "Hello");
        assert_eq!(second.store().ids().await, vec!["a_b".to_string()]);
        assert_eq!(second.history("a/b").await.unwrap()[0].content, "secret for a/b");
    }

    #[tokio::test]
    async fn test_cancel_without_turn() {
        let sup = supervisor(None);
        assert!(!sup.cancel("nobody").await);
    }
}
