//! 四级降级链：Primary LLM -> Secondary 本地模型 -> RuleBased 状态机 -> Emergency 静态模板
//!
//! 依次尝试每个级别，成功即停并标注命中级别；异常、超时、空白输出都视为失败并前进到下一级。
//! Emergency 是纯查表，总能返回非空文本，没有失败分支。

pub mod intent;
pub mod llm;
pub mod rule_based;
pub mod templates;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;

use crate::core::{Purpose, SupervisorError};
use crate::llm::LlmError;
use crate::memory::Message;
use crate::observability::Metrics;

pub use intent::{classify_intent, Intent};
pub use llm::LlmFallback;
pub use rule_based::{DialogState, RuleBasedResponder};
pub use templates::EmergencyTemplates;

/// 降级级别（有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FallbackLevel {
    Primary,
    Secondary,
    RuleBased,
    Emergency,
}

impl FallbackLevel {
    pub const ALL: [FallbackLevel; 4] = [
        FallbackLevel::Primary,
        FallbackLevel::Secondary,
        FallbackLevel::RuleBased,
        FallbackLevel::Emergency,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// 指标标签
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackLevel::Primary => "primary",
            FallbackLevel::Secondary => "secondary",
            FallbackLevel::RuleBased => "rule_based",
            FallbackLevel::Emergency => "emergency",
        }
    }

    /// 写入消息元数据的名字
    pub fn label(&self) -> &'static str {
        match self {
            FallbackLevel::Primary => "Primary",
            FallbackLevel::Secondary => "Secondary",
            FallbackLevel::RuleBased => "RuleBased",
            FallbackLevel::Emergency => "Emergency",
        }
    }
}

impl fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 单个级别失败的原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FallbackError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("level timed out after {0:?}")]
    Timeout(Duration),

    #[error("empty response")]
    Empty,

    #[error("no rule matched")]
    NoRule,

    #[error("level panicked")]
    Panicked,
}

/// 降级调用的上下文
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub purpose: Purpose,
    /// 最近的对话（含本轮用户消息）
    pub history: Vec<Message>,
    /// 触发恢复的错误描述
    pub error: Option<String>,
    /// 失败的 agent
    pub agent: Option<String>,
    /// 可用 agent（帮助类规则会列出）
    pub available_agents: Vec<String>,
    /// 会话中第几条用户消息（从 1 开始）
    pub user_turn: usize,
}

impl FallbackContext {
    pub fn new(purpose: Purpose) -> Self {
        Self {
            purpose,
            history: Vec::new(),
            error: None,
            agent: None,
            available_agents: Vec::new(),
            user_turn: 1,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.user_turn = history
            .iter()
            .filter(|m| m.role == crate::memory::Role::User)
            .count()
            .max(1);
        self.history = history;
        self
    }

    pub fn with_error(mut self, agent: Option<&str>, error: impl Into<String>) -> Self {
        self.agent = agent.map(String::from);
        self.error = Some(error.into());
        self
    }

    pub fn with_agents(mut self, agents: Vec<String>) -> Self {
        self.available_agents = agents;
        self
    }
}

/// 一个可失败的降级策略（Primary / Secondary / RuleBased）
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    async fn generate(
        &self,
        message: &str,
        conversation_id: &str,
        context: &FallbackContext,
    ) -> Result<String, FallbackError>;
}

/// 降级链输出
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackResponse {
    pub text: String,
    pub level: FallbackLevel,
    /// 命中前失败的级别与原因
    pub failures: Vec<(FallbackLevel, String)>,
}

struct Slot {
    level: FallbackLevel,
    strategy: Arc<dyn FallbackStrategy>,
    timeout: Option<Duration>,
}

pub struct FallbackChain {
    slots: Vec<Slot>,
    emergency: EmergencyTemplates,
    metrics: Arc<Metrics>,
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackChain {
    /// 只有 Emergency 的链；其余级别按需挂载
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            emergency: EmergencyTemplates,
            metrics: Metrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_primary(self, strategy: Arc<dyn FallbackStrategy>, timeout: Duration) -> Self {
        self.with_level(FallbackLevel::Primary, strategy, Some(timeout))
    }

    pub fn with_secondary(self, strategy: Arc<dyn FallbackStrategy>, timeout: Duration) -> Self {
        self.with_level(FallbackLevel::Secondary, strategy, Some(timeout))
    }

    pub fn with_rule_based(self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.with_level(FallbackLevel::RuleBased, strategy, None)
    }

    fn with_level(
        mut self,
        level: FallbackLevel,
        strategy: Arc<dyn FallbackStrategy>,
        timeout: Option<Duration>,
    ) -> Self {
        self.slots.retain(|s| s.level != level);
        self.slots.push(Slot {
            level,
            strategy,
            timeout,
        });
        self.slots.sort_by_key(|s| s.level);
        self
    }

    /// 已挂载的级别（含 Emergency）
    pub fn levels(&self) -> Vec<FallbackLevel> {
        let mut levels: Vec<FallbackLevel> = self.slots.iter().map(|s| s.level).collect();
        levels.push(FallbackLevel::Emergency);
        levels
    }

    /// 逐级尝试直到成功；Emergency 兜底。
    ///
    /// 唯一的 Err 是 FallbackExhausted（Emergency 产出空文本），属于完整性缺陷。
    pub async fn generate_response(
        &self,
        message: &str,
        conversation_id: &str,
        context: &FallbackContext,
    ) -> Result<FallbackResponse, SupervisorError> {
        let mut failures = Vec::new();

        for slot in &self.slots {
            let attempt = AssertUnwindSafe(slot.strategy.generate(message, conversation_id, context))
                .catch_unwind()
                .map(|r| r.unwrap_or(Err(FallbackError::Panicked)));
            let result = match slot.timeout {
                Some(limit) => tokio::time::timeout(limit, attempt)
                    .await
                    .unwrap_or(Err(FallbackError::Timeout(limit))),
                None => attempt.await,
            };
            let result = match result {
                Ok(text) if text.trim().is_empty() => Err(FallbackError::Empty),
                other => other,
            };

            match result {
                Ok(text) => {
                    self.metrics.record_fallback(slot.level, true);
                    tracing::info!(
                        conversation_id,
                        level = slot.level.as_str(),
                        purpose = context.purpose.as_str(),
                        "fallback level succeeded"
                    );
                    return Ok(FallbackResponse {
                        text,
                        level: slot.level,
                        failures,
                    });
                }
                Err(e) => {
                    self.metrics.record_fallback(slot.level, false);
                    tracing::warn!(
                        conversation_id,
                        level = slot.level.as_str(),
                        error = %e,
                        "fallback level failed, advancing"
                    );
                    failures.push((slot.level, e.to_string()));
                }
            }
        }

        let text = self.emergency.respond(message, context);
        if text.trim().is_empty() {
            self.metrics.record_fallback(FallbackLevel::Emergency, false);
            self.metrics.record_integrity_fault();
            tracing::error!(conversation_id, "emergency template produced empty text");
            return Err(SupervisorError::FallbackExhausted);
        }
        self.metrics.record_fallback(FallbackLevel::Emergency, true);
        tracing::info!(
            conversation_id,
            purpose = context.purpose.as_str(),
            "fallback reached emergency templates"
        );
        Ok(FallbackResponse {
            text: text.to_string(),
            level: FallbackLevel::Emergency,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedLlmClient, ScriptedReply};

    struct Constant(&'static str);

    #[async_trait]
    impl FallbackStrategy for Constant {
        async fn generate(
            &self,
            _m: &str,
            _c: &str,
            _ctx: &FallbackContext,
        ) -> Result<String, FallbackError> {
            Ok(self.0.to_string())
        }
    }

    fn llm_level(replies: Vec<ScriptedReply>) -> Arc<dyn FallbackStrategy> {
        Arc::new(LlmFallback::new(Arc::new(ScriptedLlmClient::new(replies))))
    }

    #[tokio::test]
    async fn test_primary_success_stops_chain() {
        let metrics = Arc::new(Metrics::new());
        let chain = FallbackChain::new()
            .with_metrics(metrics.clone())
            .with_primary(
                llm_level(vec![ScriptedReply::Text("from primary".into())]),
                Duration::from_secs(5),
            )
            .with_rule_based(Arc::new(Constant("rule")));
        let out = chain
            .generate_response("hi", "c1", &FallbackContext::new(Purpose::DirectResponse))
            .await
            .unwrap();
        assert_eq!(out.level, FallbackLevel::Primary);
        assert_eq!(out.text, "from primary");
        assert!(out.failures.is_empty());
        assert_eq!(metrics.snapshot().level(FallbackLevel::RuleBased), (0, 0));
    }

    /// Primary 超时、Secondary 报错、RuleBased 空串 -> Emergency
    #[tokio::test(start_paused = true)]
    async fn test_cascade_to_emergency() {
        let metrics = Arc::new(Metrics::new());
        let chain = FallbackChain::new()
            .with_metrics(metrics.clone())
            .with_primary(
                llm_level(vec![ScriptedReply::Delayed(
                    Duration::from_secs(60),
                    "too late".into(),
                )]),
                Duration::from_secs(5),
            )
            .with_secondary(
                llm_level(vec![ScriptedReply::Error(LlmError::Api("boom".into()))]),
                Duration::from_secs(5),
            )
            .with_rule_based(Arc::new(Constant("   ")));

        let out = chain
            .generate_response(
                "what is the capital of France?",
                "c1",
                &FallbackContext::new(Purpose::DirectResponse),
            )
            .await
            .unwrap();
        assert_eq!(out.level, FallbackLevel::Emergency);
        assert!(!out.text.trim().is_empty());
        let failed: Vec<FallbackLevel> = out.failures.iter().map(|(l, _)| *l).collect();
        assert_eq!(
            failed,
            vec![
                FallbackLevel::Primary,
                FallbackLevel::Secondary,
                FallbackLevel::RuleBased
            ]
        );
        assert!(out.failures[0].1.contains("timed out"));

        let s = metrics.snapshot();
        assert_eq!(s.level(FallbackLevel::Primary), (0, 1));
        assert_eq!(s.level(FallbackLevel::Secondary), (0, 1));
        assert_eq!(s.level(FallbackLevel::RuleBased), (0, 1));
        assert_eq!(s.level(FallbackLevel::Emergency), (1, 0));
    }

    struct Exploding;

    #[async_trait]
    impl FallbackStrategy for Exploding {
        async fn generate(
            &self,
            _m: &str,
            _c: &str,
            _ctx: &FallbackContext,
        ) -> Result<String, FallbackError> {
            panic!("strategy blew up")
        }
    }

    #[tokio::test]
    async fn test_panicking_level_advances_chain() {
        let metrics = Arc::new(Metrics::new());
        let chain = FallbackChain::new()
            .with_metrics(metrics.clone())
            .with_primary(Arc::new(Exploding), Duration::from_secs(5))
            .with_rule_based(Arc::new(Constant("rule answer")));
        let out = chain
            .generate_response("hi", "c1", &FallbackContext::new(Purpose::DirectResponse))
            .await
            .unwrap();
        assert_eq!(out.level, FallbackLevel::RuleBased);
        assert_eq!(out.text, "rule answer");
        assert_eq!(
            out.failures,
            vec![(FallbackLevel::Primary, "level panicked".to_string())]
        );
        assert_eq!(metrics.snapshot().level(FallbackLevel::Primary), (0, 1));
    }

    #[tokio::test]
    async fn test_emergency_only_chain_is_total() {
        let chain = FallbackChain::new().with_metrics(Arc::new(Metrics::new()));
        for input in ["", "   ", "hello", "\u{0}\u{ffff}", "你好", &"x".repeat(10_000)] {
            for purpose in [
                Purpose::DirectResponse,
                Purpose::ErrorRecovery,
                Purpose::BudgetExhausted,
            ] {
                let out = chain
                    .generate_response(input, "c", &FallbackContext::new(purpose))
                    .await
                    .unwrap();
                assert_eq!(out.level, FallbackLevel::Emergency);
                assert!(!out.text.trim().is_empty());
            }
        }
    }

    #[test]
    fn test_levels_are_ordered() {
        let chain = FallbackChain::new()
            .with_rule_based(Arc::new(Constant("r")))
            .with_primary(Arc::new(Constant("p")), Duration::from_secs(1));
        assert_eq!(
            chain.levels(),
            vec![
                FallbackLevel::Primary,
                FallbackLevel::RuleBased,
                FallbackLevel::Emergency
            ]
        );
        assert_eq!(FallbackLevel::Emergency.to_string(), "Emergency");
    }
}
