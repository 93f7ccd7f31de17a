//! Agent 派发器
//!
//! 持有只读的 AgentRegistry 与统一超时，dispatch(agent_id, ...) 在超时内调用 agent，
//! 超时 / 失败 / 空回复 / panic 统一转为 AgentError；每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::timeout;

use crate::agents::{AgentContext, AgentRegistry, AgentReply, NextStep};
use crate::core::AgentError;
use crate::memory::{Message, MessageMetadata};
use crate::observability::{AgentOutcome, Metrics};

pub struct AgentDispatcher {
    registry: Arc<AgentRegistry>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl AgentDispatcher {
    pub fn new(registry: Arc<AgentRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            metrics: Metrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.registry.agent_ids()
    }

    pub async fn dispatch(
        &self,
        agent_id: &str,
        messages: &[Message],
        context: &AgentContext,
        metadata: &MessageMetadata,
    ) -> Result<AgentReply, AgentError> {
        let start = Instant::now();
        let invocation =
            AssertUnwindSafe(self.registry.invoke(agent_id, messages, context, metadata))
                .catch_unwind();
        let result = timeout(self.timeout, invocation).await;

        let result = match result {
            // 纯委派（只有指示行）允许正文为空
            Ok(Ok(Ok(reply)))
                if reply.response.trim().is_empty() && reply.next == NextStep::Finish =>
            {
                Err(AgentError::EmptyResponse(agent_id.to_string()))
            }
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(AgentError::Failed(format!("agent {} panicked", agent_id))),
            Err(_) => Err(AgentError::Timeout(agent_id.to_string())),
        };

        let outcome = match &result {
            Ok(_) => AgentOutcome::Ok,
            Err(AgentError::Timeout(_)) => AgentOutcome::Timeout,
            Err(AgentError::EmptyResponse(_)) => AgentOutcome::Empty,
            Err(_) => AgentOutcome::Error,
        };
        self.metrics.record_agent(outcome);

        let audit = serde_json::json!({
            "event": "agent_audit",
            "conversation_id": context.conversation_id,
            "agent": agent_id,
            "iteration": context.iteration,
            "hop": context.hop,
            "ok": result.is_ok(),
            "outcome": outcome.as_str(),
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit, "agent");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Agent;
    use async_trait::async_trait;

    struct Slow;

    #[async_trait]
    impl Agent for Slow {
        fn id(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn invoke(
            &self,
            _m: &[Message],
            _c: &AgentContext,
            _md: &MessageMetadata,
        ) -> Result<AgentReply, AgentError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(AgentReply::new("late"))
        }
    }

    struct Blank;

    #[async_trait]
    impl Agent for Blank {
        fn id(&self) -> &str {
            "blank"
        }
        fn description(&self) -> &str {
            "whitespace"
        }
        async fn invoke(
            &self,
            _m: &[Message],
            _c: &AgentContext,
            _md: &MessageMetadata,
        ) -> Result<AgentReply, AgentError> {
            Ok(AgentReply::new("  \n "))
        }
    }

    struct Handoff;

    #[async_trait]
    impl Agent for Handoff {
        fn id(&self) -> &str {
            "handoff"
        }
        fn description(&self) -> &str {
            "passes the request on"
        }
        async fn invoke(
            &self,
            _m: &[Message],
            _c: &AgentContext,
            _md: &MessageMetadata,
        ) -> Result<AgentReply, AgentError> {
            Ok(AgentReply::new("").delegate_to("blank"))
        }
    }

    struct Panicky;

    #[async_trait]
    impl Agent for Panicky {
        fn id(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "panics"
        }
        async fn invoke(
            &self,
            _m: &[Message],
            _c: &AgentContext,
            _md: &MessageMetadata,
        ) -> Result<AgentReply, AgentError> {
            panic!("boom");
        }
    }

    fn dispatcher(metrics: Arc<Metrics>) -> AgentDispatcher {
        let mut registry = AgentRegistry::new();
        registry.register(Slow);
        registry.register(Blank);
        registry.register(Panicky);
        registry.register(Handoff);
        AgentDispatcher::new(Arc::new(registry), Duration::from_secs(5)).with_metrics(metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_agent_error() {
        let metrics = Arc::new(Metrics::new());
        let d = dispatcher(metrics.clone());
        let err = d
            .dispatch("slow", &[], &AgentContext::default(), &MessageMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Timeout("slow".into()));
        assert_eq!(metrics.snapshot().agent_timeouts, 1);
    }

    #[tokio::test]
    async fn test_whitespace_reply_is_failure() {
        let metrics = Arc::new(Metrics::new());
        let d = dispatcher(metrics.clone());
        let err = d
            .dispatch("blank", &[], &AgentContext::default(), &MessageMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::EmptyResponse("blank".into()));
        assert_eq!(metrics.snapshot().agent_failures, 1);
    }

    #[tokio::test]
    async fn test_bodyless_delegation_is_accepted() {
        let metrics = Arc::new(Metrics::new());
        let d = dispatcher(metrics.clone());
        let reply = d
            .dispatch("handoff", &[], &AgentContext::default(), &MessageMetadata::new())
            .await
            .unwrap();
        assert!(reply.response.is_empty());
        assert_eq!(reply.next, NextStep::Delegate("blank".into()));
        assert_eq!(metrics.snapshot().agent_failures, 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let metrics = Arc::new(Metrics::new());
        let d = dispatcher(metrics.clone());
        let err = d
            .dispatch("panicky", &[], &AgentContext::default(), &MessageMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Failed(_)));
        assert_eq!(metrics.snapshot().agent_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let d = dispatcher(Arc::new(Metrics::new()));
        let err = d
            .dispatch("ghost", &[], &AgentContext::default(), &MessageMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::UnknownAgent("ghost".into()));
    }
}
