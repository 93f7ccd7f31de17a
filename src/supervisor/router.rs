//! Supervisor Router：单轮状态机
//!
//! Idle → Routing → Dispatching →（委派时回到 Routing）→ Finalizing → Ended → Idle。
//!
//! 每轮恰好追加一条用户消息与一条终止消息（助手回复，取消时为 end-of-turn 哨兵），中间可有若干
//! agent 输出。路由 / 派发阶段的失败全部在这里被接住并转为降级回复，调用方只会看到
//! FallbackExhausted 这一种完整性错误。流的消费端断开不影响状态写入。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::agents::{AgentContext, AgentDispatcher, NextStep};
use crate::config::AppConfig;
use crate::core::loop_guard::LoopGuard;
use crate::core::state::{ConversationState, ConversationStatus};
use crate::core::{Purpose, RecoveryAction, RecoveryEngine, SupervisorError};
use crate::fallback::{FallbackChain, FallbackContext, FallbackLevel};
use crate::memory::conversation::{META_AGENT, META_FALLBACK_LEVEL};
use crate::memory::{Message, MessageMetadata};
use crate::observability::Metrics;
use crate::supervisor::{AgentSelector, StreamingEmitter};

/// 路由器所处阶段（仅用于日志与回合记录）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPhase {
    Idle,
    Routing,
    Dispatching,
    Finalizing,
    Ended,
}

impl RouterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterPhase::Idle => "idle",
            RouterPhase::Routing => "routing",
            RouterPhase::Dispatching => "dispatching",
            RouterPhase::Finalizing => "finalizing",
            RouterPhase::Ended => "ended",
        }
    }
}

/// 本轮以哪种终止事件结束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Done,
    Error,
}

/// 一轮的结果摘要
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    /// 本轮追加的终止消息（助手回复或 end-of-turn 哨兵）
    pub final_message: Message,
    pub terminal: TerminalKind,
    /// 回复来自降级链时的级别
    pub fallback_level: Option<FallbackLevel>,
    /// 产出最终回复的 agent
    pub agent: Option<String>,
    /// 按顺序派发过的 agent
    pub dispatched: Vec<String>,
    /// 重置前的本轮计数
    pub total_iterations: u32,
    pub agent_attempts: BTreeMap<String, u32>,
    pub budget_exhausted: bool,
    pub phases: Vec<RouterPhase>,
}

impl TurnOutcome {
    pub fn response(&self) -> &str {
        &self.final_message.content
    }

    pub fn is_cancelled(&self) -> bool {
        self.final_message.is_end_of_turn()
    }
}

struct TurnTrace {
    conversation_id: String,
    phases: Vec<RouterPhase>,
    dispatched: Vec<String>,
    budget_exhausted: bool,
    started: Instant,
}

impl TurnTrace {
    fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            phases: vec![RouterPhase::Idle],
            dispatched: Vec::new(),
            budget_exhausted: false,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, phase: RouterPhase) {
        let from = self.phases.last().copied().unwrap_or(RouterPhase::Idle);
        tracing::debug!(
            conversation_id = %self.conversation_id,
            from = from.as_str(),
            phase = phase.as_str(),
            "router transition"
        );
        self.phases.push(phase);
    }
}

/// 本轮最终回复的来源
struct Resolution {
    text: String,
    level: Option<FallbackLevel>,
    agent: Option<String>,
    purpose: Option<Purpose>,
    /// 从派发失败中恢复时的错误描述，决定终止事件为 error
    recovered_from: Option<(String, String)>,
}

pub struct SupervisorRouter {
    dispatcher: Arc<AgentDispatcher>,
    selector: Arc<dyn AgentSelector>,
    fallback: Arc<FallbackChain>,
    guard: LoopGuard,
    recovery: RecoveryEngine,
    max_delegation_hops: u32,
    history_window: usize,
    chunk_chars: usize,
    metrics: Arc<Metrics>,
}

impl SupervisorRouter {
    pub fn new(
        dispatcher: Arc<AgentDispatcher>,
        selector: Arc<dyn AgentSelector>,
        fallback: Arc<FallbackChain>,
    ) -> Self {
        let cfg = AppConfig::default();
        Self {
            dispatcher,
            selector,
            fallback,
            guard: LoopGuard::from_config(&cfg.supervisor),
            recovery: RecoveryEngine::new(),
            max_delegation_hops: cfg.supervisor.max_delegation_hops,
            history_window: cfg.fallback.history_window,
            chunk_chars: cfg.stream.chunk_chars,
            metrics: Metrics::global(),
        }
    }

    /// 预算、委派深度、降级窗口与分片大小取自配置
    pub fn from_config(
        cfg: &AppConfig,
        dispatcher: Arc<AgentDispatcher>,
        selector: Arc<dyn AgentSelector>,
        fallback: Arc<FallbackChain>,
    ) -> Self {
        Self::new(dispatcher, selector, fallback)
            .with_loop_guard(LoopGuard::from_config(&cfg.supervisor))
            .with_max_delegation_hops(cfg.supervisor.max_delegation_hops)
            .with_history_window(cfg.fallback.history_window)
            .with_chunk_chars(cfg.stream.chunk_chars)
    }

    pub fn with_loop_guard(mut self, guard: LoopGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_max_delegation_hops(mut self, hops: u32) -> Self {
        self.max_delegation_hops = hops;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn loop_guard(&self) -> LoopGuard {
        self.guard
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.dispatcher.agent_ids()
    }

    /// 处理一条用户消息，直到本轮结束。
    ///
    /// 调用方需持有该会话的独占访问（见 ConversationStore）。除 FallbackExhausted 外总是返回 Ok，
    /// 且返回前 emitter 一定已发出终止事件。
    pub async fn run_turn(
        &self,
        state: &mut ConversationState,
        user_input: &str,
        emitter: &mut StreamingEmitter,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, SupervisorError> {
        state.normalize();
        // Idle → Routing：新一轮从完整预算开始
        state.reset_turn_counters();
        let conversation_id = state.conversation_id().to_string();
        let mut trace = TurnTrace::new(&conversation_id);
        self.metrics.record_turn();
        state.set_status(ConversationStatus::Active);
        state.append_message(Message::user(user_input));
        tracing::info!(conversation_id = %conversation_id, "turn started");

        let available = self.dispatcher.agent_ids();
        let mut pending: Option<(String, Option<String>)> = None;
        let mut last_output: Option<(String, String)> = None;
        let mut failure: Option<SupervisorError> = None;
        let mut hops = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.end_cancelled(state, emitter, trace));
            }

            trace.enter(RouterPhase::Routing);
            let (agent_id, delegated_by) = match pending.take() {
                Some(target) => target,
                None => match self.select(state, &available, cancel).await {
                    Some(Some(id)) => (id, last_output.as_ref().map(|(a, _)| a.clone())),
                    Some(None) => break,
                    None => return Ok(self.end_cancelled(state, emitter, trace)),
                },
            };

            trace.enter(RouterPhase::Dispatching);
            let permit = match self.guard.try_dispatch(state, &agent_id) {
                Ok(permit) => permit,
                Err(denial) => {
                    let err = SupervisorError::BudgetExceeded {
                        agent: agent_id.clone(),
                    };
                    let action = self.recovery.handle(&err);
                    debug_assert_eq!(action, RecoveryAction::Finalize);
                    self.metrics.record_budget_denial();
                    trace.budget_exhausted = true;
                    tracing::info!(
                        conversation_id = %conversation_id,
                        agent = %agent_id,
                        denial = ?denial,
                        "dispatch budget exhausted, finalizing"
                    );
                    break;
                }
            };

            state.set_status(ConversationStatus::AwaitingAgent);
            trace.dispatched.push(agent_id.clone());
            let context = AgentContext {
                conversation_id: conversation_id.clone(),
                iteration: permit.iteration,
                hop: hops,
                delegated_by,
            };
            let messages = state.get_messages();
            let metadata = MessageMetadata::new();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = self.dispatcher.dispatch(&agent_id, &messages, &context, &metadata) => Some(r),
            };
            let Some(result) = result else {
                return Ok(self.end_cancelled(state, emitter, trace));
            };
            state.set_status(ConversationStatus::Active);

            match result {
                Ok(reply) => {
                    if !reply.response.trim().is_empty() {
                        let mut message = Message::agent(&agent_id, reply.response.clone());
                        for (key, value) in reply.metadata {
                            message.metadata.entry(key).or_insert(value);
                        }
                        state.append_message(message);
                        last_output = Some((agent_id.clone(), reply.response));
                    }

                    if reply.next == NextStep::Finish {
                        break;
                    }
                    if hops >= self.max_delegation_hops {
                        tracing::info!(
                            conversation_id = %conversation_id,
                            agent = %agent_id,
                            hops,
                            "delegation hop limit reached, finalizing"
                        );
                        break;
                    }
                    hops += 1;
                    match reply.next {
                        NextStep::Delegate(target) => match resolve_agent(&available, &target) {
                            Some(resolved) => {
                                tracing::debug!(
                                    conversation_id = %conversation_id,
                                    from = %agent_id,
                                    to = %resolved,
                                    "agent delegated"
                                );
                                pending = Some((resolved, Some(agent_id)));
                            }
                            None => {
                                tracing::warn!(
                                    conversation_id = %conversation_id,
                                    from = %agent_id,
                                    to = %target,
                                    "delegation to unknown agent, rerouting"
                                );
                            }
                        },
                        _ => {}
                    }
                }
                Err(source) => {
                    let err = SupervisorError::Dispatch {
                        agent: agent_id.clone(),
                        source,
                    };
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        agent = %agent_id,
                        error = %err,
                        "agent dispatch failed, recovering via fallback"
                    );
                    failure = Some(err);
                    break;
                }
            }
        }

        trace.enter(RouterPhase::Finalizing);
        state.set_status(ConversationStatus::Finalizing);

        let resolution = if let Some(err) = failure {
            let purpose = match self.recovery.handle(&err) {
                RecoveryAction::Fallback(purpose) => purpose,
                _ => Purpose::ErrorRecovery,
            };
            let agent = match &err {
                SupervisorError::Dispatch { agent, .. } => Some(agent.clone()),
                _ => None,
            };
            let reason = err.to_string();
            self.fallback_resolution(state, user_input, purpose, agent, Some(reason), &available, cancel)
                .await
        } else if let Some((agent, text)) = last_output {
            Ok(Some(Resolution {
                text,
                level: None,
                agent: Some(agent),
                purpose: None,
                recovered_from: None,
            }))
        } else {
            let purpose = if trace.budget_exhausted {
                Purpose::BudgetExhausted
            } else {
                Purpose::DirectResponse
            };
            self.fallback_resolution(state, user_input, purpose, None, None, &available, cancel)
                .await
        };

        let resolution = match resolution {
            Ok(Some(resolution)) => resolution,
            Ok(None) => return Ok(self.end_cancelled(state, emitter, trace)),
            Err(err) => {
                self.end_faulted(state, emitter, trace, &err);
                return Err(err);
            }
        };

        let mut message = Message::assistant(resolution.text.clone())
            .with_meta("iterations", state.total_iterations());
        if let Some(agent) = &resolution.agent {
            message = message.with_meta(META_AGENT, agent.as_str());
        }
        if let Some(level) = resolution.level {
            message = message.with_meta(META_FALLBACK_LEVEL, level.label());
        }
        if let Some(purpose) = resolution.purpose {
            message = message.with_meta("purpose", purpose.as_str());
        }
        if let Some((agent, error)) = &resolution.recovered_from {
            message = message
                .with_meta("failed_agent", agent.as_str())
                .with_meta("error", error.as_str());
        }
        state.append_message(message.clone());
        let final_message = state.last_message().unwrap_or(message);

        emitter.stream_text(&resolution.text, self.chunk_chars);
        let level_label = resolution.level.map(|l| l.label().to_string());
        let terminal = match &resolution.recovered_from {
            Some((_, error)) => {
                emitter.error(error.clone(), level_label);
                TerminalKind::Error
            }
            None => {
                emitter.done(resolution.agent.clone(), level_label);
                TerminalKind::Done
            }
        };
        self.metrics.record_terminal(terminal == TerminalKind::Error);

        Ok(self.finish(
            state,
            trace,
            final_message,
            terminal,
            resolution.level,
            resolution.agent,
        ))
    }

    /// Some(Some(id)) 派发；Some(None) 直接作答；None 表示已取消
    async fn select(
        &self,
        state: &ConversationState,
        available: &[String],
        cancel: &CancellationToken,
    ) -> Option<Option<String>> {
        if available.is_empty() {
            return Some(None);
        }
        let messages = state.get_messages();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = self.selector.select_agent(&messages, available) => r,
        };
        Some(match result {
            Ok(Some(id)) if available.contains(&id) => Some(id),
            Ok(Some(id)) => {
                tracing::warn!(
                    conversation_id = %state.conversation_id(),
                    agent = %id,
                    "selector returned unregistered agent, answering directly"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                let action = self.recovery.handle(&err);
                tracing::warn!(
                    conversation_id = %state.conversation_id(),
                    error = %err,
                    action = ?action,
                    "routing failed, answering directly"
                );
                None
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fallback_resolution(
        &self,
        state: &ConversationState,
        user_input: &str,
        purpose: Purpose,
        agent: Option<String>,
        error: Option<String>,
        available: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<Resolution>, SupervisorError> {
        let mut context = FallbackContext::new(purpose)
            .with_history(state.get_messages())
            .with_agents(available.to_vec());
        let skip = context.history.len().saturating_sub(self.history_window);
        context.history.drain(..skip);
        if let Some(error) = &error {
            context = context.with_error(agent.as_deref(), error.clone());
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            r = self.fallback.generate_response(user_input, state.conversation_id(), &context) => r?,
        };
        Ok(Some(Resolution {
            text: response.text,
            level: Some(response.level),
            agent: None,
            purpose: Some(purpose),
            recovered_from: match (agent, error) {
                (Some(agent), Some(error)) => Some((agent, error)),
                (None, Some(error)) => Some((String::new(), error)),
                _ => None,
            },
        }))
    }

    fn end_cancelled(
        &self,
        state: &mut ConversationState,
        emitter: &mut StreamingEmitter,
        mut trace: TurnTrace,
    ) -> TurnOutcome {
        let action = self.recovery.handle(&SupervisorError::Cancelled);
        debug_assert_eq!(action, RecoveryAction::EndTurn);
        if trace.phases.last() != Some(&RouterPhase::Finalizing) {
            trace.enter(RouterPhase::Finalizing);
        }
        let sentinel = Message::end_of_turn("cancelled");
        state.append_message(sentinel.clone());
        let final_message = state.last_message().unwrap_or(sentinel);
        emitter.error("cancelled", None);
        self.metrics.record_terminal(true);
        tracing::info!(conversation_id = %trace.conversation_id, "turn cancelled");
        self.finish(state, trace, final_message, TerminalKind::Error, None, None)
    }

    fn end_faulted(
        &self,
        state: &mut ConversationState,
        emitter: &mut StreamingEmitter,
        trace: TurnTrace,
        err: &SupervisorError,
    ) {
        tracing::error!(
            conversation_id = %trace.conversation_id,
            error = %err,
            "integrity fault, ending turn without reply"
        );
        state.append_message(Message::end_of_turn("integrity_fault"));
        emitter.error(err.to_string(), None);
        self.metrics.record_terminal(true);
        let final_message = state
            .last_message()
            .unwrap_or_else(|| Message::end_of_turn("integrity_fault"));
        self.finish(state, trace, final_message, TerminalKind::Error, None, None);
    }

    /// Ended → Idle：记录本轮计数后清零
    fn finish(
        &self,
        state: &mut ConversationState,
        mut trace: TurnTrace,
        final_message: Message,
        terminal: TerminalKind,
        fallback_level: Option<FallbackLevel>,
        agent: Option<String>,
    ) -> TurnOutcome {
        trace.enter(RouterPhase::Ended);
        state.set_status(ConversationStatus::Ended);
        let total_iterations = state.total_iterations();
        let agent_attempts = state.agent_attempts();
        state.reset_turn_counters();

        tracing::info!(
            conversation_id = %trace.conversation_id,
            iterations = total_iterations,
            level = fallback_level.map(|l| l.as_str()).unwrap_or("agent"),
            terminal = ?terminal,
            elapsed_ms = trace.started.elapsed().as_millis() as u64,
            "turn ended"
        );

        TurnOutcome {
            conversation_id: trace.conversation_id,
            final_message,
            terminal,
            fallback_level,
            agent,
            dispatched: trace.dispatched,
            total_iterations,
            agent_attempts,
            budget_exhausted: trace.budget_exhausted,
            phases: trace.phases,
        }
    }
}

/// 精确匹配优先，其次忽略大小写
fn resolve_agent(available: &[String], target: &str) -> Option<String> {
    available
        .iter()
        .find(|id| id.as_str() == target)
        .or_else(|| available.iter().find(|id| id.eq_ignore_ascii_case(target)))
        .cloned()
}
