//! 可观测性：日志初始化与进程内计数器
//!
//! Metrics 记录降级链每个级别的成功 / 失败、agent 调用结果、本轮终止事件与完整性故障，
//! 由 web 入口以 JSON / Prometheus 文本导出。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::fallback::FallbackLevel;

/// 日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    Ok,
    Error,
    Timeout,
    Empty,
}

impl AgentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentOutcome::Ok => "ok",
            AgentOutcome::Error => "error",
            AgentOutcome::Timeout => "timeout",
            AgentOutcome::Empty => "empty",
        }
    }
}

#[derive(Debug, Default)]
struct LevelCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    levels: [LevelCounters; 4],
    agent_successes: AtomicU64,
    agent_failures: AtomicU64,
    agent_timeouts: AtomicU64,
    budget_denials: AtomicU64,
    turns: AtomicU64,
    terminal_done: AtomicU64,
    terminal_error: AtomicU64,
    integrity_faults: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LevelSnapshot {
    pub level: &'static str,
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub fallback: Vec<LevelSnapshot>,
    pub agent_successes: u64,
    pub agent_failures: u64,
    pub agent_timeouts: u64,
    pub budget_denials: u64,
    pub turns: u64,
    pub terminal_done: u64,
    pub terminal_error: u64,
    pub integrity_faults: u64,
}

impl MetricsSnapshot {
    pub fn level(&self, level: FallbackLevel) -> (u64, u64) {
        self.fallback
            .iter()
            .find(|l| l.level == level.as_str())
            .map(|l| (l.success, l.failure))
            .unwrap_or((0, 0))
    }
}

static GLOBAL: OnceLock<Arc<Metrics>> = OnceLock::new();

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级实例（生产路径共享）；测试请用 Metrics::new() 隔离
    pub fn global() -> Arc<Metrics> {
        GLOBAL.get_or_init(|| Arc::new(Metrics::new())).clone()
    }

    pub fn record_fallback(&self, level: FallbackLevel, ok: bool) {
        let counters = &self.levels[level.index()];
        if ok {
            counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_agent(&self, outcome: AgentOutcome) {
        let counter = match outcome {
            AgentOutcome::Ok => &self.agent_successes,
            AgentOutcome::Timeout => &self.agent_timeouts,
            AgentOutcome::Error | AgentOutcome::Empty => &self.agent_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_denial(&self) {
        self.budget_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn(&self) {
        self.turns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal(&self, is_error: bool) {
        if is_error {
            self.terminal_error.fetch_add(1, Ordering::Relaxed);
        } else {
            self.terminal_done.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_integrity_fault(&self) {
        self.integrity_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fallback: FallbackLevel::ALL
                .iter()
                .map(|level| {
                    let c = &self.levels[level.index()];
                    LevelSnapshot {
                        level: level.as_str(),
                        success: c.success.load(Ordering::Relaxed),
                        failure: c.failure.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            agent_successes: self.agent_successes.load(Ordering::Relaxed),
            agent_failures: self.agent_failures.load(Ordering::Relaxed),
            agent_timeouts: self.agent_timeouts.load(Ordering::Relaxed),
            budget_denials: self.budget_denials.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
            terminal_done: self.terminal_done.load(Ordering::Relaxed),
            terminal_error: self.terminal_error.load(Ordering::Relaxed),
            integrity_faults: self.integrity_faults.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }

    /// Prometheus 文本格式
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        out.push_str("# TYPE hive_fallback_total counter\n");
        for l in &s.fallback {
            out.push_str(&format!(
                "hive_fallback_total{{level=\"{}\",outcome=\"success\"}} {}\n",
                l.level, l.success
            ));
            out.push_str(&format!(
                "hive_fallback_total{{level=\"{}\",outcome=\"failure\"}} {}\n",
                l.level, l.failure
            ));
        }
        out.push_str("# TYPE hive_agent_calls_total counter\n");
        for (outcome, v) in [
            ("ok", s.agent_successes),
            ("error", s.agent_failures),
            ("timeout", s.agent_timeouts),
        ] {
            out.push_str(&format!(
                "hive_agent_calls_total{{outcome=\"{outcome}\"}} {v}\n"
            ));
        }
        out.push_str("# TYPE hive_turns_total counter\n");
        out.push_str(&format!("hive_turns_total {}\n", s.turns));
        out.push_str("# TYPE hive_terminal_events_total counter\n");
        out.push_str(&format!(
            "hive_terminal_events_total{{kind=\"done\"}} {}\n",
            s.terminal_done
        ));
        out.push_str(&format!(
            "hive_terminal_events_total{{kind=\"error\"}} {}\n",
            s.terminal_error
        ));
        out.push_str(&format!("hive_budget_denials_total {}\n", s.budget_denials));
        out.push_str(&format!("hive_integrity_faults_total {}\n", s.integrity_faults));
        out
    }
}
