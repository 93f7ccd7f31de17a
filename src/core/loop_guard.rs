//! Loop Guard：单轮派发预算
//!
//! 每次派发 agent 前检查「全局迭代数 < 上限」且「该 agent 尝试次数 < 上限」，通过后立即记账。
//! 拒绝不是错误，而是让路由器直接进入 Finalizing 的控制信号。

use crate::config::SupervisorSection;
use crate::core::state::ConversationState;

/// 纯函数版本的预算检查
pub fn can_dispatch(
    state: &ConversationState,
    agent_id: &str,
    max_total_iterations: u32,
    max_attempts_per_agent: u32,
) -> bool {
    state.total_iterations() < max_total_iterations
        && state.attempts_for(agent_id) < max_attempts_per_agent
}

/// 记一次派发：全局迭代 +1，该 agent 尝试 +1
pub fn record_dispatch(state: &mut ConversationState, agent_id: &str) {
    state.record_dispatch(agent_id);
}

/// 预算被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDenial {
    TotalIterations { used: u32, max: u32 },
    AgentAttempts { agent: String, used: u32, max: u32 },
}

/// 通过检查并已记账的派发凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPermit {
    pub agent_id: String,
    /// 本轮第几次派发（从 1 开始）
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopGuard {
    max_total_iterations: u32,
    max_attempts_per_agent: u32,
}

impl LoopGuard {
    /// 上限至少为 1（配置校验会拒绝 0，这里再兜一次底）
    pub fn new(max_total_iterations: u32, max_attempts_per_agent: u32) -> Self {
        Self {
            max_total_iterations: max_total_iterations.max(1),
            max_attempts_per_agent: max_attempts_per_agent.max(1),
        }
    }

    pub fn from_config(cfg: &SupervisorSection) -> Self {
        Self::new(cfg.max_total_iterations, cfg.max_attempts_per_agent)
    }

    pub fn max_total_iterations(&self) -> u32 {
        self.max_total_iterations
    }

    pub fn max_attempts_per_agent(&self) -> u32 {
        self.max_attempts_per_agent
    }

    pub fn can_dispatch(&self, state: &ConversationState, agent_id: &str) -> bool {
        can_dispatch(
            state,
            agent_id,
            self.max_total_iterations,
            self.max_attempts_per_agent,
        )
    }

    pub fn record_dispatch(&self, state: &mut ConversationState, agent_id: &str) {
        debug_assert!(self.can_dispatch(state, agent_id));
        record_dispatch(state, agent_id);
    }

    /// 检查 + 记账作为一个不可分割的单元；&mut 借用保证同一会话内不会读到过期计数
    pub fn try_dispatch(
        &self,
        state: &mut ConversationState,
        agent_id: &str,
    ) -> Result<DispatchPermit, BudgetDenial> {
        if state.total_iterations() >= self.max_total_iterations {
            return Err(BudgetDenial::TotalIterations {
                used: state.total_iterations(),
                max: self.max_total_iterations,
            });
        }
        let used = state.attempts_for(agent_id);
        if used >= self.max_attempts_per_agent {
            return Err(BudgetDenial::AgentAttempts {
                agent: agent_id.to_string(),
                used,
                max: self.max_attempts_per_agent,
            });
        }
        record_dispatch(state, agent_id);
        Ok(DispatchPermit {
            agent_id: agent_id.to_string(),
            iteration: state.total_iterations(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_agent_ceiling() {
        let guard = LoopGuard::new(10, 1);
        let mut state = ConversationState::new("c1");
        assert!(guard.can_dispatch(&state, "research"));
        let permit = guard.try_dispatch(&mut state, "research").unwrap();
        assert_eq!(permit.iteration, 1);
        assert!(!guard.can_dispatch(&state, "research"));
        assert!(guard.can_dispatch(&state, "code"));
        assert_eq!(
            guard.try_dispatch(&mut state, "research"),
            Err(BudgetDenial::AgentAttempts {
                agent: "research".to_string(),
                used: 1,
                max: 1
            })
        );
        assert_eq!(state.attempts_for("research"), 1);
    }

    #[test]
    fn test_global_ceiling() {
        let guard = LoopGuard::new(2, 5);
        let mut state = ConversationState::new("c1");
        guard.try_dispatch(&mut state, "a").unwrap();
        guard.try_dispatch(&mut state, "b").unwrap();
        assert!(matches!(
            guard.try_dispatch(&mut state, "c"),
            Err(BudgetDenial::TotalIterations { used: 2, max: 2 })
        ));
        assert_eq!(state.total_iterations(), 2);
        assert_eq!(state.attempts_for("c"), 0);
    }

    #[test]
    fn test_counters_never_exceed_limits() {
        let guard = LoopGuard::new(5, 2);
        let mut state = ConversationState::new("c1");
        for agent in ["a", "a", "a", "b", "b", "b", "c", "c"].iter().cycle().take(40) {
            let _ = guard.try_dispatch(&mut state, agent);
            assert!(state.total_iterations() <= 5);
            assert!(state.attempts_for(agent) <= 2);
        }
        assert_eq!(state.total_iterations(), 5);
    }

    #[test]
    fn test_free_function_matches_guard() {
        let mut state = ConversationState::new("c1");
        assert!(can_dispatch(&state, "x", 1, 1));
        record_dispatch(&mut state, "x");
        assert!(!can_dispatch(&state, "x", 1, 1));
        assert!(!can_dispatch(&state, "y", 1, 1));
    }

    #[test]
    fn test_zero_limits_clamped() {
        let guard = LoopGuard::new(0, 0);
        assert_eq!(guard.max_total_iterations(), 1);
        assert_eq!(guard.max_attempts_per_agent(), 1);
    }
}
