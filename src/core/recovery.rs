//! 错误恢复引擎
//!
//! 根据 SupervisorError 返回 RecoveryAction，供路由状态机决定下一步；除完整性缺陷外都在路由边界内恢复。

use crate::core::{Purpose, RecoveryAction, SupervisorError};

/// 错误 -> 恢复动作映射
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &SupervisorError) -> RecoveryAction {
        match err {
            SupervisorError::Routing(_) => RecoveryAction::AnswerDirectly,
            SupervisorError::Dispatch { .. } => RecoveryAction::Fallback(Purpose::ErrorRecovery),
            SupervisorError::BudgetExceeded { .. } => RecoveryAction::Finalize,
            SupervisorError::Cancelled => RecoveryAction::EndTurn,
            SupervisorError::FallbackExhausted
            | SupervisorError::InvalidState(_)
            | SupervisorError::Config(_) => RecoveryAction::Escalate,
        }
    }

    /// 是否必须作为致命信号上报
    pub fn is_fatal(&self, err: &SupervisorError) -> bool {
        matches!(self.handle(err), RecoveryAction::Escalate)
    }
}
