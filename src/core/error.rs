//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 SupervisorError 决定直接回答 / 走降级链 / 收尾 / 上报致命错误。

use thiserror::Error;

use crate::llm::LlmError;

/// 单个 agent 调用失败的原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent failed: {0}")]
    Failed(String),

    #[error("Agent timeout: {0}")]
    Timeout(String),

    /// 空字符串或纯空白回复，按失败处理
    #[error("Agent returned empty response: {0}")]
    EmptyResponse(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// 监督路由层的错误分类
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// 选 agent 本身失败；按「未选中 agent」处理
    #[error("Routing error: {0}")]
    Routing(String),

    /// 选中的 agent 调用失败或超时；交给降级链
    #[error("Dispatch to '{agent}' failed: {source}")]
    Dispatch {
        agent: String,
        #[source]
        source: AgentError,
    },

    /// Loop Guard 拒绝派发：不是错误，是收尾信号
    #[error("Dispatch budget exceeded for '{agent}'")]
    BudgetExceeded { agent: String },

    /// 取消（用户 Stop / 外部调用方取消）
    #[error("Turn cancelled")]
    Cancelled,

    /// 降级链耗尽：按构造不会发生，发生即为系统完整性缺陷
    #[error("Fallback chain exhausted")]
    FallbackExhausted,

    #[error("Invalid conversation state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 意图：调用降级链的目的（写入降级上下文与日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// supervisor 不委派，直接回答
    DirectResponse,
    /// agent 调用失败后的恢复
    ErrorRecovery,
    /// 预算耗尽且本轮没有可用的 agent 输出
    BudgetExhausted,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::DirectResponse => "direct_response",
            Purpose::ErrorRecovery => "error_recovery",
            Purpose::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 当作未选中 agent，由 supervisor 直接回答
    AnswerDirectly,
    /// 交给降级链
    Fallback(Purpose),
    /// 停止派发，进入 Finalizing
    Finalize,
    /// 写入 end-of-turn 哨兵结束本轮
    EndTurn,
    /// 完整性缺陷，上报监控
    Escalate,
}
