//! 核心：会话状态、预算、错误与恢复、会话存储与取消、组装

pub mod builder;
pub mod error;
pub mod loop_guard;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod store;

pub use builder::{create_llm_client, EndpointRole, SupervisorBuilder};
pub use error::{AgentError, Purpose, RecoveryAction, SupervisorError};
pub use loop_guard::{BudgetDenial, DispatchPermit, LoopGuard};
pub use orchestrator::{create_supervisor, Supervisor};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{normalize_state, ConversationId, ConversationState, ConversationStatus, StateRepr};
pub use store::{ConversationStore, SharedState};
