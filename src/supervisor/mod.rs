//! Supervisor：选择 agent、驱动单轮状态机、把结果流式推给消费端

pub mod emitter;
pub mod events;
pub mod router;
pub mod selector;

pub use emitter::{channel, StreamingEmitter, TurnStream};
pub use events::StreamEvent;
pub use router::{RouterPhase, SupervisorRouter, TerminalKind, TurnOutcome};
pub use selector::{AgentSelector, KeywordAgentSelector, LlmAgentSelector, NoAgentSelector};
