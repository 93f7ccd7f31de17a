//! Agent 层：能力提供方的统一调用接口、注册表、带超时的派发器，以及配置驱动的 LLM agent

pub mod dispatcher;
pub mod llm_agent;
pub mod registry;

pub use dispatcher::AgentDispatcher;
pub use llm_agent::{parse_directive, LlmAgent};
pub use registry::{Agent, AgentContext, AgentRegistry, AgentReply, NextStep};
