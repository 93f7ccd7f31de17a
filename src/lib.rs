//! Hive - 多 agent 监督式编排核心
//!
//! 模块划分：
//! - **agents**: Agent trait、注册表、带超时的派发器、基于 LLM 的 agent
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态与安全访问器、Loop Guard、错误与恢复、会话存储、取消、组装
//! - **fallback**: 四级降级链（Primary → Secondary → RuleBased → Emergency）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 本地模型 / Mock）
//! - **memory**: 消息模型与会话快照
//! - **observability**: 日志初始化与计数器
//! - **supervisor**: agent 选择、单轮路由状态机、流式事件

pub mod agents;
pub mod config;
pub mod core;
pub mod fallback;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod supervisor;

pub use crate::core::{create_supervisor, Supervisor, SupervisorBuilder};
pub use crate::supervisor::{StreamEvent, TurnOutcome};
