//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SUPERVISOR__MAX_TOTAL_ITERATIONS=6`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::SupervisorError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub supervisor: SupervisorSection,
    pub fallback: FallbackSection,
    pub stream: StreamSection,
    pub llm: LlmSection,
    /// [[agents]]：启动时注册的 agent
    pub agents: Vec<AgentEntry>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话快照目录；未设置时不落盘
    pub sessions_dir: Option<PathBuf>,
}

/// [supervisor] 段：派发预算与 agent 超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub max_total_iterations: u32,
    pub max_attempts_per_agent: u32,
    /// 单轮内 agent -> agent 的最大委派跳数
    pub max_delegation_hops: u32,
    pub agent_timeout_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_total_iterations: 8,
            max_attempts_per_agent: 2,
            max_delegation_hops: 4,
            agent_timeout_secs: 60,
        }
    }
}

impl SupervisorSection {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

/// [fallback] 段：Primary / Secondary 级别超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackSection {
    pub primary_timeout_secs: u64,
    pub secondary_timeout_secs: u64,
    /// 传给 LLM 级别的最近消息条数
    pub history_window: usize,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            primary_timeout_secs: 30,
            secondary_timeout_secs: 20,
            history_window: 12,
        }
    }
}

impl FallbackSection {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_secs(self.primary_timeout_secs)
    }

    pub fn secondary_timeout(&self) -> Duration {
        Duration::from_secs(self.secondary_timeout_secs)
    }
}

/// [stream] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// 最终回复按多少字符切成一个 chunk 事件
    pub chunk_chars: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self { chunk_chars: 24 }
    }
}

/// [llm] 段：主模型与本地备用模型
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmSection {
    pub primary: LlmEndpoint,
    pub secondary: LlmEndpoint,
}

/// 单个 OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmEndpoint {
    /// openai / deepseek / local / none；为空时按 API Key 自动判断
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名（缺省按 provider 推断）
    pub api_key_env: Option<String>,
    /// 显式关闭该级别
    pub disabled: bool,
}

/// [[agents]] 条目：由 LLM 驱动的专职 agent
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentEntry {
    pub id: String,
    pub description: String,
    pub prompt: String,
    /// 关键词选择器使用
    pub keywords: Vec<String>,
}

impl AppConfig {
    /// 预算必须为正；agent id 不能为空或重复
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let s = &self.supervisor;
        if s.max_total_iterations == 0 {
            return Err(SupervisorError::Config(
                "supervisor.max_total_iterations must be > 0".into(),
            ));
        }
        if s.max_attempts_per_agent == 0 {
            return Err(SupervisorError::Config(
                "supervisor.max_attempts_per_agent must be > 0".into(),
            ));
        }
        if s.max_delegation_hops == 0 {
            return Err(SupervisorError::Config(
                "supervisor.max_delegation_hops must be > 0".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(SupervisorError::Config("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(SupervisorError::Config(format!(
                    "duplicate agent id: {}",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_positive() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.supervisor.max_total_iterations, 8);
        assert_eq!(cfg.supervisor.max_attempts_per_agent, 2);
        assert_eq!(cfg.fallback.primary_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.stream.chunk_chars, 24);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut cfg = AppConfig::default();
        cfg.supervisor.max_attempts_per_agent = 0;
        assert!(matches!(cfg.validate(), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_agents() {
        let mut cfg = AppConfig::default();
        let entry = AgentEntry {
            id: "code".into(),
            ..Default::default()
        };
        cfg.agents = vec![entry.clone(), entry];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[supervisor]
max_total_iterations = 3

[fallback]
primary_timeout_secs = 5

[llm.secondary]
provider = "local"
base_url = "http://localhost:11434/v1"
model = "llama3.1"

[[agents]]
id = "research"
description = "Looks things up"
keywords = ["research", "find"]
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.supervisor.max_total_iterations, 3);
        assert_eq!(cfg.supervisor.max_attempts_per_agent, 2);
        assert_eq!(cfg.fallback.primary_timeout_secs, 5);
        assert_eq!(cfg.fallback.secondary_timeout_secs, 20);
        assert_eq!(cfg.llm.secondary.model.as_deref(), Some("llama3.1"));
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.agents[0].keywords, vec!["research", "find"]);
    }
}
