//! Supervisor 构建器：统一的初始化逻辑
//!
//! 从 AppConfig 组装 LLM 客户端、agent 注册表、选择器、降级链与路由器。CLI 与 Web 共用这一条路径，
//! 测试可以通过 with_llms / with_agent / with_selector 替换任意部件。

use std::sync::Arc;

use crate::agents::{Agent, AgentDispatcher, AgentRegistry, LlmAgent};
use crate::config::{AppConfig, LlmEndpoint};
use crate::core::orchestrator::Supervisor;
use crate::core::SupervisorError;
use crate::fallback::{FallbackChain, LlmFallback, RuleBasedResponder};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, DEEPSEEK_BASE_URL};
use crate::memory::ConversationPersistence;
use crate::observability::Metrics;
use crate::supervisor::{AgentSelector, KeywordAgentSelector, LlmAgentSelector, SupervisorRouter};

const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434/v1";

/// 端点在降级链中的位置，决定缺省 provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Primary,
    Secondary,
}

/// 根据配置与环境变量创建 LLM 客户端；未配置或缺少 Key 时返回 None
pub fn create_llm_client(endpoint: &LlmEndpoint, role: EndpointRole) -> Option<Arc<dyn LlmClient>> {
    if endpoint.disabled {
        return None;
    }
    let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

    let provider = match endpoint.provider.as_deref().map(str::to_lowercase) {
        Some(p) if !p.trim().is_empty() => p,
        _ => match role {
            EndpointRole::Primary if env("DEEPSEEK_API_KEY").is_some() => "deepseek".into(),
            EndpointRole::Primary if env("OPENAI_API_KEY").is_some() => "openai".into(),
            EndpointRole::Primary => "none".into(),
            EndpointRole::Secondary if endpoint.base_url.is_some() => "local".into(),
            EndpointRole::Secondary => "none".into(),
        },
    };

    let key_env = endpoint.api_key_env.clone().unwrap_or_else(|| match provider.as_str() {
        "deepseek" => "DEEPSEEK_API_KEY".to_string(),
        _ => "OPENAI_API_KEY".to_string(),
    });

    match provider.as_str() {
        "none" => None,
        "mock" => {
            tracing::warn!(?role, "Using Mock LLM");
            Some(Arc::new(MockLlmClient))
        }
        "deepseek" | "openai" => {
            let Some(key) = env(&key_env) else {
                tracing::warn!(?role, provider = %provider, key_env = %key_env, "API key not set, level disabled");
                return None;
            };
            let (default_model, default_base) = if provider == "deepseek" {
                ("deepseek-chat", Some(DEEPSEEK_BASE_URL))
            } else {
                ("gpt-4o-mini", None)
            };
            let model = endpoint.model.as_deref().unwrap_or(default_model);
            let base = endpoint.base_url.as_deref().or(default_base);
            tracing::info!(?role, provider = %provider, model, "Using OpenAI-compatible LLM");
            Some(Arc::new(OpenAiClient::new(base, model, Some(&key))))
        }
        "local" => {
            let model = endpoint.model.as_deref().unwrap_or("llama3.1");
            let base = endpoint.base_url.as_deref().unwrap_or(DEFAULT_LOCAL_BASE_URL);
            let key = env(&key_env).unwrap_or_else(|| "local".to_string());
            tracing::info!(?role, model, base_url = base, "Using local LLM");
            Some(Arc::new(OpenAiClient::new(Some(base), model, Some(&key))))
        }
        other => {
            tracing::warn!(?role, provider = other, "Unknown LLM provider, level disabled");
            None
        }
    }
}

pub struct SupervisorBuilder {
    config: AppConfig,
    registry: AgentRegistry,
    selector: Option<Arc<dyn AgentSelector>>,
    /// None 表示按配置创建
    llms: Option<(Option<Arc<dyn LlmClient>>, Option<Arc<dyn LlmClient>>)>,
    metrics: Arc<Metrics>,
    persistence: Option<ConversationPersistence>,
}

impl SupervisorBuilder {
    pub fn new(config: AppConfig) -> Self {
        let persistence = config
            .app
            .sessions_dir
            .as_ref()
            .map(ConversationPersistence::new);
        Self {
            config,
            registry: AgentRegistry::new(),
            selector: None,
            llms: None,
            metrics: Metrics::global(),
            persistence,
        }
    }

    /// 额外注册一个 agent（与 [[agents]] 一同生效）
    pub fn with_agent(mut self, agent: impl Agent + 'static) -> Self {
        self.registry.register(agent);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn AgentSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// 显式指定 Primary / Secondary 级别使用的客户端（None 表示不挂载该级别）
    pub fn with_llms(
        mut self,
        primary: Option<Arc<dyn LlmClient>>,
        secondary: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        self.llms = Some((primary, secondary));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_persistence(mut self, persistence: Option<ConversationPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn build_router(self) -> Result<SupervisorRouter, SupervisorError> {
        self.assemble().map(|(router, _, _)| router)
    }

    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let (router, metrics, persistence) = self.assemble()?;
        Ok(Supervisor::new(router, metrics).with_persistence(persistence))
    }

    fn assemble(
        self,
    ) -> Result<(SupervisorRouter, Arc<Metrics>, Option<ConversationPersistence>), SupervisorError>
    {
        let SupervisorBuilder {
            config,
            mut registry,
            selector,
            llms,
            metrics,
            persistence,
        } = self;
        config.validate()?;

        let (primary, secondary) = llms.unwrap_or_else(|| {
            (
                create_llm_client(&config.llm.primary, EndpointRole::Primary),
                create_llm_client(&config.llm.secondary, EndpointRole::Secondary),
            )
        });

        if !config.agents.is_empty() {
            let agent_llm: Arc<dyn LlmClient> = match primary.clone().or_else(|| secondary.clone()) {
                Some(llm) => llm,
                None => {
                    tracing::warn!("No LLM configured for agents, using Mock LLM");
                    Arc::new(MockLlmClient)
                }
            };
            for entry in &config.agents {
                if registry.contains(&entry.id) {
                    return Err(SupervisorError::Config(format!(
                        "duplicate agent id: {}",
                        entry.id
                    )));
                }
                registry.register(LlmAgent::from_entry(entry, agent_llm.clone()));
            }
        }
        tracing::info!(agents = ?registry.agent_ids(), "agent registry ready");

        let selector: Arc<dyn AgentSelector> = match (selector, &primary) {
            (Some(selector), _) => selector,
            (None, Some(llm)) if !registry.is_empty() => Arc::new(LlmAgentSelector::new(
                llm.clone(),
                registry.agent_descriptions(),
            )),
            (None, _) => Arc::new(KeywordAgentSelector::from_entries(&config.agents)),
        };

        let dispatcher = AgentDispatcher::new(Arc::new(registry), config.supervisor.agent_timeout())
            .with_metrics(metrics.clone());

        let mut chain = FallbackChain::new().with_metrics(metrics.clone());
        if let Some(llm) = primary {
            chain = chain.with_primary(
                Arc::new(LlmFallback::new(llm)),
                config.fallback.primary_timeout(),
            );
        }
        if let Some(llm) = secondary {
            chain = chain.with_secondary(
                Arc::new(LlmFallback::new(llm)),
                config.fallback.secondary_timeout(),
            );
        }
        chain = chain.with_rule_based(Arc::new(RuleBasedResponder::new()));
        tracing::info!(levels = ?chain.levels(), "fallback chain ready");

        let router = SupervisorRouter::from_config(
            &config,
            Arc::new(dispatcher),
            selector,
            Arc::new(chain),
        )
        .with_metrics(metrics.clone());

        Ok((router, metrics, persistence))
    }
}
