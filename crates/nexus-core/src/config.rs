use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use nexus_memory::{
    EmbeddingProvider, GeminiEmbeddingProvider, HttpReranker, LexicalReranker,
    OpenAiEmbeddingProvider, Reranker, RetrievalSettings, StubEmbeddingProvider,
};
use nexus_provider::{CooldownPolicy, PoolOptions, ProviderConfig, RotationMode};
use serde::{Deserialize, Serialize};

use crate::pending::{default_confirm_markers, default_deny_markers, DEFAULT_PENDING_TIMEOUT_SECS};
use crate::router::ModelTarget;

pub const MAIN_CONFIG_FILE: &str = "config/main.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "nexus".to_string(),
            env: "dev".to_string(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_db_path() -> String {
    "data/conversation.db".to_string()
}

fn default_history_window() -> usize {
    15
}

fn default_context_turns() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Turns returned to clients after each answer.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Turns handed to the classifier and contextual handlers.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_window: default_history_window(),
            context_turns: default_context_turns(),
        }
    }
}

fn default_pending_timeout() -> u64 {
    DEFAULT_PENDING_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfig {
    #[serde(default = "default_pending_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_confirm_markers")]
    pub confirm: Vec<String>,
    #[serde(default = "default_deny_markers")]
    pub deny: Vec<String>,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pending_timeout(),
            confirm: default_confirm_markers(),
            deny: default_deny_markers(),
        }
    }
}

fn default_grace_ms() -> u64 {
    2000
}

/// Cooldown table in seconds, one entry per failure class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub quota_secs: u64,
    pub invalid_key_secs: u64,
    pub server_error_secs: u64,
    pub rate_limit_secs: u64,
    pub generic_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        let policy = CooldownPolicy::default();
        Self {
            quota_secs: policy.quota.as_secs(),
            invalid_key_secs: policy.invalid_key.as_secs(),
            server_error_secs: policy.server_error.as_secs(),
            rate_limit_secs: policy.rate_limit.as_secs(),
            generic_secs: policy.generic.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    /// Id of an entry in `providers`.
    pub provider: String,
    /// Each entry may itself be a comma-separated list.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    #[serde(default)]
    pub rotation: RotationMode,
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            grace: Duration::from_millis(self.grace_ms),
            cooldowns: CooldownPolicy {
                quota: Duration::from_secs(self.cooldowns.quota_secs),
                invalid_key: Duration::from_secs(self.cooldowns.invalid_key_secs),
                server_error: Duration::from_secs(self.cooldowns.server_error_secs),
                rate_limit: Duration::from_secs(self.cooldowns.rate_limit_secs),
                generic: Duration::from_secs(self.cooldowns.generic_secs),
            },
            rotation: self.rotation,
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys
            .iter()
            .flat_map(|k| k.split(','))
            .filter(|k| !k.trim().is_empty())
            .count()
    }
}

/// Per-agent overrides on top of `agents.default`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Replaces the built-in system prompt.
    #[serde(default)]
    pub persona: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub default: ModelTarget,
    #[serde(flatten)]
    pub overrides: BTreeMap<String, AgentConfig>,
}

impl AgentsConfig {
    pub fn target_for(&self, agent: &str) -> ModelTarget {
        let mut target = self.default.clone();
        if let Some(cfg) = self.overrides.get(agent) {
            if let Some(pool) = &cfg.pool {
                target.pool = pool.clone();
            }
            if let Some(model) = &cfg.model {
                target.model = model.clone();
            }
            if cfg.temperature.is_some() {
                target.temperature = cfg.temperature;
            }
            if let Some(max_tokens) = cfg.max_tokens {
                target.max_tokens = max_tokens;
            }
        }
        target
    }

    pub fn persona_for(&self, agent: &str) -> Option<&str> {
        self.overrides
            .get(agent)
            .and_then(|cfg| cfg.persona.as_deref())
            .filter(|p| !p.trim().is_empty())
    }
}

fn default_embedding_provider() -> String {
    "stub".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    384
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: String::new(),
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            base_url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn build(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider: Arc<dyn EmbeddingProvider> = match self.provider.as_str() {
            "stub" => Arc::new(StubEmbeddingProvider::new(self.dimensions)),
            "openai" => {
                let mut p = OpenAiEmbeddingProvider::with_model(
                    self.api_key.clone(),
                    self.model.clone(),
                    self.dimensions,
                );
                if let Some(url) = &self.base_url {
                    p = p.with_base_url(url.clone());
                }
                Arc::new(p)
            }
            "gemini" => {
                let mut p = GeminiEmbeddingProvider::with_model(
                    self.api_key.clone(),
                    self.model.clone(),
                    self.dimensions,
                );
                if let Some(url) = &self.base_url {
                    p = p.with_base_url(url.clone());
                }
                Arc::new(p)
            }
            other => return Err(anyhow!("unknown embedding provider: {other}")),
        };
        Ok(provider)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerKind {
    #[default]
    Lexical,
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankerConfig {
    #[serde(default)]
    pub kind: RerankerKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl RerankerConfig {
    pub fn build(&self) -> Result<Arc<dyn Reranker>> {
        match self.kind {
            RerankerKind::Lexical => Ok(Arc::new(LexicalReranker)),
            RerankerKind::Http => {
                let base_url = self
                    .base_url
                    .clone()
                    .ok_or_else(|| anyhow!("http reranker requires base_url"))?;
                let model = self.model.clone().unwrap_or_else(|| "rerank".to_string());
                Ok(Arc::new(
                    HttpReranker::new(base_url, model).with_api_key(self.api_key.clone()),
                ))
            }
        }
    }
}

fn default_index_root() -> String {
    "data/indexes".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_index_root")]
    pub index_root: String,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(flatten)]
    pub settings: RetrievalSettings,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_root: default_index_root(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankerConfig::default(),
            settings: RetrievalSettings::default(),
        }
    }
}

/// A date the reporter mentions when asked about today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportantDay {
    pub month: u32,
    pub day: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NexusConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub important_days: Vec<ImportantDay>,
}

impl NexusConfig {
    /// Relative paths in the config are resolved against the config root.
    pub fn resolve_path(root: &Path, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            root.join(path)
        }
    }
}

pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

pub fn load_config(root: &Path) -> Result<NexusConfig> {
    let mut config: NexusConfig = read_yaml_file(&root.join(MAIN_CONFIG_FILE))?;
    resolve_config_env(&mut config);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &NexusConfig) -> Result<()> {
    let providers: HashSet<&str> = config.providers.iter().map(|p| p.id.as_str()).collect();

    let mut pools = HashSet::new();
    for pool in &config.pools {
        if !pools.insert(pool.id.as_str()) {
            return Err(anyhow!("duplicate pool id: {}", pool.id));
        }
        if !providers.contains(pool.provider.as_str()) {
            return Err(anyhow!(
                "pool {} references unknown provider: {}",
                pool.id,
                pool.provider
            ));
        }
        if pool.key_count() == 0 {
            return Err(anyhow!("pool {} has no credentials", pool.id));
        }
    }

    if !pools.contains(config.agents.default.pool.as_str()) {
        return Err(anyhow!(
            "default agent references unknown pool: {}",
            config.agents.default.pool
        ));
    }
    for (agent, cfg) in &config.agents.overrides {
        if let Some(pool) = &cfg.pool {
            if !pools.contains(pool.as_str()) {
                return Err(anyhow!("agent {agent} references unknown pool: {pool}"));
            }
        }
    }

    Ok(())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}

fn resolve_config_env(config: &mut NexusConfig) {
    config.app.name = resolve_env_var(&config.app.name);
    config.app.env = resolve_env_var(&config.app.env);
    config.server.bind = resolve_env_var(&config.server.bind);
    config.memory.db_path = resolve_env_var(&config.memory.db_path);

    for provider in &mut config.providers {
        if let Some(url) = &mut provider.base_url {
            *url = resolve_env_var(url);
        }
    }

    for pool in &mut config.pools {
        for key in &mut pool.keys {
            *key = resolve_env_var(key);
        }
    }

    let retrieval = &mut config.retrieval;
    retrieval.index_root = resolve_env_var(&retrieval.index_root);
    retrieval.embedding.api_key = resolve_env_var(&retrieval.embedding.api_key);
    if let Some(url) = &mut retrieval.embedding.base_url {
        *url = resolve_env_var(url);
    }
    if let Some(url) = &mut retrieval.reranker.base_url {
        *url = resolve_env_var(url);
    }
    if let Some(key) = &mut retrieval.reranker.api_key {
        *key = resolve_env_var(key);
    }
}
