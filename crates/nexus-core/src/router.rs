use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use nexus_provider::{
    CredentialPool, LlmMessage, LlmProvider, LlmRequest, LlmResponse, PoolStatus, ProviderError,
    ProviderRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::config::NexusConfig;

const RETRY_BACKOFF_MS: u64 = 1000;

fn default_pool() -> String {
    "primary".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

/// Which pool and model one agent talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTarget {
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ModelTarget {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            model: default_model(),
            temperature: None,
            max_tokens: default_max_tokens(),
        }
    }
}

impl ModelTarget {
    pub fn new(pool: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            model: model.into(),
            ..Self::default()
        }
    }
}

struct PoolBinding {
    provider: Arc<dyn LlmProvider>,
    pool: Arc<CredentialPool>,
}

/// Sends chat requests through a credential pool, rotating keys on
/// credential-attributable failures.
pub struct LlmRouter {
    pools: BTreeMap<String, PoolBinding>,
    backoff: Duration,
}

impl Default for LlmRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmRouter {
    pub fn new() -> Self {
        Self {
            pools: BTreeMap::new(),
            backoff: Duration::from_millis(RETRY_BACKOFF_MS),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_config(config: &NexusConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_configs(&config.providers)?;
        let mut router = Self::new();
        for pool in &config.pools {
            let provider = registry.get(&pool.provider)?;
            let credentials = CredentialPool::from_keys(&pool.id, &pool.keys, pool.options());
            router.register_pool(&pool.id, provider, Arc::new(credentials));
        }
        Ok(router)
    }

    pub fn register_pool(
        &mut self,
        id: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        pool: Arc<CredentialPool>,
    ) {
        self.pools.insert(id.into(), PoolBinding { provider, pool });
    }

    pub fn pool(&self, id: &str) -> Option<Arc<CredentialPool>> {
        self.pools.get(id).map(|b| Arc::clone(&b.pool))
    }

    pub async fn pool_statuses(&self) -> Vec<PoolStatus> {
        let mut out = Vec::with_capacity(self.pools.len());
        for binding in self.pools.values() {
            out.push(binding.pool.status().await);
        }
        out
    }

    /// At most one attempt per credential in the pool. Failures that say
    /// nothing about the credential (bad request, undecodable body) are
    /// returned without retrying. Errors keep their `ProviderError` so callers
    /// can downcast, e.g. to spot `CredentialExhausted`.
    pub async fn complete(
        &self,
        target: &ModelTarget,
        system: Option<String>,
        messages: Vec<LlmMessage>,
    ) -> Result<LlmResponse> {
        let binding = self
            .pools
            .get(&target.pool)
            .ok_or_else(|| anyhow!("unknown credential pool: {}", target.pool))?;
        let attempts = binding.pool.len().max(1);
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=attempts {
            let credential = binding.pool.acquire().await.map_err(ProviderError::from)?;
            let request = LlmRequest {
                model: target.model.clone(),
                system: system.clone(),
                messages: messages.clone(),
                max_tokens: target.max_tokens,
                temperature: target.temperature,
            };

            match binding.provider.chat(&credential, request).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    let Some(class) = err.failure_class() else {
                        tracing::warn!(
                            "provider {} failed without retry on pool {}: {err}",
                            binding.provider.name(),
                            target.pool
                        );
                        return Err(err.into());
                    };
                    binding.pool.report_failure(&credential, class).await;
                    tracing::warn!(
                        "provider {} failed (class={}, attempt {attempt}/{attempts}) on pool {}: {err}",
                        binding.provider.name(),
                        class.as_str(),
                        target.pool
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(err) => err.into(),
            None => anyhow!("no attempts made on pool {}", target.pool),
        })
    }

    /// Single-turn convenience wrapper returning trimmed text.
    pub async fn complete_text(
        &self,
        target: &ModelTarget,
        system: Option<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let resp = self
            .complete(target, system, vec![LlmMessage::user(user)])
            .await?;
        Ok(resp.text.trim().to_string())
    }
}
