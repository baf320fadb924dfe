pub mod credentials;
pub mod error;
pub mod gemini;
pub mod openai_compat;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use credentials::{
    CooldownPolicy, Credential, CredentialExhausted, CredentialPool, PoolOptions, PoolStatus,
    RotationMode,
};
pub use error::{FailureClass, ProviderError};
pub use gemini::GeminiProvider;
pub use openai_compat::{custom, groq, openai, OpenAiCompatProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn simple(model: impl Into<String>, system: Option<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system,
            messages: vec![LlmMessage::user(user)],
            max_tokens: 2048,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("end_turn".into()),
        }
    }
}

/// A chat backend. The credential is supplied per call so one provider can
/// serve a whole rotating pool.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        credential: &Credential,
        request: LlmRequest,
    ) -> std::result::Result<LlmResponse, ProviderError>;
}

/// Provider type identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Gemini,
    Groq,
    OpenAI,
    /// Custom OpenAI-compatible endpoint
    Custom,
    /// Offline echo backend
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider_type: ProviderType) -> Self {
        Self {
            id: id.into(),
            provider_type,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::Gemini => Arc::new(GeminiProvider::new(
            config.base_url.as_deref().unwrap_or(gemini::GEMINI_API_BASE),
        )),
        ProviderType::Groq => match &config.base_url {
            Some(url) => Arc::new(custom("groq", url.clone())),
            None => Arc::new(groq()),
        },
        ProviderType::OpenAI => match &config.base_url {
            Some(url) => Arc::new(custom("openai", url.clone())),
            None => Arc::new(openai()),
        },
        ProviderType::Custom => {
            let base_url = config
                .base_url
                .as_ref()
                .ok_or_else(|| anyhow!("custom provider {} requires base_url", config.id))?;
            Arc::new(custom(config.id.clone(), base_url.clone()))
        }
        ProviderType::Stub => Arc::new(StubProvider),
    };
    Ok(provider)
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let provider = create_provider(config)?;
            registry.register(&config.id, provider);
            tracing::info!("Registered provider: {} ({:?})", config.id, config.provider_type);
        }
        Ok(registry)
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

/// Echoes the last user message back; useful offline and in tests.
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn chat(
        &self,
        _credential: &Credential,
        request: LlmRequest,
    ) -> std::result::Result<LlmResponse, ProviderError> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(LlmResponse::text(format!("[stub:{}] {}", request.model, user_text)))
    }
}
