//! OpenAI-compatible chat completions (Groq, OpenAI, self-hosted gateways).
//!
//! These endpoints share one wire format and differ only in base URL.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{Credential, LlmProvider, LlmRequest, LlmResponse, ProviderError};

#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn build_request(request: &LlmRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| ChatMessage {
            role: match m.role.as_str() {
                "model" => "assistant".to_string(),
                other => other.to_string(),
            },
            content: m.content.clone(),
        }));

        ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
        }
    }
}

/// Groq API
/// https://console.groq.com/docs/api
pub fn groq() -> OpenAiCompatProvider {
    OpenAiCompatProvider::new("groq", "https://api.groq.com/openai/v1")
}

pub fn openai() -> OpenAiCompatProvider {
    OpenAiCompatProvider::new("openai", "https://api.openai.com/v1")
}

/// Custom OpenAI-compatible endpoint
pub fn custom(name: impl Into<String>, base_url: impl Into<String>) -> OpenAiCompatProvider {
    OpenAiCompatProvider::new(name, base_url)
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        credential: &Credential,
        request: LlmRequest,
    ) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = Self::build_request(&request);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(credential.expose())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&self.name, status.as_u16(), &text));
        }

        let body: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;
        let choice = body.choices.into_iter().next().ok_or_else(|| ProviderError::Decode {
            provider: self.name.clone(),
            message: "empty choices".to_string(),
        })?;

        Ok(LlmResponse {
            text: choice.message.content.unwrap_or_default(),
            input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
            stop_reason: choice.finish_reason,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureClass, LlmMessage};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn system_prompt_leads_and_model_role_is_renamed() {
        let req = LlmRequest {
            model: "llama".into(),
            system: Some("terse".into()),
            messages: vec![LlmMessage::user("a"), LlmMessage::assistant("b")],
            max_tokens: 64,
            temperature: None,
        };
        let body = OpenAiCompatProvider::build_request(&req);
        assert_eq!(body.messages.len(), 3);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[2].role, "assistant");
    }

    #[test]
    fn presets_trim_trailing_slash() {
        let provider = custom("gw", "http://localhost:8080/v1/");
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
        assert_eq!(groq().name(), "groq");
    }

    #[tokio::test]
    async fn chat_parses_choices_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer gsk-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = custom("groq", server.uri());
        let resp = provider
            .chat(&Credential::new("gsk-1"), LlmRequest::simple("llama", None, "hey"))
            .await
            .unwrap();
        assert_eq!(resp.text, "hi");
        assert_eq!(resp.output_tokens, Some(1));
        assert_eq!(resp.stop_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn chat_maps_status_codes_to_failure_classes() {
        for (status, body, expected) in [
            (429, "rate limit reached", Some(FailureClass::RateLimit)),
            (401, "invalid api key", Some(FailureClass::InvalidKey)),
            (502, "bad gateway", Some(FailureClass::ServerError)),
            (400, "bad request", None),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string(body))
                .mount(&server)
                .await;
            let provider = custom("groq", server.uri());
            let err = provider
                .chat(&Credential::new("k"), LlmRequest::simple("m", None, "x"))
                .await
                .unwrap_err();
            assert_eq!(err.failure_class(), expected, "status {status}");
        }
    }
}
