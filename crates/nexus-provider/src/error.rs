use serde::{Deserialize, Serialize};

use crate::credentials::CredentialExhausted;

/// Failure classes that map onto credential cooldown durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Quota,
    InvalidKey,
    ServerError,
    RateLimit,
    Generic,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::InvalidKey => "invalid_key",
            Self::ServerError => "server_error",
            Self::RateLimit => "rate_limit",
            Self::Generic => "generic",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rate limited: {message}")]
    RateLimited { provider: String, message: String },
    #[error("{provider} quota exhausted: {message}")]
    QuotaExhausted { provider: String, message: String },
    #[error("{provider} rejected credential: {message}")]
    InvalidCredential { provider: String, message: String },
    #[error("{provider} server error ({status}): {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} request timed out")]
    Timeout { provider: String },
    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} api error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} returned an unreadable response: {message}")]
    Decode { provider: String, message: String },
    #[error(transparent)]
    Exhausted(#[from] CredentialExhausted),
}

impl ProviderError {
    /// The cooldown class to charge against the credential that produced this error.
    /// `None` means the failure is not attributable to the credential.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::RateLimited { .. } => Some(FailureClass::RateLimit),
            Self::QuotaExhausted { .. } => Some(FailureClass::Quota),
            Self::InvalidCredential { .. } => Some(FailureClass::InvalidKey),
            Self::Server { .. } => Some(FailureClass::ServerError),
            Self::Timeout { .. } | Self::Transport { .. } => Some(FailureClass::Generic),
            Self::Api { .. } | Self::Decode { .. } | Self::Exhausted(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_class().is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    /// Classify a non-success HTTP response by status and body text.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let provider = provider.to_string();
        let message = truncate_body(body);
        let lower = body.to_lowercase();

        let per_window = lower.contains("per minute") || lower.contains("per_minute");
        let billing = lower.contains("quota")
            || lower.contains("billing")
            || lower.contains("insufficient")
            || lower.contains("credits");
        let bad_key = lower.contains("api key not valid")
            || lower.contains("invalid api key")
            || lower.contains("invalid_api_key")
            || lower.contains("api_key_invalid");

        if status == 401 || status == 403 || bad_key {
            return Self::InvalidCredential { provider, message };
        }
        if status == 429 || lower.contains("rate limit") || lower.contains("resource_exhausted") {
            if billing && !per_window {
                return Self::QuotaExhausted { provider, message };
            }
            return Self::RateLimited { provider, message };
        }
        if billing && status == 402 {
            return Self::QuotaExhausted { provider, message };
        }
        if (500..=599).contains(&status) {
            return Self::Server {
                provider,
                status,
                message,
            };
        }
        Self::Api {
            provider,
            status,
            message,
        }
    }

    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                provider: provider.to_string(),
            };
        }
        if err.is_decode() {
            return Self::Decode {
                provider: provider.to_string(),
                message: err.to_string(),
            };
        }
        Self::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        return body.to_string();
    }
    let mut out: String = body.chars().take(MAX).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit() {
        let err = ProviderError::from_status("groq", 429, "Rate limit reached for requests");
        assert_eq!(err.failure_class(), Some(FailureClass::RateLimit));
    }

    #[test]
    fn classifies_daily_quota() {
        let err = ProviderError::from_status(
            "gemini",
            429,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"You exceeded your current quota"}}"#,
        );
        assert_eq!(err.failure_class(), Some(FailureClass::Quota));
    }

    #[test]
    fn per_minute_quota_is_only_a_rate_limit() {
        let err = ProviderError::from_status(
            "gemini",
            429,
            "Quota exceeded for metric generate_content_requests per minute",
        );
        assert_eq!(err.failure_class(), Some(FailureClass::RateLimit));
    }

    #[test]
    fn classifies_invalid_key_from_body() {
        let err = ProviderError::from_status("gemini", 400, "API key not valid. Please pass a valid API key.");
        assert_eq!(err.failure_class(), Some(FailureClass::InvalidKey));
    }

    #[test]
    fn classifies_server_error() {
        let err = ProviderError::from_status("groq", 503, "service unavailable");
        assert_eq!(err.failure_class(), Some(FailureClass::ServerError));
        assert!(err.is_retryable());
    }

    #[test]
    fn plain_bad_request_is_not_retryable() {
        let err = ProviderError::from_status("groq", 400, "messages must not be empty");
        assert_eq!(err.failure_class(), None);
        assert!(!err.is_retryable());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let err = ProviderError::from_status("groq", 400, &body);
        assert!(err.to_string().len() < 400);
    }
}
