use std::collections::HashSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

/// Second-stage pairwise scorer: one relevance score per passage, same order.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>>;
    fn name(&self) -> &str;
}

/// Cross-encoder served over HTTP (`POST {base}/rerank`, Cohere/Jina-style body).
#[derive(Clone)]
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f64,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let mut req = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .json(&RerankRequest {
                model: &self.model,
                query,
                documents: passages,
            });
        if let Some(key) = &self.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let parsed: RerankResponse = req.send().await?.error_for_status()?.json().await?;
        let mut scores = vec![f64::NEG_INFINITY; passages.len()];
        for result in parsed.results {
            let slot = scores
                .get_mut(result.index)
                .ok_or_else(|| anyhow!("reranker returned out-of-range index {}", result.index))?;
            *slot = result.relevance_score;
        }
        Ok(scores)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Token-overlap scorer used when no cross-encoder is configured.
#[derive(Debug, Clone, Default)]
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        Ok(passages
            .iter()
            .map(|p| jaccard_similarity(query, p))
            .collect())
    }

    fn name(&self) -> &str {
        "lexical"
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity between the lowercase word sets of two texts
fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let tokens_a = tokens(a);
    let tokens_b = tokens(b);

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count() as f64;
    let union = tokens_a.union(&tokens_b).count() as f64;

    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn lexical_prefers_overlapping_passages() {
        let scores = LexicalReranker
            .score(
                "Rust ownership rules",
                &["Ownership rules in Rust".to_string(), "Cooking pasta".to_string()],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[tokio::test]
    async fn http_reranker_maps_scores_back_to_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"index": 1, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.2}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reranker = HttpReranker::new(server.uri(), "bge-reranker");
        let scores = reranker
            .score("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);
    }

    #[tokio::test]
    async fn http_reranker_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let reranker = HttpReranker::new(server.uri(), "m");
        assert!(reranker.score("q", &["a".to_string()]).await.is_err());
    }
}
