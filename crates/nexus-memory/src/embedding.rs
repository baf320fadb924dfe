use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Turns a search query into a vector comparable with the vectors stored in a
/// retrieval index. Index vectors are built offline, so only the query side
/// lives here.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
}

fn expect_dimensions(model: &str, expected: usize, vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.is_empty() {
        bail!("{model} returned an empty query embedding");
    }
    if vector.len() != expected {
        bail!(
            "{model} returned a {}-dim query embedding, configured for {expected}",
            vector.len()
        );
    }
    Ok(vector)
}

/// OpenAI-style `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl OpenAiEmbeddingProvider {
    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimensions,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[derive(Serialize)]
struct OpenAiQueryRequest<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct OpenAiQueryResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let parsed: OpenAiQueryResponse = self
            .client
            .post(endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&OpenAiQueryRequest {
                model: &self.model,
                input: query,
                encoding_format: "float",
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("{} returned no embedding data", self.model))?;
        expect_dimensions(&self.model, self.dimensions, vector)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Gemini `embedContent`, asking for the retrieval-query task type so query
/// vectors land in the same space as documents embedded for retrieval.
#[derive(Clone)]
pub struct GeminiEmbeddingProvider {
    client: reqwest::Client,
    model: String,
    dimensions: usize,
    api_key: String,
    base_url: String,
}

const GEMINI_QUERY_TASK: &str = "RETRIEVAL_QUERY";

impl GeminiEmbeddingProvider {
    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            dimensions,
            api_key,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiQueryRequest<'a> {
    model: String,
    content: GeminiContent<'a>,
    task_type: &'static str,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: [GeminiPart<'a>; 1],
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GeminiQueryResponse {
    embedding: GeminiValues,
}

#[derive(Deserialize)]
struct GeminiValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let endpoint = format!(
            "{}/v1beta/models/{}:embedContent",
            self.base_url.trim_end_matches('/'),
            self.model,
        );
        let parsed: GeminiQueryResponse = self
            .client
            .post(&endpoint)
            .header("x-goog-api-key", &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&GeminiQueryRequest {
                model: format!("models/{}", self.model),
                content: GeminiContent {
                    parts: [GeminiPart { text: query }],
                },
                task_type: GEMINI_QUERY_TASK,
                output_dimensionality: self.dimensions,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        expect_dimensions(&self.model, self.dimensions, parsed.embedding.values)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Hashes the query into a fixed vector. Offline runs and tests only; the
/// vectors carry no meaning.
#[derive(Clone)]
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }

    /// The vector `embed_query` produces for `text`; lets fixtures place
    /// records exactly where a given query will land.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        (0..self.dims)
            .map(|index| Self::hash_to_unit_range(text, index))
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(query))
    }

    fn model_id(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
