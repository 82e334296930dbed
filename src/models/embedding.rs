use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;

const KNOWN_MODELS: [(&str, usize); 3] = [
    ("minilm-l12-v2", 384),
    ("multilingual-e5-small", 384),
    ("labse", 768),
];

/// Output dimension of a well-known embedding model id.
#[must_use]
pub fn known_model_dim(model_id: &str) -> Option<usize> {
    let id = model_id.trim().to_ascii_lowercase();
    KNOWN_MODELS
        .iter()
        .find(|(name, _)| id == *name || id.ends_with(&format!("/{name}")))
        .map(|(_, dim)| *dim)
}

/// Produces one vector per input text.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Dimension this model is expected to produce, if known up front.
    fn expected_dim(&self) -> Option<usize> {
        known_model_dim(self.model_id())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dim: Option<usize>,
}

impl HttpEmbeddingModel {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: String::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dim: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn expected_dim(&self) -> Option<usize> {
        self.dim.or_else(|| known_model_dim(&self.model))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "input": texts }));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let mut parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(ApiError::Response(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn known_dims() {
        assert_eq!(known_model_dim("labse"), Some(768));
        assert_eq!(known_model_dim("intfloat/multilingual-e5-small"), Some(384));
        assert_eq!(known_model_dim("unknown"), None);
        let m = HttpEmbeddingModel::new("http://x", "custom").with_dim(16);
        assert_eq!(m.expected_dim(), Some(16));
    }

    #[tokio::test]
    async fn embed_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0] },
                    { "index": 0, "embedding": [1.0, 0.0] }
                ]
            })))
            .mount(&server)
            .await;

        let model = HttpEmbeddingModel::new(server.uri(), "tiny");
        let out = model
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn embed_rejects_short_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let model = HttpEmbeddingModel::new(server.uri(), "tiny");
        let err = model.embed(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, ApiError::Response(_)));
    }
}
