use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{CompletionApi, CompletionRequest, TextStream};
use crate::error::ApiError;

#[derive(Debug, Deserialize, Default)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatContent>,
    #[serde(default)]
    delta: Option<ChatContent>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(&self, req: &CompletionRequest, stream: bool) -> Result<reqwest::Response, ApiError> {
        let body = build_chat_body(&self.model, req, stream);
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if let Some(t) = req.timeout {
            builder = builder.timeout(t);
        }
        debug!(model = %self.model, stream, "chat completion request");

        let response = builder.send().await.map_err(|e| match req.timeout {
            Some(t) if e.is_timeout() => ApiError::Timeout(t),
            _ => ApiError::Http(e),
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(response)
    }
}

pub fn build_chat_body(model: &str, req: &CompletionRequest, stream: bool) -> serde_json::Value {
    let mut body = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": req.system_prompt },
            { "role": "user", "content": req.user_text },
        ],
        "stream": stream,
    });
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn parse_sse_data(data: &str) -> Result<Option<String>, ApiError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let parsed: ChatResponse = serde_json::from_str(data)?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.or(c.message))
        .and_then(|c| c.content)
        .filter(|s| !s.is_empty());
    Ok(text)
}

#[async_trait]
impl CompletionApi for OpenAiCompatClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ApiError> {
        let response = self.post(req, false).await?;
        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ApiError::Response("no choices[0].message.content".to_string()))
    }

    async fn complete_stream(&self, req: &CompletionRequest) -> Result<TextStream, ApiError> {
        let response = self.post(req, true).await?;
        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|event| {
                let event = event.map_err(|e| ApiError::Stream(e.to_string()))?;
                parse_sse_data(&event.data)
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(text)) => Some(Ok(text)),
                    Ok(None) => None,
                    Err(err) => Some(Err(err)),
                }
            });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            system_prompt: "sys".into(),
            user_text: text.into(),
            temperature: Some(0.2),
            timeout: None,
        }
    }

    #[test]
    fn body_carries_messages_and_temperature() {
        let body = build_chat_body("m", &request("hi"), true);
        assert_eq!(body["model"], "m");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);

        let mut req = request("x");
        req.temperature = None;
        assert!(build_chat_body("m", &req, false).get("temperature").is_none());
    }

    #[test]
    fn sse_data_parsing() {
        assert_eq!(parse_sse_data("[DONE]").unwrap(), None);
        assert_eq!(
            parse_sse_data(r#"{"choices":[{"delta":{"content":"Hal"}}]}"#).unwrap(),
            Some("Hal".to_string())
        );
        assert_eq!(parse_sse_data(r#"{"choices":[{"delta":{}}]}"#).unwrap(), None);
        assert!(parse_sse_data("not json").is_err());
    }

    #[test]
    fn builder_trims_base_url() {
        let c = OpenAiCompatClient::new("k")
            .with_base_url("http://localhost:8080/v1/")
            .with_model("qwen");
        assert_eq!(c.base_url, "http://localhost:8080/v1");
        assert_eq!(c.model(), "qwen");
    }

    #[tokio::test]
    async fn complete_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "m", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Bonjour" } }]
            })))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("sk-test")
            .with_base_url(server.uri())
            .with_model("m");
        let out = client.complete(&request("Hello")).await.unwrap();
        assert_eq!(out, "Bonjour");
    }

    #[tokio::test]
    async fn complete_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("k").with_base_url(server.uri());
        match client.complete(&request("Hello")).await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_stream_yields_deltas() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Bon\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"jour\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("k").with_base_url(server.uri());
        let mut stream = client.complete_stream(&request("Hello")).await.unwrap();
        let mut parts = Vec::new();
        while let Some(item) = stream.next().await {
            parts.push(item.unwrap());
        }
        assert_eq!(parts, vec!["Bon", "jour"]);
    }
}
