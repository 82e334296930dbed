mod embedding;
mod remote;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ApiError;

pub use embedding::{known_model_dim, EmbeddingModel, HttpEmbeddingModel};
pub use remote::{build_chat_body, OpenAiCompatClient};

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_text: String,
    pub temperature: Option<f32>,
    pub timeout: Option<Duration>,
}

/// Remote text completion endpoint.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ApiError>;

    /// Streams the completion as text increments. Implementations without native streaming get a
    /// single-item stream of the full response.
    async fn complete_stream(&self, req: &CompletionRequest) -> Result<TextStream, ApiError> {
        let text = self.complete(req).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}
