pub mod mock;
pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::ChatRequest;

pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

/// One configured backend. `stream_chat` yields decoded text increments in
/// upstream order; the stream is finite and not restartable.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    async fn start(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<TextStream, ProviderError>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("upstream transport failure: {0}")]
    Transport(String),
}
