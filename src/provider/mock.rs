use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    models::ChatRequest,
    provider::{Provider, ProviderError, TextStream},
};

/// Deterministic backend that echoes the prompt word by word. Used for
/// integration tests and for running the gateway without a real model.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    display_name: String,
    token_delay: Duration,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            token_delay: Duration::from_millis(5),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<TextStream, ProviderError> {
        let content = format!("{} reply: {}", self.display_name, request.prompt);
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for token in split_for_stream(&content) {
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
                sleep(delay).await;
            }
        });

        debug!(provider = %self.name, "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::TryStreamExt;
    use serde_json::Map;

    #[tokio::test]
    async fn streams_the_prompt_back_in_order() {
        let provider = MockProvider::new("mock-a", "Mock A");
        let request = ChatRequest {
            prompt: "one two three".to_owned(),
            system: None,
            parameters: Map::new(),
        };

        let stream = provider.stream_chat(request).await.expect("stream");
        let fragments: Vec<String> = stream.try_collect().await.expect("no errors");

        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), "Mock A reply: one two three");
    }
}
