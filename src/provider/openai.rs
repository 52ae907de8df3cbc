use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    models::ChatRequest,
    provider::{Provider, ProviderError, TextStream},
};

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const ERROR_BODY_LIMIT: usize = 400;

/// Streaming client for an OpenAI-compatible chat-completions endpoint.
/// `defaults` is the already-merged registry+model parameter map; request
/// parameters override it key by key at call time.
pub struct OpenAiProvider {
    name: String,
    display_name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    defaults: Map<String, Value>,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        defaults: Map<String, Value>,
    ) -> Result<Self, reqwest::Error> {
        let timeout_secs = defaults
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_owned();
        let api_key = Some(api_key.into()).filter(|key| !key.is_empty());

        Ok(Self {
            name: name.into(),
            display_name: display_name.into(),
            client,
            base_url,
            api_key,
            model: model.into(),
            defaults,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let mut body = Map::new();
        for (key, value) in &self.defaults {
            // timeout configures the client, it is not a generation knob
            if key == "timeout" {
                continue;
            }
            body.insert(key.clone(), value.clone());
        }
        for (key, value) in &request.parameters {
            body.insert(key.clone(), value.clone());
        }

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        // reserved keys last so no parameter layer can unset streaming
        body.insert("model".to_owned(), Value::String(self.model.clone()));
        body.insert("messages".to_owned(), Value::Array(messages));
        body.insert("stream".to_owned(), Value::Bool(true));
        Value::Object(body)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<TextStream, ProviderError> {
        let payload = self.build_payload(&request);

        let mut call = self.client.post(self.url("/chat/completions")).json(&payload);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown upstream error".to_owned());
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let upstream = response
            .bytes_stream()
            .map(|next| next.map_err(|error| ProviderError::Transport(error.to_string())));

        debug!(provider = %self.name, "stream prepared");
        Ok(decode_event_stream(upstream).boxed())
    }
}

/// Decodes a newline-delimited `data:` event stream into text increments.
/// Lines that fail to parse are skipped so keep-alive and comment lines
/// cannot kill an otherwise healthy stream; `[DONE]` ends it.
fn decode_event_stream<S, B>(mut upstream: S) -> impl Stream<Item = Result<String, ProviderError>>
where
    S: Stream<Item = Result<B, ProviderError>> + Unpin,
    B: AsRef<[u8]>,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(next) = upstream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            buffer.extend_from_slice(bytes.as_ref());

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=index).collect();
                let Ok(text) = std::str::from_utf8(&line) else {
                    continue;
                };
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }

                let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
                if payload == "[DONE]" {
                    return;
                }

                let Ok(frame) = serde_json::from_str::<StreamFrame>(payload) else {
                    continue;
                };
                for choice in frame.choices {
                    if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                        yield Ok(content);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::stream;

    fn provider_with_defaults(defaults: Map<String, Value>) -> OpenAiProvider {
        OpenAiProvider::new(
            "test-model",
            "Test Model",
            "http://127.0.0.1:9/v1",
            "",
            "upstream-model",
            defaults,
        )
        .expect("build provider")
    }

    async fn collect(body: &[&str]) -> Vec<Result<String, ProviderError>> {
        let chunks: Vec<Result<Vec<u8>, ProviderError>> = body
            .iter()
            .map(|chunk| Ok(chunk.as_bytes().to_vec()))
            .collect();
        decode_event_stream(stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn yields_fragments_in_order_and_stops_at_done() {
        let items = collect(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        let fragments: Vec<_> = items
            .into_iter()
            .map(|item| item.expect("no decode errors"))
            .collect();
        assert_eq!(fragments, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_silently() {
        let items = collect(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"one\"}}]}\n",
            "data: {not json at all\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n",
            "data: [DONE]\n",
        ])
        .await;

        let fragments: Vec<_> = items
            .into_iter()
            .map(|item| item.expect("malformed line must not error"))
            .collect();
        assert_eq!(fragments, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn line_split_across_chunks_is_reassembled() {
        let items = collect(&[
            "data: {\"choices\":[{\"delta\"",
            ":{\"content\":\"joined\"}}]}\n",
            "data: [DONE]\n",
        ])
        .await;

        let fragments: Vec<_> = items
            .into_iter()
            .map(|item| item.expect("no decode errors"))
            .collect();
        assert_eq!(fragments, vec!["joined"]);
    }

    #[tokio::test]
    async fn unprefixed_lines_and_empty_deltas_are_handled() {
        let items = collect(&[
            "{\"choices\":[{\"delta\":{\"content\":\"bare\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{}}]}\n",
            "data: [DONE]\n",
        ])
        .await;

        let fragments: Vec<_> = items
            .into_iter()
            .map(|item| item.expect("no decode errors"))
            .collect();
        assert_eq!(fragments, vec!["bare"]);
    }

    #[test]
    fn request_parameters_override_defaults_key_by_key() {
        let mut defaults = Map::new();
        defaults.insert("temperature".to_owned(), json!(0.5));
        defaults.insert("top_p".to_owned(), json!(0.9));
        let provider = provider_with_defaults(defaults);

        let mut parameters = Map::new();
        parameters.insert("temperature".to_owned(), json!(0.2));
        let request = ChatRequest {
            prompt: "hi".to_owned(),
            system: None,
            parameters,
        };

        let payload = provider.build_payload(&request);
        assert_eq!(payload["temperature"], json!(0.2));
        assert_eq!(payload["top_p"], json!(0.9));
    }

    #[test]
    fn payload_is_always_streaming_with_messages_in_protocol_order() {
        let provider = provider_with_defaults(Map::new());

        let mut parameters = Map::new();
        parameters.insert("stream".to_owned(), json!(false));
        let request = ChatRequest {
            prompt: "question".to_owned(),
            system: Some("be brief".to_owned()),
            parameters,
        };

        let payload = provider.build_payload(&request);
        assert_eq!(payload["stream"], json!(true));
        assert_eq!(payload["model"], json!("upstream-model"));

        let messages = payload["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], json!("system"));
        assert_eq!(messages[0]["content"], json!("be brief"));
        assert_eq!(messages[1]["role"], json!("user"));
        assert_eq!(messages[1]["content"], json!("question"));
    }

    #[test]
    fn timeout_default_configures_client_not_payload() {
        let mut defaults = Map::new();
        defaults.insert("timeout".to_owned(), json!(30));
        let provider = provider_with_defaults(defaults);

        let request = ChatRequest {
            prompt: "hi".to_owned(),
            system: None,
            parameters: Map::new(),
        };

        let payload = provider.build_payload(&request);
        assert!(payload.get("timeout").is_none());
    }

    #[test]
    fn empty_api_key_is_treated_as_absent() {
        let provider = provider_with_defaults(Map::new());
        assert!(provider.api_key.is_none());

        let keyed = OpenAiProvider::new(
            "m",
            "M",
            "http://127.0.0.1:9/v1/",
            "sk-abc",
            "upstream",
            Map::new(),
        )
        .expect("build provider");
        assert_eq!(keyed.api_key.as_deref(), Some("sk-abc"));
        assert_eq!(keyed.url("/chat/completions"), "http://127.0.0.1:9/v1/chat/completions");
    }
}
