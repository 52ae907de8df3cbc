use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Openai,
    Mock,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults_optional_fields() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"prompt":"hello"}"#).expect("minimal body should parse");

        assert_eq!(request.prompt, "hello");
        assert!(request.system.is_none());
        assert!(request.parameters.is_empty());
    }

    #[test]
    fn backend_kind_serializes_as_tag() {
        assert_eq!(
            serde_json::to_string(&BackendKind::Openai).expect("serialize"),
            r#""openai""#
        );
    }
}
