use std::{env, path::Path};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read model config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate model name: {0}")]
    DuplicateModel(String),
    #[error("model {model}: unknown provider type: {kind}")]
    UnknownBackendKind { model: String, kind: String },
    #[error("model {model}: unknown runtime kind: {kind}")]
    UnknownRuntimeKind { model: String, kind: String },
    #[error("model {model}: missing {section} section")]
    MissingSection { model: String, section: &'static str },
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelsFile {
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DefaultsSection {
    #[serde(default)]
    pub llm: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub llm: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    pub kind: String,
    pub bin: String,
    #[serde(default = "default_runtime_host")]
    pub host: String,
    #[serde(default = "default_runtime_port")]
    pub port: u16,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

fn default_runtime_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_runtime_port() -> u16 {
    8080
}

fn default_start_timeout_secs() -> u64 {
    180
}

impl ModelsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Expands `$VAR` and `${VAR}` references against the process environment.
/// Unknown variables are left verbatim.
pub fn expand_env_vars(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if ch != '$' {
            output.push(ch);
            continue;
        }

        let rest = &input[index + 1..];
        let (name, consumed) = match rest.strip_prefix('{') {
            Some(inner) => match inner.find('}') {
                Some(end) => (&inner[..end], end + 2),
                None => ("", 0),
            },
            None => {
                let end = rest
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(rest.len());
                (&rest[..end], end)
            }
        };

        if name.is_empty() {
            output.push('$');
            continue;
        }

        match env::var(name) {
            Ok(value) => output.push_str(&value),
            Err(_) => {
                output.push('$');
                output.push_str(&rest[..consumed]);
            }
        }

        let skip_to = index + 1 + consumed;
        while let Some((next_index, _)) = chars.peek() {
            if *next_index >= skip_to {
                break;
            }
            chars.next();
        }
    }

    output
}
