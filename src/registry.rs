use std::{path::Path, sync::Arc, time::Duration};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::{expand_env_vars, ConfigError, ModelsFile},
    models::BackendKind,
    provider::{mock::MockProvider, openai::OpenAiProvider, Provider, ProviderError},
    runtime::{LlamaServer, RuntimeError},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("runtime for model {model} failed to start: {source}")]
    Runtime {
        model: String,
        #[source]
        source: RuntimeError,
    },
    #[error("provider for model {model} failed to start: {source}")]
    Provider {
        model: String,
        #[source]
        source: ProviderError,
    },
}

pub struct ModelEntry {
    pub name: String,
    pub display_name: String,
    pub kind: BackendKind,
    provider: Arc<dyn Provider>,
    runtime: Option<LlamaServer>,
    start_timeout: Duration,
}

/// The catalog of configured models. Built once from the declarative file,
/// read-only afterwards; entry order is load order and the first entry is
/// the default model.
pub struct Registry {
    entries: Vec<ModelEntry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field(
                "models",
                &self.entries.iter().map(|entry| &entry.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Registry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_config(ModelsFile::load(path)?)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Self::from_config(ModelsFile::from_yaml(raw)?)
    }

    pub fn from_config(file: ModelsFile) -> Result<Self, ConfigError> {
        let mut entries: Vec<ModelEntry> = Vec::with_capacity(file.models.len());

        for model in &file.models {
            if entries.iter().any(|entry| entry.name == model.name) {
                return Err(ConfigError::DuplicateModel(model.name.clone()));
            }
            let display_name = model
                .display_name
                .clone()
                .unwrap_or_else(|| model.name.clone());

            let runtime = match &model.runtime {
                Some(runtime) if runtime.kind == "llama_cpp_server" => Some(
                    LlamaServer::new(runtime, Path::new("logs").join(format!("{}.log", model.name)))
                        .map_err(|error| ConfigError::HttpClient(error.to_string()))?,
                ),
                Some(runtime) => {
                    return Err(ConfigError::UnknownRuntimeKind {
                        model: model.name.clone(),
                        kind: runtime.kind.clone(),
                    })
                }
                None => None,
            };

            let (kind, provider): (BackendKind, Arc<dyn Provider>) = match model.kind.as_str() {
                "openai" => {
                    let openai =
                        model
                            .openai
                            .as_ref()
                            .ok_or_else(|| ConfigError::MissingSection {
                                model: model.name.clone(),
                                section: "openai",
                            })?;
                    let provider = OpenAiProvider::new(
                        model.name.clone(),
                        display_name.clone(),
                        expand_env_vars(&openai.base_url),
                        expand_env_vars(&openai.api_key),
                        openai.model.clone(),
                        merged_model_defaults(&file.defaults.llm, &model.llm),
                    )
                    .map_err(|error| ConfigError::HttpClient(error.to_string()))?;
                    (BackendKind::Openai, Arc::new(provider))
                }
                "mock" => (
                    BackendKind::Mock,
                    Arc::new(MockProvider::new(model.name.clone(), display_name.clone())),
                ),
                other => {
                    return Err(ConfigError::UnknownBackendKind {
                        model: model.name.clone(),
                        kind: other.to_owned(),
                    })
                }
            };

            entries.push(ModelEntry {
                name: model.name.clone(),
                display_name,
                kind,
                provider,
                runtime,
                start_timeout: Duration::from_secs(
                    model
                        .runtime
                        .as_ref()
                        .map(|runtime| runtime.start_timeout_secs)
                        .unwrap_or(0),
                ),
            });
        }

        Ok(Self { entries })
    }

    /// All runtimes come up first, in entry order, before any provider hook
    /// runs. A runtime that never becomes ready aborts the whole startup.
    pub async fn startup(&self) -> Result<(), RegistryError> {
        for entry in &self.entries {
            if let Some(runtime) = &entry.runtime {
                info!(model = %entry.name, "starting local runtime");
                runtime
                    .start(entry.start_timeout)
                    .await
                    .map_err(|source| RegistryError::Runtime {
                        model: entry.name.clone(),
                        source,
                    })?;
            }
        }

        for entry in &self.entries {
            entry
                .provider
                .start()
                .await
                .map_err(|source| RegistryError::Provider {
                    model: entry.name.clone(),
                    source,
                })?;
        }

        Ok(())
    }

    /// Inverse of startup, best-effort on every entry.
    pub async fn shutdown(&self) {
        for entry in &self.entries {
            if let Err(error) = entry.provider.stop().await {
                warn!(model = %entry.name, %error, "provider shutdown failed");
            }
        }

        for entry in &self.entries {
            if let Some(runtime) = &entry.runtime {
                runtime.stop().await;
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.provider.clone())
            .ok_or_else(|| RegistryError::ModelNotFound(name.to_owned()))
    }

    pub fn default_model(&self) -> Option<&str> {
        self.entries.first().map(|entry| entry.name.as_str())
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }
}

fn merged_model_defaults(
    globals: &Map<String, Value>,
    overrides: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = globals.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
