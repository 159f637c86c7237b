//! TOML settings shared by the CLI and the server.
//!
//! ```toml
//! templates_dir = "templates"
//!
//! [runtime]
//! max_parallel_nodes = 4
//!
//! [[providers]]
//! id = "brand-agent"
//! url = "http://localhost:9000/invoke"
//! timeout_ms = 5000
//! outputs = ["output", "score"]
//! ```

use crate::http::HttpCapabilityProvider;
use canvascore::{CapabilityContract, FlowError, NodeTypeRegistry, TemplateStore};
use canvasruntime::{FlowRuntime, ProviderRegistry, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate provider id '{0}'")]
    DuplicateProvider(String),

    #[error("Cannot build HTTP client for '{id}': {source}")]
    Client {
        id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Cannot load templates: {0}")]
    Templates(#[from] FlowError),
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// One remote capability provider and the node type it contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(flatten)]
    pub contract: CapabilityContract,
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeConfig,
    /// Extra `*.json` templates loaded on top of the built-in ones.
    pub templates_dir: Option<PathBuf>,
    pub providers: Vec<ProviderSettings>,
}

impl Settings {
    /// Load settings from a TOML file. A relative `templates_dir` is
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings = Self::from_toml(&content)?;

        if let (Some(dir), Some(base)) = (&settings.templates_dir, path.parent()) {
            if dir.is_relative() {
                settings.templates_dir = Some(base.join(dir));
            }
        }
        tracing::info!(
            "Loaded settings from {} ({} provider(s))",
            path.display(),
            settings.providers.len()
        );
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    /// Capability contracts of the standard providers and every configured one.
    pub fn contracts(&self) -> Vec<CapabilityContract> {
        let mut contracts = crate::standard_contracts();
        contracts.extend(self.providers.iter().map(|p| p.contract.clone()));
        contracts
    }

    /// Node type registry: built-ins plus one node type per contract.
    pub fn node_types(&self) -> NodeTypeRegistry {
        self.contracts()
            .into_iter()
            .fold(NodeTypeRegistry::builtin(), NodeTypeRegistry::with_capability)
    }

    /// Standard providers plus one HTTP provider per `[[providers]]` entry.
    pub fn provider_registry(&self) -> Result<ProviderRegistry, SettingsError> {
        let mut registry = ProviderRegistry::new();
        crate::register_all(&mut registry);

        for entry in &self.providers {
            if registry.contains(&entry.contract.id) {
                return Err(SettingsError::DuplicateProvider(entry.contract.id.clone()));
            }
            let provider = HttpCapabilityProvider::new(
                entry.contract.id.clone(),
                entry.url.clone(),
                Duration::from_millis(entry.timeout_ms),
            )
            .map_err(|source| SettingsError::Client {
                id: entry.contract.id.clone(),
                source,
            })?
            .with_description(entry.contract.description.clone());
            registry.register(Arc::new(provider));
        }
        Ok(registry)
    }

    pub fn templates(&self) -> Result<TemplateStore, SettingsError> {
        let mut store = TemplateStore::builtin();
        if let Some(dir) = &self.templates_dir {
            store.load_dir(dir)?;
        }
        Ok(store)
    }

    /// Runtime wired with everything these settings describe.
    pub fn build_runtime(&self) -> Result<FlowRuntime, SettingsError> {
        let runtime = FlowRuntime::with_registry(
            Arc::new(self.node_types()),
            Arc::new(self.provider_registry()?),
            self.runtime.clone(),
        )
        .with_templates(self.templates()?);
        Ok(runtime)
    }
}
