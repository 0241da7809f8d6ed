//! Runtime configuration: listen address, upstream base, model overrides.
//!
//! The outer CLI (or whatever starts the process) hands these in; the proxy
//! itself never writes configuration anywhere.

use crate::error::{ProxyError, Result};
use crate::router::{classify, ApiFlavor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    /// When set, every request is sent upstream with this model id instead
    /// of the one the client asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model_override: Option<String>,
    /// Per-model routing overrides, consulted before the built-in classifier.
    #[serde(default)]
    pub flavor_overrides: HashMap<String, ApiFlavor>,
    /// Route every model to the Responses API.
    #[serde(default)]
    pub force_responses: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    19000
}

fn default_upstream_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_base_url: default_upstream_base_url(),
            default_model_override: None,
            flavor_overrides: HashMap::new(),
            force_responses: false,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl RouterConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The upstream model id for a request, after the configured override.
    pub fn upstream_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.default_model_override.as_deref().unwrap_or(requested)
    }

    /// Which API flavor to try first for a model. Precedence: the
    /// force-responses switch, then per-model overrides, then the classifier.
    pub fn flavor_for(&self, model: &str) -> ApiFlavor {
        if self.force_responses {
            return ApiFlavor::Responses;
        }
        if let Some(&flavor) = self.flavor_overrides.get(model) {
            return flavor;
        }
        classify(model)
    }
}
