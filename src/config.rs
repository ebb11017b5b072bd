//! YAML configuration: endpoint profiles and test plans.
//!
//! A single configuration file carries two sections: `api_configs`, which
//! maps profile names to endpoint templates (URL, headers, request body),
//! and `test_configs`, which maps plan names to concurrency sweeps.
//! Templates use `{name}` placeholders resolved at render time; body
//! string leaves additionally accept the literal `{prompt}` token.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur when loading or rendering configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Unknown API profile: '{0}'")]
    UnknownApi(String),

    #[error("Unknown test config: '{0}'")]
    UnknownTestConfig(String),

    #[error("Unresolved template placeholder: '{{{0}}}'")]
    UnresolvedPlaceholder(String),
}

/// A target endpoint description: where to send requests and how to
/// shape them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointProfile {
    /// Display name, e.g. "OpenAI GPT"
    pub name: String,

    /// Base URL template, e.g. "https://{resource_name}.openai.azure.com"
    pub base_url: String,

    /// Endpoint-kind to path-template mapping, e.g. chat -> "/v1/chat/completions"
    pub endpoints: IndexMap<String, String>,

    /// Header name to header-value template, in file order
    pub headers: IndexMap<String, String>,

    /// Request body template; string leaves may contain `{prompt}`
    pub request_format: Value,
}

/// A fully rendered wire request.
#[derive(Debug, Clone)]
pub struct RenderedRequest {
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Value,
}

impl EndpointProfile {
    /// Render a wire request for one prompt.
    ///
    /// Placeholder expansion runs over the base URL, the endpoint path and
    /// every header value; body string leaves get placeholder expansion
    /// followed by `{prompt}` substitution. The body template itself is
    /// never mutated.
    ///
    /// # Errors
    /// Any placeholder without a value in `params` is a configuration
    /// error; there is no silent defaulting.
    pub fn render(
        &self,
        kind: &str,
        prompt: &str,
        params: &HashMap<String, String>,
    ) -> Result<RenderedRequest, ConfigError> {
        let base = expand_placeholders(&self.base_url, params, false)?;

        let path_template = match self.endpoints.get(kind) {
            Some(path) => path.as_str(),
            None => {
                warn!(kind = kind, profile = %self.name, "Unknown endpoint kind, using base URL only");
                ""
            }
        };
        let path = expand_placeholders(path_template, params, false)?;

        let mut headers = IndexMap::with_capacity(self.headers.len());
        for (name, value_template) in &self.headers {
            let value = expand_placeholders(value_template, params, false)?;
            headers.insert(name.clone(), value);
        }

        let body = render_body_value(&self.request_format, prompt, params)?;

        Ok(RenderedRequest {
            url: format!("{}{}", base, path),
            headers,
            body,
        })
    }
}

/// A test plan: the concurrency sweep and per-request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    pub name: String,

    /// Concurrency levels to sweep, in order
    pub concurrent_levels: Vec<usize>,

    /// Requests issued at each level
    pub requests_per_level: usize,

    /// Per-request timeout in seconds
    pub timeout: u64,

    /// Accepted for config-file compatibility; the executor always runs
    /// up to 3 attempts regardless of this value.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Idle seconds before each stage
    #[serde(default = "default_ramp_up")]
    pub ramp_up_time: u64,

    /// Idle seconds between stages
    #[serde(default = "default_cool_down")]
    pub cool_down_time: u64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_ramp_up() -> u64 {
    5
}

fn default_cool_down() -> u64 {
    10
}

/// Root configuration file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub api_configs: IndexMap<String, EndpointProfile>,

    #[serde(default)]
    pub test_configs: IndexMap<String, TestConfig>,
}

impl ConfigFile {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConfigFile = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Look up an endpoint profile by name.
    pub fn api_config(&self, name: &str) -> Result<&EndpointProfile, ConfigError> {
        self.api_configs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownApi(name.to_string()))
    }

    /// Look up a test plan by name.
    pub fn test_config(&self, name: &str) -> Result<&TestConfig, ConfigError> {
        self.test_configs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTestConfig(name.to_string()))
    }

    /// Names of all configured endpoint profiles, in file order.
    pub fn api_names(&self) -> Vec<&str> {
        self.api_configs.keys().map(String::as_str).collect()
    }

    /// Names of all configured test plans, in file order.
    pub fn test_names(&self) -> Vec<&str> {
        self.test_configs.keys().map(String::as_str).collect()
    }
}

/// Expands `{name}` placeholders from `params`.
///
/// With `keep_prompt` set, the literal `{prompt}` token is left in place
/// for a later substitution pass; otherwise it is treated like any other
/// placeholder and must be present in `params`.
fn expand_placeholders(
    template: &str,
    params: &HashMap<String, String>,
    keep_prompt: bool,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                if keep_prompt && key == "prompt" {
                    out.push_str("{prompt}");
                } else {
                    match params.get(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            return Err(ConfigError::UnresolvedPlaceholder(key.to_string()));
                        }
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated brace: keep the tail verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Renders one body-template node, deep-copying as it goes.
fn render_body_value(
    template: &Value,
    prompt: &str,
    params: &HashMap<String, String>,
) -> Result<Value, ConfigError> {
    match template {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), render_body_value(value, prompt, params)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_body_value(item, prompt, params)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => {
            let expanded = expand_placeholders(s, params, true)?;
            Ok(Value::String(expanded.replace("{prompt}", prompt)))
        }
        other => Ok(other.clone()),
    }
}
