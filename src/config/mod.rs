//! Filter configuration: the document handed over by the control plane and the
//! validated, immutable snapshot requests are served from.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use http::HeaderName;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod store;
mod watch;

pub use store::SnapshotStore;
pub use watch::{ConfigWatcher, DEFAULT_WATCH_INTERVAL};

pub const DEFAULT_SELECTED_ROUTE_HEADER_KEY: &str = "x-ai-eg-selected-route";
pub const DEFAULT_MODEL_NAME_HEADER_KEY: &str = "x-ai-eg-model";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("unknown schema `{0}`")]
    UnknownSchema(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SchemaName {
    OpenAI,
    Anthropic,
    GcpGemini,
}

impl SchemaName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::GcpGemini => "GCPGemini",
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SchemaName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "OpenAI" => Ok(Self::OpenAI),
            "Anthropic" => Ok(Self::Anthropic),
            "GCPGemini" => Ok(Self::GcpGemini),
            _ => Err(ConfigError::UnknownSchema(value)),
        }
    }
}

impl From<SchemaName> for String {
    fn from(value: SchemaName) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionedSchema {
    pub name: SchemaName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl VersionedSchema {
    pub fn new(name: SchemaName) -> Self {
        Self {
            name,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Backend {
    pub name: String,
    pub schema: VersionedSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    /// Base URL used by the HTTP upstream, e.g. `https://api.openai.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Static headers added to every call to this backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name_override: Option<String>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("weight", &self.weight)
            .field("url", &self.url)
            .field("headers", &"<redacted>")
            .field("model_name_override", &self.model_name_override)
            .finish()
    }
}

impl Backend {
    pub fn new(name: impl Into<String>, schema: SchemaName) -> Self {
        Self {
            name: name.into(),
            schema: VersionedSchema::new(schema),
            weight: None,
            url: None,
            headers: BTreeMap::new(),
            model_name_override: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_model_name_override(mut self, model: impl Into<String>) -> Self {
        self.model_name_override = Some(model.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRule {
    pub name: String,
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    pub backends: Vec<Backend>,
}

/// The document as written by the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigDocument {
    pub schema: VersionedSchema,
    #[serde(default = "default_selected_route_header_key")]
    pub selected_route_header_key: String,
    #[serde(default = "default_model_name_header_key")]
    pub model_name_header_key: String,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

fn default_selected_route_header_key() -> String {
    DEFAULT_SELECTED_ROUTE_HEADER_KEY.to_string()
}

fn default_model_name_header_key() -> String {
    DEFAULT_MODEL_NAME_HEADER_KEY.to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(Self::Json),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

impl ConfigDocument {
    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Json => {
                serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
            }
            #[cfg(feature = "config-yaml")]
            ConfigFormat::Yaml => {
                serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
            }
            #[cfg(not(feature = "config-yaml"))]
            ConfigFormat::Yaml => Err(ConfigError::UnsupportedFormat(
                "yaml (enable the `config-yaml` feature)".to_string(),
            )),
            ConfigFormat::Toml => {
                toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
            }
        }
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text, format)
    }
}

/// A validated configuration. Never mutated after construction; replaced
/// wholesale through [`SnapshotStore`].
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    schema: VersionedSchema,
    selected_route_header_key: HeaderName,
    model_name_header_key: HeaderName,
    rules: Vec<RouteRule>,
    generation: u64,
}

impl ConfigSnapshot {
    pub fn schema(&self) -> &VersionedSchema {
        &self.schema
    }

    pub fn selected_route_header_key(&self) -> &HeaderName {
        &self.selected_route_header_key
    }

    pub fn model_name_header_key(&self) -> &HeaderName {
        &self.model_name_header_key
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        ConfigDocument::load(path).await?.try_into()
    }
}

impl TryFrom<ConfigDocument> for ConfigSnapshot {
    type Error = ConfigError;

    fn try_from(doc: ConfigDocument) -> Result<Self, Self::Error> {
        if doc.schema.name != SchemaName::OpenAI {
            return Err(ConfigError::Invalid(format!(
                "client schema {} is not supported",
                doc.schema.name
            )));
        }
        let selected_route_header_key =
            parse_header_name("selectedRouteHeaderKey", &doc.selected_route_header_key)?;
        let model_name_header_key =
            parse_header_name("modelNameHeaderKey", &doc.model_name_header_key)?;

        if doc.rules.is_empty() {
            return Err(ConfigError::Invalid("no rules configured".to_string()));
        }

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());
        for mut rule in doc.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::Invalid("rule name must not be empty".to_string()));
            }
            if !seen.insert(rule.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate rule name `{}`",
                    rule.name
                )));
            }
            if rule.backends.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "rule `{}` has no backends",
                    rule.name
                )));
            }
            for header in &mut rule.headers {
                let name = parse_header_name(&format!("rule `{}` header", rule.name), &header.name)?;
                header.name = name.as_str().to_string();
            }
            for backend in &rule.backends {
                validate_backend(&doc.schema, &rule.name, backend)?;
            }
            rules.push(rule);
        }

        Ok(Self {
            schema: doc.schema,
            selected_route_header_key,
            model_name_header_key,
            rules,
            generation: 0,
        })
    }
}

fn parse_header_name(what: &str, name: &str) -> Result<HeaderName, ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{what} must not be empty")));
    }
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ConfigError::Invalid(format!("{what} `{name}` is not a valid header name")))
}

fn validate_backend(
    client: &VersionedSchema,
    rule: &str,
    backend: &Backend,
) -> Result<(), ConfigError> {
    if backend.name.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "rule `{rule}` has a backend without a name"
        )));
    }
    if !crate::translator::supports_pair(client.name, backend.schema.name) {
        return Err(ConfigError::Invalid(format!(
            "backend `{}` in rule `{rule}`: no translation from {} to {}",
            backend.name, client.name, backend.schema.name
        )));
    }
    if let Some(url) = backend.url.as_deref() {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "backend `{}` url must be http(s): {url}",
                backend.name
            )));
        }
    }
    for name in backend.headers.keys() {
        parse_header_name(&format!("backend `{}` header", backend.name), name)?;
    }
    Ok(())
}
