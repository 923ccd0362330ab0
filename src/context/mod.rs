use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ClusterConnection;

/// Default config file location: ~/.vnetctl/config
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vnetctl")
        .join("config")
}

/// Errors that can occur during context operations
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Context '{0}' not found")]
    ContextNotFound(String),

    #[error("No current context set")]
    NoCurrentContext,

    #[error("Context name must not be empty")]
    EmptyName,

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A named cluster the CLI can talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    /// API server URL, e.g. "https://10.0.0.1:6443"
    pub server: String,
    /// Bearer token for the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Namespace holding the topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Skip TLS certificate verification
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
}

/// The complete configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "current-context")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,

    /// Contexts keyed by name
    #[serde(default)]
    pub contexts: BTreeMap<String, Context>,
}

// ============================================================================
// Pure config logic (no I/O)
// ============================================================================

pub fn parse_config(content: &str) -> Result<Config, ContextError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(content).map_err(|e| ContextError::ParseError(e.to_string()))
}

pub fn serialize_config(config: &Config) -> Result<String, ContextError> {
    serde_yaml::to_string(config).map_err(|e| ContextError::WriteError(e.to_string()))
}

/// Add or replace a context
pub fn add_context(config: &mut Config, context: Context) -> Result<(), ContextError> {
    if context.name.trim().is_empty() {
        return Err(ContextError::EmptyName);
    }
    config.contexts.insert(context.name.clone(), context);
    Ok(())
}

pub fn remove_context(config: &mut Config, name: &str) -> Result<Context, ContextError> {
    let removed = config
        .contexts
        .remove(name)
        .ok_or_else(|| ContextError::ContextNotFound(name.to_string()))?;
    if config.current_context.as_deref() == Some(name) {
        config.current_context = None;
    }
    Ok(removed)
}

pub fn set_current_context(config: &mut Config, name: &str) -> Result<(), ContextError> {
    if !config.contexts.contains_key(name) {
        return Err(ContextError::ContextNotFound(name.to_string()));
    }
    config.current_context = Some(name.to_string());
    Ok(())
}

/// The context selected by `name`, or the current one
pub fn resolve_context<'a>(config: &'a Config, name: Option<&str>) -> Result<&'a Context, ContextError> {
    let name = match name {
        Some(name) => name,
        None => config
            .current_context
            .as_deref()
            .ok_or(ContextError::NoCurrentContext)?,
    };
    config
        .contexts
        .get(name)
        .ok_or_else(|| ContextError::ContextNotFound(name.to_string()))
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from a path; a missing file is an empty config
pub fn load_config_from(path: &Path) -> Result<Config, ContextError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ContextError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

impl Context {
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            token: None,
            namespace: None,
            insecure: false,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Connection parameters, with `token` taking precedence over the stored one
    pub fn connection(&self, token: Option<String>) -> ClusterConnection {
        ClusterConnection::new(self.server.clone())
            .with_token(token.or_else(|| self.token.clone()))
            .with_insecure(self.insecure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
current-context: lab
contexts:
  lab:
    name: lab
    server: https://10.0.0.1:6443
    token: secret123
    namespace: netlab
    insecure: true
"#;
        let config = parse_config(yaml).unwrap();
        let lab = resolve_context(&config, None).unwrap();
        assert_eq!(lab.server, "https://10.0.0.1:6443");
        assert_eq!(lab.namespace.as_deref(), Some("netlab"));
        assert!(lab.insecure);
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(parse_config("").unwrap(), Config::default());
        assert!(matches!(parse_config("contexts: [1"), Err(ContextError::ParseError(_))));
    }

    #[test]
    fn test_serialize_omits_defaults() {
        let mut config = Config::default();
        add_context(&mut config, Context::new("lab", "https://k8s:6443")).unwrap();
        set_current_context(&mut config, "lab").unwrap();

        let yaml = serialize_config(&config).unwrap();
        assert!(yaml.contains("current-context: lab"));
        assert!(yaml.contains("server: https://k8s:6443"));
        assert!(!yaml.contains("insecure"));
        assert!(!yaml.contains("token"));
    }

    #[test]
    fn test_remove_current_context_clears_it() {
        let mut config = Config::default();
        add_context(&mut config, Context::new("lab", "https://k8s:6443")).unwrap();
        set_current_context(&mut config, "lab").unwrap();

        remove_context(&mut config, "lab").unwrap();
        assert!(config.current_context.is_none());
        assert!(matches!(
            remove_context(&mut config, "lab"),
            Err(ContextError::ContextNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_errors() {
        let mut config = Config::default();
        assert!(matches!(resolve_context(&config, None), Err(ContextError::NoCurrentContext)));
        assert!(matches!(
            set_current_context(&mut config, "nope"),
            Err(ContextError::ContextNotFound(_))
        ));
        assert!(matches!(
            add_context(&mut config, Context::new(" ", "https://k8s")),
            Err(ContextError::EmptyName)
        ));
    }

    #[test]
    fn test_connection_token_override() {
        let ctx = Context::new("lab", "https://k8s:6443").with_token("stored");
        assert_eq!(ctx.connection(None).token.as_deref(), Some("stored"));
        assert_eq!(
            ctx.connection(Some("env".to_string())).token.as_deref(),
            Some("env")
        );
    }

    #[test]
    fn test_save_and_load_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config");
        assert_eq!(load_config_from(&path).unwrap(), Config::default());

        let mut config = Config::default();
        add_context(
            &mut config,
            Context::new("lab", "https://k8s:6443")
                .with_namespace("netlab")
                .with_insecure(true),
        )
        .unwrap();
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }
}
