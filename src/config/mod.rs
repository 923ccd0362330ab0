//! Orchestrator settings
//!
//! Settings come from an optional YAML file. Every field has a default, so
//! an empty file (or no file) yields the stock lab: `10.12.0.0/16`, the
//! default images, and the polling budgets the provisioner and fabric use.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::DEFAULT_AGENT_PORT;
use crate::layout::LayoutAlgorithm;
use crate::poll::{Backoff, IntervalWait};
use crate::topology::store::DEFAULT_CONFLICT_RETRIES;
use crate::topology::AddressSpace;
use crate::workload::{WorkloadImages, WorkloadTemplate};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
}

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("YAML parse error: {0}")]
    ParseError(String),

    #[error("Namespace must not be empty")]
    EmptyNamespace,

    #[error("{0} must allow at least one attempt")]
    NoAttempts(&'static str),

    #[error("{0} ceiling is below its floor")]
    CeilingBelowFloor(&'static str),

    #[error("Bulk pool size must be at least 1")]
    EmptyPool,

    #[error("Interface wait interval must be positive")]
    ZeroInterval,
}

/// Worker pool for bulk operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Delay between two submissions, in seconds
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
}

fn default_pool_size() -> usize {
    4
}

fn default_stagger_secs() -> u64 {
    2
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            stagger_secs: default_stagger_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Namespace used when the context does not name one
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub address_space: AddressSpace,

    /// Cluster node every device pod is scheduled on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default)]
    pub images: WorkloadImages,

    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    #[serde(default = "Backoff::readiness")]
    pub readiness: Backoff,

    #[serde(default = "Backoff::bridge_verify")]
    pub bridge_verify: Backoff,

    /// `list-ports` checks after each `add-port`
    #[serde(default = "default_bridge_checks")]
    pub bridge_checks_per_attempt: u32,

    #[serde(default)]
    pub interface_wait: IntervalWait,

    #[serde(default)]
    pub bulk: BulkSettings,

    #[serde(default)]
    pub layout: LayoutAlgorithm,

    /// Re-reads of a record after a version conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_bridge_checks() -> u32 {
    3
}

fn default_conflict_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            address_space: AddressSpace::default(),
            node_name: None,
            images: WorkloadImages::default(),
            agent_port: default_agent_port(),
            readiness: Backoff::readiness(),
            bridge_verify: Backoff::bridge_verify(),
            bridge_checks_per_attempt: default_bridge_checks(),
            interface_wait: IntervalWait::default(),
            bulk: BulkSettings::default(),
            layout: LayoutAlgorithm::default(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl Settings {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Manifest builder configured from these settings
    pub fn template(&self) -> WorkloadTemplate {
        WorkloadTemplate::new(self.images.clone(), self.address_space)
            .with_node_name(self.node_name.clone())
    }
}

// ============================================================================
// SBIO: Pure parsing and validation
// ============================================================================

/// Parse settings YAML; an empty document yields the defaults
pub fn parse_settings(content: &str) -> Result<Settings, SettingsError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
}

pub fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    if settings.namespace.trim().is_empty() {
        return Err(SettingsError::EmptyNamespace);
    }

    for (label, backoff) in [
        ("Readiness", &settings.readiness),
        ("Bridge verification", &settings.bridge_verify),
    ] {
        if backoff.max_attempts == 0 {
            return Err(SettingsError::NoAttempts(label));
        }
        if backoff.ceiling_secs < backoff.floor_secs {
            return Err(SettingsError::CeilingBelowFloor(label));
        }
    }

    if settings.bridge_checks_per_attempt == 0 {
        return Err(SettingsError::NoAttempts("Bridge port checks"));
    }
    if settings.conflict_retries == 0 {
        return Err(SettingsError::NoAttempts("Conflict retries"));
    }
    if settings.interface_wait.interval_secs == 0 {
        return Err(SettingsError::ZeroInterval);
    }
    if settings.bulk.pool_size == 0 {
        return Err(SettingsError::EmptyPool);
    }
    Ok(())
}

impl std::str::FromStr for Settings {
    type Err = SettingsError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let settings = parse_settings(content)?;
        validate_settings(&settings)?;
        Ok(settings)
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a settings file from disk
pub fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.parse()?)
}
