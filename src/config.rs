//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::lock::LockOptions;
use crate::transport::TransferMode;

/// Upper bound for the streaming copy chunk
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Main exporter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Client name used to build the session user name (`{client}:{machine}:1`)
    pub client_name: String,

    /// Explicit user name; derived from `client_name` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    /// Explicit machine name; host name when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,

    /// Directory holding contract manifests; auto-discovered when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contracts_dir: Option<PathBuf>,

    /// Server version hint passed to the loader and provider factories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,

    /// Parent directory for staging areas; OS temp dir when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_root: Option<PathBuf>,

    pub chunk_size: usize,
    pub lock: LockConfig,
    pub naming_rules: Vec<NamingRule>,
    pub required_libraries: Vec<String>,
    pub transport: TransportConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            user_name: None,
            machine_name: None,
            contracts_dir: None,
            server_version: None,
            staging_root: None,
            chunk_size: default_chunk_size(),
            lock: LockConfig::default(),
            naming_rules: default_naming_rules(),
            required_libraries: default_required_libraries(),
            transport: TransportConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(name) = std::env::var("MODEL_EXPORT_CLIENT_NAME") {
            config.client_name = name;
        }
        if let Ok(user) = std::env::var("MODEL_EXPORT_USER") {
            config.user_name = Some(user);
        }
        if let Ok(machine) = std::env::var("MODEL_EXPORT_MACHINE") {
            config.machine_name = Some(machine);
        }
        if let Ok(dir) = std::env::var("MODEL_EXPORT_CONTRACTS_DIR") {
            config.contracts_dir = Some(PathBuf::from(dir));
        }
        if let Ok(version) = std::env::var("MODEL_EXPORT_SERVER_VERSION") {
            config.server_version = Some(version);
        }
        if let Ok(dir) = std::env::var("MODEL_EXPORT_STAGING_DIR") {
            config.staging_root = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            anyhow::bail!("client_name cannot be empty");
        }

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "chunk_size must be between 1 and {} (got {})",
                MAX_CHUNK_SIZE,
                self.chunk_size
            );
        }

        for rule in &self.naming_rules {
            if rule.from.is_empty() {
                anyhow::bail!("Naming rule prefix cannot be empty");
            }
        }

        self.transport.validate()?;

        if let Some(root) = &self.staging_root
            && !root.exists()
        {
            std::fs::create_dir_all(root)
                .with_context(|| format!("Cannot create staging root: {:?}", root))?;
        }

        Ok(())
    }
}

/// Lock request parameters
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub options: LockOptions,
    pub allow_non_exclusive: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            options: LockOptions::READ_AND_NON_EXCLUSIVE,
            allow_non_exclusive: true,
        }
    }
}

/// Namespace rewrite tried when a contract type name does not resolve as given
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NamingRule {
    pub from: String,
    pub to: String,
}

impl NamingRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Rewrite `name` if it starts with this rule's prefix
    pub fn apply(&self, name: &str) -> Option<String> {
        name.strip_prefix(&self.from)
            .map(|rest| format!("{}{}", self.to, rest))
    }
}

/// Endpoint substring that selects a transfer mode
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TransferModeRule {
    pub pattern: String,
    pub mode: TransferMode,
}

/// RPC transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub open_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub receive_timeout_secs: u64,
    pub streamed_message_ceiling: u64,
    pub buffered_message_ceiling: u64,
    pub transfer_mode_rules: Vec<TransferModeRule>,
    pub tls: bool,
    /// Extra PEM root certificate for TLS endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<PathBuf>,
    pub accept_gzip: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: default_open_close_timeout(),
            close_timeout_secs: default_open_close_timeout(),
            send_timeout_secs: default_send_receive_timeout(),
            receive_timeout_secs: default_send_receive_timeout(),
            streamed_message_ceiling: default_streamed_ceiling(),
            buffered_message_ceiling: default_buffered_ceiling(),
            transfer_mode_rules: default_transfer_mode_rules(),
            tls: false,
            ca_certificate: None,
            accept_gzip: true,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.open_timeout_secs == 0
            || self.close_timeout_secs == 0
            || self.send_timeout_secs == 0
            || self.receive_timeout_secs == 0
        {
            anyhow::bail!("Transport timeouts must be greater than zero");
        }
        if self.buffered_message_ceiling == 0
            || self.buffered_message_ceiling > default_buffered_ceiling()
        {
            anyhow::bail!(
                "buffered_message_ceiling must fit a 32-bit length (got {})",
                self.buffered_message_ceiling
            );
        }
        if self.streamed_message_ceiling < self.buffered_message_ceiling {
            anyhow::bail!("streamed_message_ceiling cannot be below buffered_message_ceiling");
        }
        let rules = &self.transfer_mode_rules;
        if rules.iter().any(|r| r.pattern.is_empty()) {
            anyhow::bail!("Transfer mode rule pattern cannot be empty");
        }
        if let Some(ca) = &self.ca_certificate
            && !ca.is_file()
        {
            anyhow::bail!("CA certificate not found: {:?}", ca);
        }
        Ok(())
    }
}

// Default functions
fn default_client_name() -> String {
    "ModelExport".to_string()
}
fn default_chunk_size() -> usize {
    16 * 1024
}
fn default_naming_rules() -> Vec<NamingRule> {
    vec![
        NamingRule::new("ModelServer.", "MS."),
        NamingRule::new(
            "ModelServer.Enterprise.Common.ClientServer.",
            "Enterprise.ClientServer.",
        ),
    ]
}
fn default_required_libraries() -> Vec<String> {
    vec![
        crate::contract::PROXY_LIBRARY.to_string(),
        crate::contract::MODEL_CONTRACT_LIBRARY.to_string(),
    ]
}
fn default_open_close_timeout() -> u64 {
    600
}
fn default_send_receive_timeout() -> u64 {
    3600
}
fn default_streamed_ceiling() -> u64 {
    8 * 1024 * 1024 * 1024
}
fn default_buffered_ceiling() -> u64 {
    i32::MAX as u64
}
fn default_transfer_mode_rules() -> Vec<TransferModeRule> {
    vec![
        TransferModeRule {
            pattern: "stream".to_string(),
            mode: TransferMode::Streamed,
        },
        TransferModeRule {
            pattern: "buffer".to_string(),
            mode: TransferMode::Buffered,
        },
    ]
}
