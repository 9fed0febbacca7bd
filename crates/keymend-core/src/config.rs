//! Configuration module for keymend
//!
//! Loads settings from a TOML file with defaults for every value. The CLI
//! layers its flags on top, then [`Config::validate`] runs before any
//! network I/O happens.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::{CollectionId, KeyShape, KeyVariant, LegacyConvention};
use crate::connection::{ConnectionConfig, TlsSettings};
use crate::error::{KvError, Result};

/// Default data-node port
pub const DEFAULT_KV_PORT: u16 = 11210;

/// Default data-node TLS port
pub const DEFAULT_KV_TLS_PORT: u16 = 11207;

/// Upper bound on documents processed concurrently
pub const MAX_WORKERS: usize = 256;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster endpoint and credentials
    pub cluster: ClusterSettings,

    /// What the run does to each legacy document
    pub migration: MigrationSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            KvError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| KvError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster.port == 0 {
            return Err(KvError::InvalidArgument(
                "0 is not a valid port number".to_string(),
            ));
        }
        if self.cluster.host.is_empty() {
            return Err(KvError::InvalidArgument("host cannot be empty".to_string()));
        }
        if self.cluster.bucket.is_empty() {
            return Err(KvError::InvalidArgument(
                "bucket cannot be empty".to_string(),
            ));
        }
        if self.cluster.connect_timeout_ms == 0 || self.cluster.request_timeout_ms == 0 {
            return Err(KvError::InvalidArgument(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.migration.workers == 0 || self.migration.workers > MAX_WORKERS {
            return Err(KvError::InvalidArgument(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.migration.workers
            )));
        }
        if !self.migration.search_all_vbuckets && self.migration.probe_variants.is_empty() {
            return Err(KvError::InvalidArgument(
                "at least one probe variant is required".to_string(),
            ));
        }

        self.key_shape()?;
        Ok(())
    }

    /// Key shaping rules implied by the migration settings
    pub fn key_shape(&self) -> Result<KeyShape> {
        let collection = CollectionId::new(self.migration.collection_id)?;
        KeyShape::new(self.migration.convention, collection)
    }

    /// Connection parameters for every node of the run
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let shape = self.key_shape()?;
        Ok(ConnectionConfig {
            bucket: self.cluster.bucket.clone(),
            username: self.cluster.username.clone(),
            password: self.cluster.password.clone(),
            tls: self.cluster.tls.then(|| TlsSettings {
                ca_file: self.cluster.tls_ca_file.clone(),
                verify: self.cluster.tls_verify,
            }),
            connect_timeout: Duration::from_millis(self.cluster.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.cluster.request_timeout_ms),
            collections: shape.collections_enabled(),
            ..ConnectionConfig::default()
        })
    }
}

/// Cluster endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Seed data-node hostname
    pub host: String,

    /// Seed data-node port (11210, or 11207 with TLS)
    pub port: u16,

    /// Bucket to repair
    pub bucket: String,

    pub username: String,

    pub password: String,

    /// Encrypt every connection
    pub tls: bool,

    /// Extra CA certificate (PEM) trusted for TLS
    pub tls_ca_file: Option<PathBuf>,

    /// Verify server certificates; disable for self-signed clusters
    pub tls_verify: bool,

    /// TCP/TLS connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Per-request response timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Query service endpoint; derived from `host` when unset
    pub query_url: Option<String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_KV_PORT,
            bucket: "default".to_string(),
            username: "Administrator".to_string(),
            password: "password".to_string(),
            tls: false,
            tls_ca_file: None,
            tls_verify: true,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            query_url: None,
        }
    }
}

impl ClusterSettings {
    /// Query service URL, explicit or derived from the seed host
    pub fn query_url(&self) -> String {
        match &self.query_url {
            Some(url) => url.clone(),
            None if self.tls => format!("https://{}:18093/query/service", self.host),
            None => format!("http://{}:8093/query/service", self.host),
        }
    }
}

/// What the run does to each legacy document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Collection the canonical documents are created in
    pub collection_id: u32,

    /// How the legacy ids were written
    pub convention: LegacyConvention,

    /// Key shapes whose vbuckets are probed for each id
    pub probe_variants: Vec<KeyVariant>,

    /// Probe every vbucket instead of the variants' vbuckets
    pub search_all_vbuckets: bool,

    /// Log each candidate's extended attributes
    pub print_xattrs: bool,

    /// Create the canonical copy of each document
    pub restore: bool,

    /// Delete every legacy copy found
    pub delete: bool,

    /// Documents processed concurrently
    pub workers: usize,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            collection_id: 0,
            convention: LegacyConvention::CollectionPrefix,
            probe_variants: vec![KeyVariant::AsGiven, KeyVariant::Stripped],
            search_all_vbuckets: false,
            print_xattrs: false,
            restore: false,
            delete: false,
            workers: 4,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}
