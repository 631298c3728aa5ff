//! Coasters Configuration
//!
//! TOML configuration for a coasters node: identity, environment,
//! coordination backend, reporter cadence, HTTP API and logging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that forces the deployment environment
pub const ENV_VAR: &str = "COASTERS_ENV";

/// Main coasters configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoastersConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Lock service and pub/sub configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Status reporter configuration
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Deployment environment. Dev and prod fleets never share storage,
/// channels or lease keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl Environment {
    /// Short tag used in paths, channel names and lease keys
    pub fn tag(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }

    /// Resolve the `COASTERS_ENV` override: only `prod` selects production
    pub fn from_override(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("prod") {
            Environment::Prod
        } else {
            Environment::Dev
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (used in logs and as lease holder name)
    pub id: String,

    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Base directory for the record store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Which coordination backend provides locks and pub/sub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process lease table and channel hub (single instance)
    #[default]
    Memory,
    /// Shared TCP coordination broker
    Broker,
}

/// Coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: Backend,

    /// Broker address (host:port), required for the broker backend
    #[serde(default)]
    pub broker_address: Option<String>,

    /// Lease time-to-live in milliseconds
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Broker connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Broker request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Status reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// Run the leader-gated reporter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick interval in milliseconds
    #[serde(default = "default_report_interval_ms")]
    pub interval_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional). Keeps logs off the reporter's console.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

fn default_report_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            broker_address: None,
            lease_ttl_ms: default_lease_ttl_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_report_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl CoastersConfig {
    /// Build a default configuration for the given node id
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                environment: Environment::default(),
                data_dir: default_data_dir(),
            },
            coordination: CoordinationConfig::default(),
            reporter: ReporterConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CoastersConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply the `COASTERS_ENV` override, if present
    pub fn apply_env_override(&mut self, value: Option<&str>) {
        if let Some(value) = value {
            self.node.environment = Environment::from_override(value);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        // TTL/5 must still be a usable backoff
        if self.coordination.lease_ttl_ms < 10 {
            return Err(crate::Error::Config(
                "coordination.lease_ttl_ms must be at least 10".into(),
            ));
        }

        // A renewal must be able to fail and still leave time to step down
        let renew_window = self.coordination.lease_ttl_ms / 2;
        for (name, value) in [
            ("connect_timeout_ms", self.coordination.connect_timeout_ms),
            ("request_timeout_ms", self.coordination.request_timeout_ms),
        ] {
            if value == 0 || value >= renew_window {
                return Err(crate::Error::Config(format!(
                    "coordination.{} must be between 1 and {} (half of lease_ttl_ms)",
                    name,
                    renew_window.saturating_sub(1)
                )));
            }
        }

        if self.coordination.backend == Backend::Broker
            && self
                .coordination
                .broker_address
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(crate::Error::Config(
                "coordination.broker_address is required for the broker backend".into(),
            ));
        }

        if self.reporter.interval_ms == 0 {
            return Err(crate::Error::Config("reporter.interval_ms cannot be 0".into()));
        }

        Ok(())
    }

    /// Environment of this node
    pub fn environment(&self) -> Environment {
        self.node.environment
    }

    /// Record store directory, one per environment
    pub fn store_dir(&self) -> PathBuf {
        self.node
            .data_dir
            .join(format!("{}_db", self.node.environment.tag()))
    }

    /// Lease key for the reporter leadership lock
    pub fn lease_key(&self) -> String {
        format!("{}-coasters-leader", self.node.environment.tag())
    }

    /// Mutation bus channel name
    pub fn channel_name(&self) -> String {
        ["coasters", self.node.environment.tag(), "channel"].join(":")
    }

    /// Lease TTL as Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.coordination.lease_ttl_ms)
    }

    /// Get reporter interval as Duration
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.reporter.interval_ms)
    }

    /// Get broker connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.connect_timeout_ms)
    }

    /// Get broker request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.request_timeout_ms)
    }
}
