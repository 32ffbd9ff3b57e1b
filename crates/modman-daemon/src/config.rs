//! Configuration for modmand

use modman_deployment::{Timeouts, VolumeNamingScheme};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Job engine configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Per-call timeouts of orchestration work
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Where the container engine, secret and host resource services live
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    #[serde(default)]
    pub modules: ModulesConfig,

    #[serde(default)]
    pub volumes: VolumesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Maximum number of jobs running at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Interval between purges of finished jobs, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Age after which finished jobs are purged, in seconds
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            purge_interval_secs: default_purge_interval(),
            max_age_secs: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_database_timeout")]
    pub database_secs: u64,

    #[serde(default = "default_http_timeout")]
    pub http_secs: u64,

    /// Time a timed-out call gets to clean up after cancellation
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            database_secs: default_database_timeout(),
            http_secs: default_http_timeout(),
            grace_secs: default_grace(),
        }
    }
}

impl TimeoutsConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            database: Duration::from_secs(self.database_secs),
            http: Duration::from_secs(self.http_secs),
            grace: Duration::from_secs(self.grace_secs),
        }
    }
}

/// Collaborator backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CollaboratorsConfig {
    /// In-memory fakes, nothing is actually run (dry-run mode)
    #[default]
    Memory,

    /// Remote services over HTTP
    Http {
        engine_url: String,
        secrets_url: String,
        host_resources_url: String,

        /// Interval between polls of asynchronous engine jobs, in milliseconds
        #[serde(default = "default_poll_interval")]
        poll_interval_ms: u64,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Directory module descriptors are loaded from at startup
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Root under which deployment include directories are created
    #[serde(default)]
    pub include_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumesConfig {
    /// Recognized naming schemes; the first one names new volumes
    #[serde(default = "default_schemes")]
    pub schemes: Vec<VolumeNamingScheme>,
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            schemes: default_schemes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_purge_interval() -> u64 {
    300
}

fn default_max_age() -> u64 {
    24 * 60 * 60
}

fn default_database_timeout() -> u64 {
    15
}

fn default_http_timeout() -> u64 {
    120
}

fn default_grace() -> u64 {
    2
}

fn default_poll_interval() -> u64 {
    500
}

fn default_schemes() -> Vec<VolumeNamingScheme> {
    vec![VolumeNamingScheme::ContentHash]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and `MODMAN__*`
    /// environment variables, in increasing precedence
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Double underscore separates sections, field names use single ones
        builder = builder.add_source(
            config::Environment::with_prefix("MODMAN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
