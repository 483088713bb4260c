//! Configuration for stagepayd

use serde::{Deserialize, Serialize};
use stagepay_core::{LinkReissuePolicy, StageEngineConfig, StageStorageConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub issuer: IssuerConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable permissive CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8095)),
            enable_cors: true,
        }
    }
}

/// Stage store backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,
    },
}

/// Lifecycle engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Currency sent to the issuer with every link request
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Upper bound on a single issuer call
    #[serde(default = "default_issuer_timeout_ms")]
    pub issuer_timeout_ms: u64,

    #[serde(default)]
    pub link_reissue: LinkReissuePolicy,

    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            issuer_timeout_ms: default_issuer_timeout_ms(),
            link_reissue: LinkReissuePolicy::default(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

/// Payment link issuer selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IssuerConfig {
    /// Deterministic local links
    Mock {
        #[serde(default = "default_mock_base_url")]
        base_url: String,
    },

    /// Payment processor HTTP API
    Http {
        endpoint: String,

        #[serde(default)]
        bearer_token: Option<String>,
    },
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self::Mock {
            base_url: default_mock_base_url(),
        }
    }
}

/// Background overdue sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
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

fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_issuer_timeout_ms() -> u64 {
    10_000
}

fn default_max_cas_attempts() -> u32 {
    8
}

fn default_mock_base_url() -> String {
    "https://pay.local".to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Layer defaults, an optional file, then `STAGEPAY__SECTION__KEY` variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STAGEPAY")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.engine.currency.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "engine.currency must not be empty".to_string(),
            ));
        }
        if self.engine.issuer_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "engine.issuer_timeout_ms must be positive".to_string(),
            ));
        }
        if self.engine.max_cas_attempts == 0 {
            return Err(config::ConfigError::Message(
                "engine.max_cas_attempts must be at least 1".to_string(),
            ));
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(config::ConfigError::Message(
                "sweeper.interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> StageEngineConfig {
        StageEngineConfig {
            currency: self.engine.currency.clone(),
            issuer_timeout: self.issuer_timeout(),
            link_reissue: self.engine.link_reissue,
            max_cas_attempts: self.engine.max_cas_attempts,
        }
    }

    pub fn issuer_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.issuer_timeout_ms)
    }

    pub fn storage_config(&self) -> StageStorageConfig {
        match &self.storage {
            StorageConfig::Memory => StageStorageConfig::Memory,
            StorageConfig::Postgres {
                url,
                max_connections,
            } => StageStorageConfig::postgres(url.clone(), *max_connections),
        }
    }
}
