use arc_swap::ArcSwap;
use log::{info, warn};
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::errors::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration. Read-only after boot.
static CONFIG: Lazy<ArcSwap<SpannerConfig>> =
    Lazy::new(|| ArcSwap::from_pointee(SpannerConfig::default()));

/// A single upstream PostgreSQL server under a logical database.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password_env: String,
}

impl ClusterConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The password is read from the environment at handshake time,
    /// never cached in the config tree.
    pub fn password(&self) -> Result<String, Error> {
        std::env::var(&self.password_env).map_err(|_| {
            Error::BadConfig(format!(
                "environment variable {} for cluster {} is not set",
                self.password_env, self.name
            ))
        })
    }
}

impl std::fmt::Display for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Cluster: {} Host: {} Port: {} User: {} PasswordEnv: {}",
            self.name, self.host, self.port, self.user, self.password_env
        )
    }
}

/// Pool bounds for one logical database.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoolSettings {
    pub max_open_conns: usize,

    pub max_idle_conns: usize,

    /// Seconds a connection may live before it is closed instead of reused.
    pub max_conn_lifetime: u64,

    /// Seconds an idle connection may live. Parsed for config compatibility.
    pub idle_conn_lifetime: u64,
}

impl PoolSettings {
    pub fn default_max_open_conns() -> usize {
        20
    }

    pub fn default_max_idle_conns() -> usize {
        10
    }

    pub fn default_max_conn_lifetime() -> u64 {
        300
    }

    pub fn default_idle_conn_lifetime() -> u64 {
        60
    }
}

impl Default for PoolSettings {
    fn default() -> PoolSettings {
        PoolSettings {
            max_open_conns: Self::default_max_open_conns(),
            max_idle_conns: Self::default_max_idle_conns(),
            max_conn_lifetime: Self::default_max_conn_lifetime(),
            idle_conn_lifetime: Self::default_idle_conn_lifetime(),
        }
    }
}

impl std::fmt::Display for PoolSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "MaxOpenConns: {} MaxIdleConns: {} MaxConnLifetime: {} IdleConnLifetime: {}",
            self.max_open_conns, self.max_idle_conns, self.max_conn_lifetime,
            self.idle_conn_lifetime
        )
    }
}

/// A logical database visible to clients, backed by one or more clusters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseConfig {
    pub name: String,
    pub auth_method: String,
    #[serde(rename = "SSL")]
    pub ssl: bool,
    pub should_pool: bool,
    pub pool_settings: PoolSettings,
    pub clusters: Vec<ClusterConfig>,
}

impl DatabaseConfig {
    pub fn cluster_by_addr(&self, host: &str, port: u16) -> Option<&ClusterConfig> {
        self.clusters
            .iter()
            .find(|cluster| cluster.host == host && cluster.port == port)
    }
}

/// Logging sink configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_file: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            log_level: String::from("INFO"),
            log_file: String::new(),
            json: false,
        }
    }
}

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct SpannerConfig {
    pub logging: LoggingConfig,

    pub pid_file: String,

    pub listen_addr: String,
    pub listen_port: u16,

    pub databases: Vec<DatabaseConfig>,
}

impl Default for SpannerConfig {
    fn default() -> SpannerConfig {
        SpannerConfig {
            logging: LoggingConfig::default(),
            pid_file: String::new(),
            listen_addr: String::from("127.0.0.1"),
            listen_port: 8000,
            databases: Vec::new(),
        }
    }
}

impl SpannerConfig {
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|database| database.name == name)
    }

    /// `localhost` and the empty string are normalized to a loopback bind.
    pub fn listen_addr(&self) -> String {
        if self.listen_addr == "localhost" || self.listen_addr.is_empty() {
            String::from("127.0.0.1")
        } else {
            self.listen_addr.clone()
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.databases.is_empty() {
            return Err(Error::BadConfig(
                "at least one database must be configured".to_string(),
            ));
        }
        for database in &self.databases {
            if database.name.is_empty() {
                return Err(Error::BadConfig("database without a name".to_string()));
            }
            if database.clusters.is_empty() {
                return Err(Error::BadConfig(format!(
                    "database {} has no clusters",
                    database.name
                )));
            }
            if database.pool_settings.max_open_conns == 0 {
                return Err(Error::BadConfig(format!(
                    "database {}: MaxOpenConns must be at least 1",
                    database.name
                )));
            }
            for cluster in &database.clusters {
                if cluster.host.is_empty() || cluster.port == 0 {
                    return Err(Error::BadConfig(format!(
                        "cluster {} of database {} has no host:port",
                        cluster.name, database.name
                    )));
                }
                if std::env::var(&cluster.password_env).is_err() {
                    warn!(
                        "Environment variable {} for cluster {} is not set, \
                         connections to it will fail",
                        cluster.password_env, cluster.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Print current configuration.
    pub fn show(&self) {
        info!("Listen address: {}", self.listen_addr());
        info!("Listen port: {}", self.listen_port);
        info!("Log level: {}", self.logging.log_level);
        for database in &self.databases {
            info!(
                "[database: {}] pooling: {}, {}",
                database.name, database.should_pool, database.pool_settings
            );
            for cluster in &database.clusters {
                info!("[database: {}] {}", database.name, cluster);
            }
        }
    }
}

/// Parse the config file, validate it and store it globally.
pub async fn parse(path: &str) -> Result<(), Error> {
    let mut contents = String::new();
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not open config file {path}: {err}"
            )))
        }
    };
    if let Err(err) = file.read_to_string(&mut contents).await {
        return Err(Error::BadConfig(format!(
            "Could not read config file {path}: {err}"
        )));
    }

    let config: SpannerConfig = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(err) => return Err(Error::BadConfig(format!("Could not parse {path}: {err}"))),
    };
    config.validate()?;

    CONFIG.store(Arc::new(config));
    Ok(())
}

/// Get a copy of the configuration.
pub fn get_config() -> SpannerConfig {
    (*(*CONFIG.load())).clone()
}

/// Replace the global configuration. Tests wire their own trees through this.
pub fn set_config(config: SpannerConfig) {
    CONFIG.store(Arc::new(config));
}
