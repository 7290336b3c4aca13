use rpc_proxy::config::{Config as RpcProxyConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "gateway".into()
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub rpc_proxy: RpcProxyConfig,
}

impl Config {
    /// Loads and validates the config file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.rpc_proxy.validate()?;

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
}
