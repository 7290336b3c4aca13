use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides the configured CSRF mode at startup.
pub const CSRF_MODE_ENV: &str = "RPC_PROXY_CSRF_MODE";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("max_body_bytes cannot be 0")]
    InvalidBodyLimit,

    #[error("Upstream timeout cannot be 0")]
    InvalidTimeout,

    #[error("Batch limit cannot be 0")]
    InvalidBatchLimit,

    #[error("Chain id cannot be 0")]
    InvalidChainId,

    #[error("Duplicate chain id: {0}")]
    DuplicateChain(u64),

    #[error("Empty upstream url for chain {0}")]
    EmptyChainUrl(u64),

    #[error("Invalid rate limit settings: {0}")]
    InvalidRateLimit(&'static str),

    #[error("Empty CSRF cookie name")]
    EmptyCookieName,

    #[error("Unknown CSRF mode: {0}")]
    UnknownCsrfMode(String),
}

/// RPC proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for gateway traffic
    pub listener: Listener,
    /// Listener for health and readiness probes
    pub admin_listener: Listener,
    /// Largest accepted request body, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Config {
    /// Validates the proxy configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.max_body_bytes == 0 {
            return Err(ValidationError::InvalidBodyLimit);
        }

        self.upstream.validate()?;
        self.rate_limit.validate()?;
        self.csrf.validate()?;

        Ok(())
    }

    /// Replaces the CSRF mode with `value` when one is given, typically read
    /// from [`CSRF_MODE_ENV`].
    pub fn with_csrf_mode_override(
        mut self,
        value: Option<&str>,
    ) -> Result<Self, ValidationError> {
        if let Some(value) = value {
            self.csrf.mode = value.parse()?;
        }
        Ok(self)
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Upstream JSON-RPC provider settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Name of the environment variable holding the provider API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Hard timeout applied to every upstream call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Largest number of calls accepted in one batch
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Chain id to URL templates. The built-in table is used when omitted.
    #[serde(default)]
    pub chains: Option<Vec<ChainConfig>>,
}

fn default_api_key_env() -> String {
    "ALCHEMY_API_KEY".into()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_batch_limit() -> usize {
    50
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            batch_limit: default_batch_limit(),
            chains: None,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        if self.batch_limit == 0 {
            return Err(ValidationError::InvalidBatchLimit);
        }

        let mut chain_ids = HashSet::new();
        for chain in self.chains.iter().flatten() {
            if chain.chain_id == 0 {
                return Err(ValidationError::InvalidChainId);
            }
            if chain.url.trim().is_empty() {
                return Err(ValidationError::EmptyChainUrl(chain.chain_id));
            }
            if !chain_ids.insert(chain.chain_id) {
                return Err(ValidationError::DuplicateChain(chain.chain_id));
            }
        }

        Ok(())
    }
}

/// One entry of the chain endpoint table
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Upstream URL. May contain the `{api_key}` placeholder, in which case
    /// the chain is only served when an API key is configured.
    pub url: String,
}

/// Burst-tolerant fixed window limiter settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub burst_window_millis: u64,
    pub burst_limit: u32,
    pub sustained_limit: u32,
    /// Divisor applied to the request count to derive Retry-After
    pub retry_after_scale: u32,
    pub max_retry_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            window_secs: 10,
            burst_window_millis: 1000,
            burst_limit: 50,
            sustained_limit: 200,
            retry_after_scale: 20,
            max_retry_after_secs: 30,
            sweep_interval_secs: 60,
            stale_after_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.window_secs == 0 {
            return Err(ValidationError::InvalidRateLimit("window_secs cannot be 0"));
        }
        if self.burst_window() > self.window() {
            return Err(ValidationError::InvalidRateLimit(
                "burst window cannot exceed the window",
            ));
        }
        if self.burst_limit > self.sustained_limit {
            return Err(ValidationError::InvalidRateLimit(
                "burst_limit cannot exceed sustained_limit",
            ));
        }
        if self.retry_after_scale == 0 {
            return Err(ValidationError::InvalidRateLimit(
                "retry_after_scale cannot be 0",
            ));
        }
        if self.max_retry_after_secs == 0 {
            return Err(ValidationError::InvalidRateLimit(
                "max_retry_after_secs cannot be 0",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ValidationError::InvalidRateLimit(
                "sweep_interval_secs cannot be 0",
            ));
        }
        if self.stale_after() < self.window() {
            return Err(ValidationError::InvalidRateLimit(
                "stale_after_secs cannot be shorter than window_secs",
            ));
        }
        Ok(())
    }
}

/// What to do with a request whose CSRF token does not validate
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CsrfMode {
    /// Reject with 403
    #[default]
    Enforce,
    /// Log and let the request through
    Report,
    /// Skip the check
    Off,
}

impl CsrfMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CsrfMode::Enforce => "enforce",
            CsrfMode::Report => "report",
            CsrfMode::Off => "off",
        }
    }
}

impl FromStr for CsrfMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enforce" => Ok(CsrfMode::Enforce),
            "report" => Ok(CsrfMode::Report),
            "off" => Ok(CsrfMode::Off),
            _ => Err(ValidationError::UnknownCsrfMode(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CsrfConfig {
    pub mode: CsrfMode,
    /// Cookie whose value must match the X-CSRF-Token header
    pub cookie_name: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        CsrfConfig {
            mode: CsrfMode::default(),
            cookie_name: "csrf_token".into(),
        }
    }
}

impl CsrfConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cookie_name.trim().is_empty() {
            return Err(ValidationError::EmptyCookieName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listener: Listener {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            admin_listener: Listener {
                host: "127.0.0.1".to_string(),
                port: 3001,
            },
            max_body_bytes: default_max_body_bytes(),
            upstream: UpstreamConfig {
                chains: Some(vec![ChainConfig {
                    chain_id: 1,
                    url: "https://eth-mainnet.g.alchemy.com/v2/{api_key}".to_string(),
                }]),
                ..Default::default()
            },
            rate_limit: RateLimitConfig::default(),
            csrf: CsrfConfig::default(),
        }
    }

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
listener:
    host: "0.0.0.0"
    port: 3000
admin_listener:
    host: "127.0.0.1"
    port: 3001
max_body_bytes: 65536
upstream:
    api_key_env: PROVIDER_KEY
    timeout_secs: 5
    batch_limit: 20
    chains:
        - chain_id: 1
          url: "https://eth-mainnet.g.alchemy.com/v2/{api_key}"
        - chain_id: 999
          url: "https://rpc.hyperliquid.xyz/evm"
rate_limit:
    burst_limit: 10
    sustained_limit: 100
csrf:
    mode: report
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 3000);
        assert_eq!(config.max_body_bytes, 65536);
        assert_eq!(config.upstream.api_key_env, "PROVIDER_KEY");
        assert_eq!(config.upstream.timeout(), Duration::from_secs(5));
        assert_eq!(config.upstream.chains.as_ref().unwrap().len(), 2);
        assert_eq!(config.rate_limit.burst_limit, 10);
        // Unset fields keep their defaults
        assert_eq!(config.rate_limit.window_secs, 10);
        assert_eq!(config.csrf.mode, CsrfMode::Report);
        assert_eq!(config.csrf.cookie_name, "csrf_token");
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
listener: {host: "0.0.0.0", port: 3000}
admin_listener: {host: "127.0.0.1", port: 3001}
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.upstream, UpstreamConfig::default());
        assert_eq!(config.upstream.timeout_secs, 15);
        assert_eq!(config.upstream.batch_limit, 50);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.csrf.mode, CsrfMode::Enforce);
    }

    #[test]
    fn test_validation_errors() {
        let base_config = base_config();
        assert!(base_config.validate().is_ok());

        let mut config = base_config.clone();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = base_config.clone();
        config.max_body_bytes = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidBodyLimit));

        let mut config = base_config.clone();
        config.upstream.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidTimeout));

        let mut config = base_config.clone();
        config.upstream.batch_limit = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidBatchLimit));

        let mut config = base_config.clone();
        config.upstream.chains.as_mut().unwrap().push(ChainConfig {
            chain_id: 1,
            url: "https://other.example/".to_string(),
        });
        assert_eq!(config.validate(), Err(ValidationError::DuplicateChain(1)));

        let mut config = base_config.clone();
        config.upstream.chains.as_mut().unwrap()[0].chain_id = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidChainId));

        let mut config = base_config.clone();
        config.upstream.chains.as_mut().unwrap()[0].url = " ".to_string();
        assert_eq!(config.validate(), Err(ValidationError::EmptyChainUrl(1)));

        let mut config = base_config.clone();
        config.rate_limit.burst_limit = 500;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidRateLimit(_))
        ));

        let mut config = base_config.clone();
        config.rate_limit.retry_after_scale = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidRateLimit(_))
        ));

        let mut config = base_config.clone();
        config.rate_limit.stale_after_secs = 1;
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidRateLimit(
                "stale_after_secs cannot be shorter than window_secs"
            ))
        );

        let mut config = base_config.clone();
        config.rate_limit.stale_after_secs = config.rate_limit.window_secs;
        assert!(config.validate().is_ok());

        let mut config = base_config;
        config.csrf.cookie_name = String::new();
        assert_eq!(config.validate(), Err(ValidationError::EmptyCookieName));
    }

    #[test]
    fn test_deserialization_errors() {
        // Invalid port type
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
listener: {host: "0.0.0.0", port: "not_a_number"}
admin_listener: {host: "127.0.0.1", port: 3001}
"#
            )
            .is_err()
        );

        // Missing admin listener
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
listener: {host: "0.0.0.0", port: 3000}
"#
            )
            .is_err()
        );

        // Invalid CSRF mode
        assert!(serde_yaml::from_str::<CsrfMode>("strict").is_err());
    }

    #[test]
    fn test_csrf_mode_override() {
        let config = base_config().with_csrf_mode_override(None).unwrap();
        assert_eq!(config.csrf.mode, CsrfMode::Enforce);

        let config = base_config()
            .with_csrf_mode_override(Some("Report"))
            .unwrap();
        assert_eq!(config.csrf.mode, CsrfMode::Report);

        assert_eq!(
            base_config().with_csrf_mode_override(Some("production")),
            Err(ValidationError::UnknownCsrfMode("production".to_string()))
        );
    }
}
