use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_fusion::core::{AdaptiveLimit, CircuitBreakerConfig, RateLimiterConfig, ShutdownConfig};
use lib_fusion::{AlertThresholds, BroadcasterConfig, ServicesConfig};

const DEFAULT_CONFIG_FILE: &str = "fusion_gateway.conf";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid command line: {0}")]
    Cli(#[from] clap::Error),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Fusion sensor ingestion gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FUSION_PORT", help = "Port to listen on for devices, dashboards and probes.")]
    pub port: Option<u16>,

    #[clap(long, env = "FUSION_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FUSION_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FUSION_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL for the sample store. In-memory store when unset.")]
    pub database_url: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Redis URL for the metrics sink. Metrics go to the log when unset.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "FUSION_BREAKER_FAILURE_THRESHOLD", help = "Counted store failures before the circuit opens.")]
    pub breaker_failure_threshold: Option<u32>,

    #[clap(long, env = "FUSION_BREAKER_SUCCESS_THRESHOLD", help = "Half-open successes before the circuit closes.")]
    pub breaker_success_threshold: Option<u32>,

    #[clap(long, env = "FUSION_BREAKER_TIMEOUT_SECS", help = "Seconds the circuit stays open before probing.")]
    pub breaker_timeout_secs: Option<u64>,

    #[clap(long, env = "FUSION_RATE_LIMIT_MAX_REQUESTS", help = "Messages admitted per device per window.")]
    pub rate_limit_max_requests: Option<usize>,

    #[clap(long, env = "FUSION_RATE_LIMIT_WINDOW_SECS", help = "Rate limit window in seconds.")]
    pub rate_limit_window_secs: Option<u64>,

    #[clap(long, env = "FUSION_ADAPTIVE_LOAD_THRESHOLD", help = "Load fraction above which the rate limit shrinks. Disabled when unset.")]
    pub adaptive_load_threshold: Option<f64>,

    #[clap(long, env = "FUSION_MAX_CONNECTIONS", help = "Websocket connections counted as full load.")]
    pub max_connections: Option<usize>,

    #[clap(long, env = "FUSION_DRAIN_TIMEOUT_SECS", help = "Seconds to wait for connections to finish on shutdown.")]
    pub drain_timeout_secs: Option<u64>,

    #[clap(long, env = "FUSION_POLL_INTERVAL_MS", help = "Milliseconds between drain checks on shutdown.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "FUSION_CLEANUP_TIMEOUT_SECS", help = "Seconds allowed for each cleanup task on shutdown.")]
    pub cleanup_timeout_secs: Option<u64>,

    #[clap(long, env = "FUSION_QUEUE_CAPACITY", help = "Outbound frames buffered per dashboard.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "FUSION_SEND_TIMEOUT_MS", help = "Milliseconds a dashboard may stall before it is dropped.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            redis_url: other.redis_url.or(self.redis_url),
            breaker_failure_threshold: other.breaker_failure_threshold.or(self.breaker_failure_threshold),
            breaker_success_threshold: other.breaker_success_threshold.or(self.breaker_success_threshold),
            breaker_timeout_secs: other.breaker_timeout_secs.or(self.breaker_timeout_secs),
            rate_limit_max_requests: other.rate_limit_max_requests.or(self.rate_limit_max_requests),
            rate_limit_window_secs: other.rate_limit_window_secs.or(self.rate_limit_window_secs),
            adaptive_load_threshold: other.adaptive_load_threshold.or(self.adaptive_load_threshold),
            max_connections: other.max_connections.or(self.max_connections),
            drain_timeout_secs: other.drain_timeout_secs.or(self.drain_timeout_secs),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            cleanup_timeout_secs: other.cleanup_timeout_secs.or(self.cleanup_timeout_secs),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            breaker_failure_threshold: Some(5),
            breaker_success_threshold: Some(2),
            breaker_timeout_secs: Some(60),
            rate_limit_max_requests: Some(100),
            rate_limit_window_secs: Some(60),
            max_connections: Some(10_000),
            drain_timeout_secs: Some(30),
            poll_interval_ms: Some(1_000),
            cleanup_timeout_secs: Some(10),
            queue_capacity: Some(256),
            send_timeout_ms: Some(2_000),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(ConfigError::Invalid(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }
        if let Some(t) = self.adaptive_load_threshold {
            if !(0.0..1.0).contains(&t) {
                return Err(ConfigError::Invalid(format!(
                    "adaptive_load_threshold {} must be in [0, 1)",
                    t
                )));
            }
        }
        if self.rate_limit_max_requests == Some(0) {
            return Err(ConfigError::Invalid("rate_limit_max_requests must be positive".to_string()));
        }
        if self.breaker_failure_threshold == Some(0) || self.breaker_success_threshold == Some(0) {
            return Err(ConfigError::Invalid("breaker thresholds must be positive".to_string()));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(10_000).max(1)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.unwrap_or(60))
    }

    /// Both TLS paths, when TLS is configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Tuning for the library services.
    pub fn services_config(&self) -> ServicesConfig {
        ServicesConfig {
            breaker: CircuitBreakerConfig {
                name: "sample_store".to_string(),
                failure_threshold: self.breaker_failure_threshold.unwrap_or(5),
                success_threshold: self.breaker_success_threshold.unwrap_or(2),
                timeout: Duration::from_secs(self.breaker_timeout_secs.unwrap_or(60)),
            },
            rate_limit: RateLimiterConfig {
                max_requests: self.rate_limit_max_requests.unwrap_or(100),
                window: self.rate_limit_window(),
                adaptive: self
                    .adaptive_load_threshold
                    .map(|load_threshold| AdaptiveLimit { load_threshold }),
            },
            broadcaster: BroadcasterConfig {
                queue_capacity: self.queue_capacity.unwrap_or(256),
                send_timeout: Duration::from_millis(self.send_timeout_ms.unwrap_or(2_000)),
            },
            shutdown: ShutdownConfig {
                drain_timeout: Duration::from_secs(self.drain_timeout_secs.unwrap_or(30)),
                poll_interval: Duration::from_millis(self.poll_interval_ms.unwrap_or(1_000)),
                cleanup_timeout: Duration::from_secs(self.cleanup_timeout_secs.unwrap_or(10)),
            },
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Loads the process configuration. `--help`, `--version` and bad flags exit
/// here the way clap normally does.
pub fn load_config() -> Result<Config, ConfigError> {
    match load_config_from(std::env::args_os()) {
        Err(ConfigError::Cli(e)) => e.exit(),
        other => other,
    }
}

/// Parses the command line and environment, then layers it over the config
/// file and the defaults.
pub fn load_config_from<I, T>(args: I) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    // CLI args include env vars; parsed once and merged last.
    let cli = Config::try_parse_from(args)?;
    resolve(cli, Path::new(DEFAULT_CONFIG_FILE), dirs::home_dir().as_deref())
}

/// # Resolve
///
/// ## Logic:
/// 1.  Starts from the built-in defaults.
/// 2.  Merges the JSON config file over them. The file at `default_file` is
///     optional; a path given in `cli` must exist.
/// 3.  Merges `cli` over the result.
/// 4.  Falls back to `<home>/.letsencrypt` certificates when TLS is not
///     configured and those files exist.
fn resolve(cli: Config, default_file: &Path, home: Option<&Path>) -> Result<Config, ConfigError> {
    let mut current = Config::defaults();

    let explicit_path = cli.config_path.clone();
    let path = explicit_path
        .clone()
        .unwrap_or_else(|| default_file.to_path_buf());

    if path.exists() {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let file_config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        current = current.merge(file_config);
    } else if explicit_path.is_some() {
        return Err(ConfigError::Read {
            path,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
        });
    }

    current = current.merge(cli);

    if current.tls_cert_path.is_none() && current.tls_key_path.is_none() {
        if let Some(home_dir) = home {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            let cert = letsencrypt_dir.join("fullchain.pem");
            let key = letsencrypt_dir.join("privkey.pem");
            if cert.exists() && key.exists() {
                current.tls_cert_path = Some(cert);
                current.tls_key_path = Some(key);
            }
        }
    }

    current.validate()?;
    Ok(current)
}
