use std::fmt;
use std::path::PathBuf;

use crate::engine::EndpointOrder;

/// Server settings, read once at startup from `LENDTRACK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub endpoint_order: EndpointOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "lendtrack".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            endpoint_order: EndpointOrder::Strict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset keys take their default;
    /// set but unparseable keys are an error rather than silently ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        Ok(Self {
            port: parsed(&lookup, "LENDTRACK_PORT")?.unwrap_or(defaults.port),
            bind: text("LENDTRACK_BIND").unwrap_or(defaults.bind),
            data_dir: text("LENDTRACK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: text("LENDTRACK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "LENDTRACK_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "LENDTRACK_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            tls_cert: text("LENDTRACK_TLS_CERT"),
            tls_key: text("LENDTRACK_TLS_KEY"),
            metrics_port: parsed(&lookup, "LENDTRACK_METRICS_PORT")?,
            endpoint_order: parsed(&lookup, "LENDTRACK_ENDPOINT_ORDER")?
                .unwrap_or(defaults.endpoint_order),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("lendtrack.wal")
    }
}

fn parsed<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value: raw }),
    }
}
