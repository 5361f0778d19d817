use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process settings, read once from `ENVBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub tokens_file: Option<PathBuf>,
    pub environments_file: Option<PathBuf>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub const WAL_FILE_NAME: &'static str = "envbook.wal";

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind: IpAddr = parse_or(&lookup, "ENVBOOK_BIND", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = parse_or(&lookup, "ENVBOOK_PORT", 51111)?;
        Ok(Self {
            bind_addr: SocketAddr::new(bind, port),
            data_dir: lookup("ENVBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            tokens_file: lookup("ENVBOOK_TOKENS_FILE").map(PathBuf::from),
            environments_file: lookup("ENVBOOK_ENVIRONMENTS_FILE").map(PathBuf::from),
            max_connections: parse_or(&lookup, "ENVBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "ENVBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("ENVBOOK_METRICS_PORT")
                .map(|v| parse_value("ENVBOOK_METRICS_PORT", v))
                .transpose()?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(Self::WAL_FILE_NAME)
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => parse_value(key, value),
        None => Ok(default),
    }
}
