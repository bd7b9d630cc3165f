//! Server configuration from `ROOMLEDGER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::engine::{DEFAULT_OCCUPANCY_SLOTS, EngineSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}: invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("both ROOMLEDGER_TLS_CERT and ROOMLEDGER_TLS_KEY must be set, or neither")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Lessons per room counted as 100% in the occupancy report.
    pub occupancy_slots: u32,
    /// Prometheus exporter port; `None` disables metrics export.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Load sample rooms and lessons into an empty ledger at startup.
    pub seed_demo: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let tls_cert = var("ROOMLEDGER_TLS_CERT");
        let tls_key = var("ROOMLEDGER_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let max_connections = parse_or(var("ROOMLEDGER_MAX_CONNECTIONS"), "ROOMLEDGER_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Zero("ROOMLEDGER_MAX_CONNECTIONS"));
        }
        let occupancy_slots = parse_or(
            var("ROOMLEDGER_OCCUPANCY_SLOTS"),
            "ROOMLEDGER_OCCUPANCY_SLOTS",
            DEFAULT_OCCUPANCY_SLOTS,
        )?;
        if occupancy_slots == 0 {
            return Err(ConfigError::Zero("ROOMLEDGER_OCCUPANCY_SLOTS"));
        }

        Ok(Self {
            bind: var("ROOMLEDGER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(var("ROOMLEDGER_PORT"), "ROOMLEDGER_PORT", 5433)?,
            data_dir: var("ROOMLEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            max_connections,
            compact_threshold: parse_or(var("ROOMLEDGER_COMPACT_THRESHOLD"), "ROOMLEDGER_COMPACT_THRESHOLD", 1000)?,
            occupancy_slots,
            metrics_port: var("ROOMLEDGER_METRICS_PORT")
                .map(|v| parse("ROOMLEDGER_METRICS_PORT", v))
                .transpose()?,
            tls_cert,
            tls_key,
            seed_demo: var("ROOMLEDGER_SEED_DEMO")
                .map(|v| parse_flag("ROOMLEDGER_SEED_DEMO", v))
                .transpose()?
                .unwrap_or(false),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomledger.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            occupancy_slots: self.occupancy_slots,
        }
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn parse_or<T: FromStr>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |v| parse(name, v))
}

fn parse_flag(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { name, value }),
    }
}
