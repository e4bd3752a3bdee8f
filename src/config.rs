//! Runtime configuration.
//!
//! Mirrors `retina-core::config`'s approach of a single structured document with
//! `#[serde(default = "fn")]` fallbacks for every optional field, but reads YAML
//! (the format the original prototype's `main.py` used via `yaml.safe_load`) instead of
//! TOML, and defines the IPS's own schema instead of DPDK EAL options.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::matcher::{Action, Protocol, RuleKind};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file as YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule set has a duplicate id: {0}")]
    DuplicateRuleId(u32),
}

/// Loads and validates a configuration document from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IpsConfig, ConfigError> {
    let path_ref = path.as_ref();
    let raw = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.display().to_string(),
        source,
    })?;
    let config: IpsConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Top-level runtime configuration, consumed from a YAML document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpsConfig {
    /// Number of queue workers to start. Defaults to `4`.
    #[serde(default = "default_queues")]
    pub queues: u32,

    /// Maximum bytes retained per flow buffer. Defaults to `65536`.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Trailing window of a flow buffer submitted to the matcher. Defaults to `8192`.
    #[serde(default = "default_max_scan_window")]
    pub max_scan_window: usize,

    /// Seconds of inactivity before a flow is eligible for pruning. Defaults to `60`.
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout_secs: u64,

    /// Seconds between alert buffer flushes. Defaults to `60`.
    #[serde(default = "default_log_flush_interval")]
    pub log_flush_interval_secs: u64,

    /// Gate the ICMP "drop if payload != 60 bytes" anti-abuse heuristic.
    /// Defaults to `true`, matching the original prototype's unconditional behavior.
    #[serde(default = "default_icmp_size_check")]
    pub icmp_size_check: bool,

    /// Stats/health HTTP endpoint settings.
    #[serde(default)]
    pub http_metrics: HttpMetricsConfig,

    /// Rule set applied by every worker's matcher.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl IpsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id) {
                return Err(ConfigError::DuplicateRuleId(rule.id));
            }
        }
        Ok(())
    }
}

impl Default for IpsConfig {
    fn default() -> Self {
        IpsConfig {
            queues: default_queues(),
            max_buffer_size: default_max_buffer_size(),
            max_scan_window: default_max_scan_window(),
            flow_timeout_secs: default_flow_timeout(),
            log_flush_interval_secs: default_log_flush_interval(),
            icmp_size_check: default_icmp_size_check(),
            http_metrics: HttpMetricsConfig::default(),
            rules: Vec::new(),
        }
    }
}

fn default_queues() -> u32 {
    4
}

fn default_max_buffer_size() -> usize {
    65536
}

fn default_max_scan_window() -> usize {
    8192
}

fn default_flow_timeout() -> u64 {
    60
}

fn default_log_flush_interval() -> u64 {
    60
}

fn default_icmp_size_check() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpMetricsConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpMetricsConfig {
    fn default() -> Self {
        HttpMetricsConfig {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

/// One rule entry as it appears in the configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub pattern: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub action: Action,
}
