use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tunnelgate", version, about = "Local TLS-sniffing forwarding proxy")]
pub struct Cli {
    #[arg(long, default_value = "proxy.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Load and validate configuration, then exit without binding any sockets.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    #[default]
    Failover,
    RoundRobin,
}

impl<'de> Deserialize<'de> for LoadBalancingStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "failover" => Ok(LoadBalancingStrategy::Failover),
            "roundrobin" => Ok(LoadBalancingStrategy::RoundRobin),
            other => Err(serde::de::Error::custom(format!(
                "unknown loadBalancingStrategy {other:?}, expected \"failover\" or \"roundRobin\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Socks5,
    Http,
    Direct,
}

impl<'de> Deserialize<'de> for UpstreamKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "socks5" => Ok(UpstreamKind::Socks5),
            "http" => Ok(UpstreamKind::Http),
            "direct" => Ok(UpstreamKind::Direct),
            other => Err(serde::de::Error::custom(format!(
                "unknown upstream type {other:?}, expected \"socks5\", \"http\" or \"direct\""
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_startup_delay_ms() -> u64 {
    1000
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    3000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    pub auto_start: bool,
    pub file_name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub working_directory: Option<String>,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_true")]
    pub redirect_output: bool,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            auto_start: false,
            file_name: String::new(),
            arguments: Vec::new(),
            working_directory: None,
            startup_delay_ms: default_startup_delay_ms(),
            redirect_output: true,
            auto_restart: true,
            max_restart_attempts: default_max_restart_attempts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: UpstreamKind,
    #[serde(default)]
    pub host: String,
    pub port: u16,
    pub process: Option<ProcessConfig>,
    pub health_check: Option<HealthCheckConfig>,
}

fn default_cert_file() -> String {
    "cert.pem".to_string()
}

fn default_key_file() -> String {
    "key.pem".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawProxyConfig {
    port: u16,
    use_https: bool,
    #[serde(default = "default_cert_file")]
    cert_file: String,
    #[serde(default = "default_key_file")]
    key_file: String,
    crl_port: u16,
    upstream: Option<Upstream>,
    upstreams: Vec<Upstream>,
    load_balancing_strategy: LoadBalancingStrategy,
}

impl Default for RawProxyConfig {
    fn default() -> Self {
        RawProxyConfig {
            port: 8080,
            use_https: false,
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            crl_port: 0,
            upstream: None,
            upstreams: Vec::new(),
            load_balancing_strategy: LoadBalancingStrategy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFile {
    proxy: RawProxyConfig,
}

/// Fully merged, ready-to-use proxy configuration.
///
/// `upstreams` already has the legacy single-`upstream` field folded in ahead
/// of the list, preserving declared order for `failover` / `roundRobin`.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub use_https: bool,
    pub cert_file: String,
    pub key_file: String,
    pub crl_port: Option<u16>,
    pub upstreams: Vec<Upstream>,
    pub load_balancing_strategy: LoadBalancingStrategy,
}

impl ProxyConfig {
    fn from_raw(raw: RawProxyConfig) -> Self {
        let mut upstreams = Vec::with_capacity(raw.upstreams.len() + 1);
        if let Some(legacy) = raw.upstream {
            upstreams.push(legacy);
        }
        upstreams.extend(raw.upstreams);

        ProxyConfig {
            port: raw.port,
            use_https: raw.use_https,
            cert_file: raw.cert_file,
            key_file: raw.key_file,
            crl_port: (raw.crl_port != 0).then_some(raw.crl_port),
            upstreams,
            load_balancing_strategy: raw.load_balancing_strategy,
        }
    }

    /// Only `enabled=true` entries ever participate in selection (I1).
    pub fn enabled_upstreams(&self) -> Vec<Upstream> {
        self.upstreams.iter().filter(|u| u.enabled).cloned().collect()
    }
}

pub fn load_config(path: &PathBuf) -> Result<ProxyConfig> {
    let yaml = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let raw: RawFile = serde_yaml::from_str(&yaml).with_context(|| format!("failed to parse YAML in {}", path.display()))?;
    Ok(ProxyConfig::from_raw(raw.proxy))
}

/// Expands `%NAME%` occurrences against the process environment, leaving
/// unmatched `%...%` sequences untouched.
pub fn expand_env_vars(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(end_rel) = input[i + 1..].find('%') {
                let name = &input[i + 1..i + 1 + end_rel];
                if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    if let Ok(value) = std::env::var(name) {
                        out.push_str(&value);
                        i = i + 1 + end_rel + 1;
                        continue;
                    }
                }
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}
