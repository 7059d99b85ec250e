//! Operator configuration.
//!
//! All settings come from environment variables. Parsing is done through a
//! lookup function so tests can feed a map instead of the process env.

use crate::error::ControllerError;
use ipnetwork::IpNetwork;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_IP_POOLS: &str = "vpc-private=10.0.0.0/16;external=192.168.0.0/16;private-tgw=172.16.0.0/16";

/// An allocator pool and the CIDR blocks it hands out from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub blocks: Vec<IpNetwork>,
}

/// Runtime configuration of the operator
#[derive(Debug, Clone)]
pub struct Config {
    pub nsx_manager_url: String,
    pub nsx_username: String,
    pub nsx_password: String,
    pub nsx_insecure: bool,
    pub nsx_project: String,
    pub cluster_name: String,
    pub worker_concurrency: u16,
    pub gc_interval: Duration,
    pub realize_interval: Duration,
    pub realize_timeout: Duration,
    pub reconcile_timeout: Duration,
    pub default_network_namespace: String,
    pub webhook_addr: SocketAddr,
    pub webhook_cert_dir: Option<PathBuf>,
    pub metrics_addr: SocketAddr,
    pub ip_pools: Vec<PoolConfig>,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let nsx_password = lookup("NSX_PASSWORD").ok_or_else(|| {
            ControllerError::InvalidConfig("NSX_PASSWORD environment variable is required".to_string())
        })?;

        let ip_pools = parse_pools(&lookup("IP_POOLS").unwrap_or_else(|| DEFAULT_IP_POOLS.to_string()))?;

        Ok(Self {
            nsx_manager_url: lookup("NSX_MANAGER_URL").unwrap_or_else(|| "https://nsx-manager:443".to_string()),
            nsx_username: lookup("NSX_USERNAME").unwrap_or_else(|| "admin".to_string()),
            nsx_password,
            nsx_insecure: parse_var(&lookup, "NSX_INSECURE", false)?,
            nsx_project: lookup("NSX_PROJECT").unwrap_or_else(|| "default".to_string()),
            cluster_name: lookup("CLUSTER_NAME").unwrap_or_else(|| "cluster".to_string()),
            worker_concurrency: parse_nonzero(&lookup, "WORKER_CONCURRENCY", 8)?,
            gc_interval: Duration::from_secs(parse_nonzero(&lookup, "GC_INTERVAL_SECS", 600)?),
            realize_interval: Duration::from_millis(parse_nonzero(&lookup, "REALIZE_INTERVAL_MS", 500)?),
            realize_timeout: Duration::from_secs(parse_nonzero(&lookup, "REALIZE_TIMEOUT_SECS", 30)?),
            reconcile_timeout: Duration::from_secs(parse_nonzero(&lookup, "RECONCILE_TIMEOUT_SECS", 120)?),
            default_network_namespace: lookup("DEFAULT_NETWORK_NAMESPACE")
                .unwrap_or_else(|| "kube-system".to_string()),
            webhook_addr: parse_var(&lookup, "WEBHOOK_ADDR", SocketAddr::from(([0, 0, 0, 0], 9443)))?,
            webhook_cert_dir: lookup("WEBHOOK_CERT_DIR").filter(|d| !d.is_empty()).map(PathBuf::from),
            metrics_addr: parse_var(&lookup, "METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 8093)))?,
            ip_pools,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{}={}: {}", key, raw, e))),
    }
}

// Counts and intervals, which must be non-zero
fn parse_nonzero<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let value = parse_var(lookup, key, default)?;
    if value == T::default() {
        return Err(ControllerError::InvalidConfig(format!("{} must be greater than zero", key)));
    }
    Ok(value)
}

/// Parse `name=cidr[,cidr];name=cidr` pool definitions
pub fn parse_pools(raw: &str) -> Result<Vec<PoolConfig>, ControllerError> {
    let mut pools: Vec<PoolConfig> = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, cidrs) = entry
            .split_once('=')
            .ok_or_else(|| ControllerError::InvalidConfig(format!("IP_POOLS entry '{}' is missing '='", entry)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ControllerError::InvalidConfig(format!("IP_POOLS entry '{}' has no pool name", entry)));
        }
        if pools.iter().any(|p| p.name == name) {
            return Err(ControllerError::InvalidConfig(format!("IP_POOLS defines pool '{}' twice", name)));
        }

        let mut blocks = Vec::new();
        for cidr in cidrs.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let block: IpNetwork = cidr
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("IP_POOLS pool '{}': {}: {}", name, cidr, e)))?;
            blocks.push(block);
        }
        if blocks.is_empty() {
            return Err(ControllerError::InvalidConfig(format!("IP_POOLS pool '{}' has no CIDR blocks", name)));
        }

        pools.push(PoolConfig {
            name: name.to_string(),
            blocks,
        });
    }
    Ok(pools)
}
