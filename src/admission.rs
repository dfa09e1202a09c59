//! Allow-list gating which backend hosts may be registered
//!
//! Evaluation order: exact IP literals, then CIDR networks, then exact
//! hostnames. An empty list admits nothing through that list.

use crate::config::AllowConfig;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Invalid allow-list entry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllowListError {
    #[error("invalid ip: {0}")]
    InvalidIp(String),
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
}

/// An IP network in `addr/prefix` form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    network: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `ip` falls inside this network; families never mix
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = mask_v4(self.prefix_len);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = mask_v6(self.prefix_len);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = AllowListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AllowListError::InvalidNetwork(s.to_string());

        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.trim().parse().map_err(|_| invalid())?;

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(invalid());
        }

        let network = match addr {
            IpAddr::V4(v4) => IpAddr::from((u32::from(v4) & mask_v4(prefix_len)).to_be_bytes()),
            IpAddr::V6(v6) => IpAddr::from((u128::from(v6) & mask_v6(prefix_len)).to_be_bytes()),
        };

        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn mask_v4(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

fn mask_v6(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - p),
    }
}

/// Immutable allow-list built once at startup
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    ips: Vec<IpAddr>,
    networks: Vec<IpNetwork>,
    hosts: Vec<String>,
}

impl AdmissionPolicy {
    pub fn new(ips: Vec<IpAddr>, networks: Vec<IpNetwork>, hosts: Vec<String>) -> Self {
        Self {
            ips,
            networks,
            hosts,
        }
    }

    /// Build the policy from the `[allow]` configuration section
    pub fn from_config(config: &AllowConfig) -> Result<Self, AllowListError> {
        let ips = config
            .ips
            .iter()
            .map(|ip| {
                ip.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| AllowListError::InvalidIp(ip.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let networks = config
            .networks
            .iter()
            .map(|net| net.parse::<IpNetwork>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(ips, networks, config.hosts.clone()))
    }

    /// Whether a backend host (IP literal or hostname) may be registered
    pub fn is_allowed(&self, host: &str) -> bool {
        let ip = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .parse::<IpAddr>()
            .ok();

        if let Some(ip) = ip {
            if self.ips.contains(&ip) {
                return true;
            }
            if self.networks.iter().any(|net| net.contains(ip)) {
                return true;
            }
        }

        self.hosts.iter().any(|allowed| allowed == host)
    }
}
