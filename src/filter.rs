//! Per-request admission filters.
//!
//! Filters run in order before any resolution happens; the first denial
//! ends the request with `400 bad request`.

use crate::config::FilterConfig;
use crate::error::{ProxyError, Result};
use http::{Method, Uri};
use regex::Regex;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tracing::warn;

/// What a filter gets to see of a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Routing host, port stripped.
    pub host: &'a str,
    /// Peer address of the inbound connection.
    pub remote_addr: SocketAddr,
    pub method: &'a Method,
    pub uri: &'a Uri,
}

/// An admission check.
pub trait Filter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns `ProxyError::FilterDenied` to reject the request.
    fn check(&self, request: &RequestInfo<'_>) -> Result<()>;
}

/// Only lets through requests whose host matches a pattern.
#[derive(Debug)]
pub struct HostAllowFilter {
    allowed_hosts: Regex,
}

impl HostAllowFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(ProxyError::config_validation("no allowed hosts specified"));
        }

        if pattern == ".*" {
            warn!("allowing all hosts, this is insecure!");
        }

        let allowed_hosts = Regex::new(pattern).map_err(|e| {
            ProxyError::config_validation(format!("failed to compile allowed hosts regex: {}", e))
        })?;

        Ok(Self { allowed_hosts })
    }
}

impl Filter for HostAllowFilter {
    fn name(&self) -> &'static str {
        "allowed_host"
    }

    fn check(&self, request: &RequestInfo<'_>) -> Result<()> {
        if self.allowed_hosts.is_match(request.host) {
            return Ok(());
        }

        warn!(
            host = %request.host,
            method = %request.method,
            url = %request.uri,
            "host not allowed"
        );
        Err(ProxyError::filter_denied(format!(
            "host {} not allowed",
            request.host
        )))
    }
}

/// Restricts matching hosts to callers from a set of networks.
#[derive(Debug)]
pub struct SourceIpFilter {
    hosts: Regex,
    allowed: Vec<CidrRange>,
}

impl SourceIpFilter {
    pub fn new<S: AsRef<str>>(host_pattern: &str, cidrs: &[S]) -> Result<Self> {
        if host_pattern.is_empty() {
            return Err(ProxyError::config_validation(
                "no source ip filter hosts specified",
            ));
        }

        let hosts = Regex::new(host_pattern).map_err(|e| {
            ProxyError::config_validation(format!(
                "failed to compile ip source filter hosts regex: {}",
                e
            ))
        })?;

        if cidrs.is_empty() {
            return Err(ProxyError::config_validation(format!(
                "no cidrs specified for source ip filter {}",
                host_pattern
            )));
        }

        let allowed = cidrs
            .iter()
            .map(|cidr| cidr.as_ref().trim().parse())
            .collect::<Result<Vec<CidrRange>>>()?;

        Ok(Self { hosts, allowed })
    }
}

impl Filter for SourceIpFilter {
    fn name(&self) -> &'static str {
        "source_ip"
    }

    fn check(&self, request: &RequestInfo<'_>) -> Result<()> {
        if !self.hosts.is_match(request.host) {
            return Ok(());
        }

        let remote_ip = request.remote_addr.ip().to_canonical();
        if self.allowed.iter().any(|range| range.contains(remote_ip)) {
            return Ok(());
        }

        warn!(
            host = %request.host,
            method = %request.method,
            url = %request.uri,
            remote = %request.remote_addr,
            "remote not allowed"
        );
        Err(ProxyError::filter_denied(format!(
            "remote {} not allowed for {}",
            remote_ip, request.host
        )))
    }
}

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Whether `ip` lies in this network. Address families never mix.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => mask_v4(ip, self.prefix_len) == network,
            (IpAddr::V6(network), IpAddr::V6(ip)) => mask_v6(ip, self.prefix_len) == network,
            _ => false,
        }
    }
}

impl FromStr for CidrRange {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProxyError::config_validation(format!("invalid CIDR address: {}", s));

        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;

        let network = match addr {
            IpAddr::V4(v4) if prefix_len <= 32 => IpAddr::V4(mask_v4(v4, prefix_len)),
            IpAddr::V6(v6) if prefix_len <= 128 => IpAddr::V6(mask_v6(v6, prefix_len)),
            _ => return Err(invalid()),
        };

        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn mask_v4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
    Ipv4Addr::from(u32::from(addr) & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
    Ipv6Addr::from(u128::from(addr) & mask)
}

/// Builds the filter chain: the allowed-host filter first, then one
/// source-IP filter per rule, in configuration order.
pub fn build_filters(config: &FilterConfig) -> Result<Vec<Box<dyn Filter>>> {
    let mut filters: Vec<Box<dyn Filter>> =
        vec![Box::new(HostAllowFilter::new(&config.allowed_hosts)?)];

    for rule in &config.source_ip {
        filters.push(Box::new(SourceIpFilter::new(&rule.hosts, rule.cidrs.as_slice())?));
    }

    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceIpRule;

    fn check(filter: &dyn Filter, host: &str, remote: &str) -> Result<()> {
        let method = Method::GET;
        let uri: Uri = "/index.html".parse().unwrap();
        filter.check(&RequestInfo {
            host,
            remote_addr: remote.parse().unwrap(),
            method: &method,
            uri: &uri,
        })
    }

    #[test]
    fn test_host_allow_filter() {
        let filter = HostAllowFilter::new(".*example\\.com").unwrap();

        assert!(check(&filter, "sub.example.com", "192.0.2.1:5000").is_ok());
        assert!(matches!(
            check(&filter, "evil.com", "192.0.2.1:5000"),
            Err(ProxyError::FilterDenied { .. })
        ));
    }

    #[test]
    fn test_host_allow_filter_rejects_bad_patterns() {
        assert!(matches!(
            HostAllowFilter::new(""),
            Err(ProxyError::ConfigValidation { .. })
        ));
        assert!(matches!(
            HostAllowFilter::new("(unclosed"),
            Err(ProxyError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn test_host_allow_everything() {
        let filter = HostAllowFilter::new(".*").unwrap();
        assert!(check(&filter, "anything.at.all", "192.0.2.1:5000").is_ok());
    }

    #[test]
    fn test_source_ip_filter() {
        let filter = SourceIpFilter::new("admin\\.example\\.com", &["10.0.0.0/8"]).unwrap();

        assert!(check(&filter, "admin.example.com", "10.1.2.3:40000").is_ok());
        assert!(matches!(
            check(&filter, "admin.example.com", "203.0.113.5:40000"),
            Err(ProxyError::FilterDenied { .. })
        ));
        assert!(check(&filter, "other.example.com", "203.0.113.5:40000").is_ok());
    }

    #[test]
    fn test_source_ip_filter_mapped_ipv4_remote() {
        let filter = SourceIpFilter::new("admin\\.example\\.com", &["10.0.0.0/8"]).unwrap();
        assert!(check(&filter, "admin.example.com", "[::ffff:10.1.2.3]:40000").is_ok());
        assert!(check(&filter, "admin.example.com", "[::ffff:203.0.113.5]:40000").is_err());
    }

    #[test]
    fn test_source_ip_filter_multiple_ranges() {
        let filter =
            SourceIpFilter::new("admin\\.", &["10.0.0.0/8", "2001:db8::/32"]).unwrap();
        assert!(check(&filter, "admin.example.com", "[2001:db8::5]:443").is_ok());
        assert!(check(&filter, "admin.example.com", "[2001:db9::5]:443").is_err());
    }

    #[test]
    fn test_source_ip_filter_rejects_bad_config() {
        assert!(SourceIpFilter::new("", &["10.0.0.0/8"]).is_err());
        assert!(SourceIpFilter::new("(", &["10.0.0.0/8"]).is_err());
        assert!(SourceIpFilter::new("admin", &["10.0.0.0"]).is_err());
        assert!(SourceIpFilter::new("admin", &["10.0.0.0/33"]).is_err());
        assert!(SourceIpFilter::new::<&str>("admin", &[]).is_err());
    }

    #[test]
    fn test_cidr_parsing_and_masking() {
        let range: CidrRange = "10.1.2.3/8".parse().unwrap();
        assert_eq!(range.to_string(), "10.0.0.0/8");
        assert!(range.contains("10.255.0.1".parse().unwrap()));
        assert!(!range.contains("11.0.0.1".parse().unwrap()));
        assert!(!range.contains("::1".parse().unwrap()));

        let all: CidrRange = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("203.0.113.5".parse().unwrap()));

        let host: CidrRange = "2001:db8::1/128".parse().unwrap();
        assert!(host.contains("2001:db8::1".parse().unwrap()));
        assert!(!host.contains("2001:db8::2".parse().unwrap()));
    }

    #[test]
    fn test_build_filters_order() {
        let config = FilterConfig {
            allowed_hosts: ".*example\\.com".to_string(),
            source_ip: vec![SourceIpRule {
                hosts: "admin\\.example\\.com".to_string(),
                cidrs: vec!["10.0.0.0/8".to_string()],
            }],
        };

        let filters = build_filters(&config).unwrap();
        let names: Vec<_> = filters.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["allowed_host", "source_ip"]);
    }

    #[test]
    fn test_build_filters_invalid_cidr() {
        let config = FilterConfig {
            allowed_hosts: ".*".to_string(),
            source_ip: vec![SourceIpRule {
                hosts: "admin".to_string(),
                cidrs: vec!["not-a-cidr".to_string()],
            }],
        };
        assert!(build_filters(&config).is_err());
    }
}
