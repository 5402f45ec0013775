//! Configuration for the v4v6-proxy application.
//!
//! Configuration is read once at startup from an optional YAML file and
//! then overridden by command line flags / environment variables (see
//! `main.rs`). Nothing here is reloaded at runtime.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Listener configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Port of the plain HTTP listener.
    pub http_port: u16,

    /// Port of the TLS listener.
    pub https_port: u16,

    /// Time allowed for a client to send the request headers, in seconds.
    pub header_read_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            header_read_timeout: 3,
        }
    }
}

impl ServerConfig {
    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout)
    }
}

/// Certificate directory layout: `<dir>/<bundle>/<cert_file_name>` and
/// `<dir>/<bundle>/<key_file_name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CertificatesConfig {
    /// Directory holding one subdirectory per certificate bundle.
    pub dir: PathBuf,

    /// PEM certificate chain file name inside each bundle.
    pub cert_file_name: String,

    /// PEM private key file name inside each bundle.
    pub key_file_name: String,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/letsencrypt/live/"),
            cert_file_name: "fullchain.pem".to_string(),
            key_file_name: "privkey.pem".to_string(),
        }
    }
}

/// Restricts a set of hosts to callers from the given networks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceIpRule {
    /// Regex selecting the hosts this rule applies to.
    pub hosts: String,

    /// Networks allowed to reach those hosts, in CIDR notation.
    pub cidrs: Vec<String>,
}

impl SourceIpRule {
    /// Pairs repeated `--source-ip-filter-hosts` / `--source-ip-filter-cidrs`
    /// flags. Each CIDR flag value is a comma-separated list.
    pub fn from_flags(hosts: &[String], cidrs: &[String]) -> Result<Vec<SourceIpRule>> {
        if hosts.len() != cidrs.len() {
            return Err(ProxyError::config_validation(format!(
                "must provide the same number of source IP filter hosts ({}) and cidr lists ({})",
                hosts.len(),
                cidrs.len()
            )));
        }

        Ok(hosts
            .iter()
            .zip(cidrs)
            .map(|(hosts, cidrs)| SourceIpRule {
                hosts: hosts.clone(),
                cidrs: cidrs
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
            })
            .collect())
    }
}

/// Request filter configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Regex every request host must match.
    pub allowed_hosts: String,

    /// Source IP restrictions, evaluated after the allowed-host check.
    pub source_ip: Vec<SourceIpRule>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: ".*".to_string(),
            source_ip: Vec::new(),
        }
    }
}

/// DNS resolution configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsConfig {
    /// Cache resolved AAAA records.
    pub cache: bool,

    /// Age in seconds after which a cached entry may be dropped, provided
    /// the host no longer resolves.
    pub cache_ttl: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache: true,
            cache_ttl: 60,
        }
    }
}

impl DnsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}

/// Outbound connection configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Idle connections kept per backend host.
    pub max_idle_per_host: usize,

    /// Offer HTTP/2 via ALPN on TLS backend connections.
    pub http2: bool,

    /// Backend port for requests that arrived over plain HTTP.
    pub backend_http_port: u16,

    /// Backend port for requests that arrived over TLS.
    pub backend_https_port: u16,

    /// PEM files with additional trusted root certificates.
    pub extra_root_certificates: Vec<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 16,
            http2: false,
            backend_http_port: 80,
            backend_https_port: 443,
            extra_root_certificates: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include timestamps in logs.
    pub timestamps: bool,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            include_target: true,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub certificates: CertificatesConfig,
    pub filters: FilterConfig,
    pub dns: DnsConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Regex and CIDR syntax is checked when the filters are built.
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 || self.server.https_port == 0 {
            return Err(ProxyError::config_validation(
                "Listener ports must be non-zero",
            ));
        }

        if self.certificates.cert_file_name.is_empty() || self.certificates.key_file_name.is_empty()
        {
            return Err(ProxyError::config_validation(
                "Certificate and key file names cannot be empty",
            ));
        }

        if self.filters.allowed_hosts.is_empty() {
            return Err(ProxyError::config_validation("no allowed hosts specified"));
        }

        for rule in &self.filters.source_ip {
            if rule.hosts.is_empty() {
                return Err(ProxyError::config_validation(
                    "Source IP filter host pattern cannot be empty",
                ));
            }
            if rule.cidrs.is_empty() {
                return Err(ProxyError::config_validation(format!(
                    "Source IP filter for {} has no CIDRs",
                    rule.hosts
                )));
            }
        }

        if self.transport.backend_http_port == 0 || self.transport.backend_https_port == 0 {
            return Err(ProxyError::config_validation(
                "Backend ports must be non-zero",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Every configuration field with its effective value, in a fixed order.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let source_ip = self
            .filters
            .source_ip
            .iter()
            .map(|rule| format!("{} => [{}]", rule.hosts, rule.cidrs.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");

        vec![
            ("http_port", self.server.http_port.to_string()),
            ("https_port", self.server.https_port.to_string()),
            (
                "header_read_timeout",
                format!("{}s", self.server.header_read_timeout),
            ),
            ("cert_dir", self.certificates.dir.display().to_string()),
            ("cert_file_name", self.certificates.cert_file_name.clone()),
            ("key_file_name", self.certificates.key_file_name.clone()),
            ("allowed_hosts", self.filters.allowed_hosts.clone()),
            ("source_ip_filters", source_ip),
            ("dns_cache", self.dns.cache.to_string()),
            ("dns_cache_ttl", format!("{}s", self.dns.cache_ttl)),
            (
                "max_idle_per_host",
                self.transport.max_idle_per_host.to_string(),
            ),
            ("http2", self.transport.http2.to_string()),
            (
                "backend_http_port",
                self.transport.backend_http_port.to_string(),
            ),
            (
                "backend_https_port",
                self.transport.backend_https_port.to_string(),
            ),
            (
                "extra_root_certificates",
                self.transport
                    .extra_root_certificates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            ("log_level", self.logging.level.clone()),
            ("log_output", self.logging.output.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(
            config.certificates.dir,
            PathBuf::from("/etc/letsencrypt/live/")
        );
        assert_eq!(config.certificates.cert_file_name, "fullchain.pem");
        assert_eq!(config.certificates.key_file_name, "privkey.pem");
        assert_eq!(config.filters.allowed_hosts, ".*");
        assert!(config.dns.cache);
        assert_eq!(config.dns.cache_ttl(), Duration::from_secs(60));
        assert!(!config.transport.http2);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let yaml = r#"
server:
  http_port: 8080
  https_port: 8443
certificates:
  dir: "/tmp/certs"
filters:
  allowed_hosts: ".*\\.example\\.com"
  source_ip:
    - hosts: "admin\\.example\\.com"
      cidrs: ["10.0.0.0/8"]
dns:
  cache: false
  cache_ttl: 120
transport:
  http2: true
logging:
  level: "debug"
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port, 8443);
        assert_eq!(config.server.header_read_timeout, 3);
        assert_eq!(config.certificates.dir, PathBuf::from("/tmp/certs"));
        assert_eq!(config.certificates.cert_file_name, "fullchain.pem");
        assert_eq!(config.filters.allowed_hosts, ".*\\.example\\.com");
        assert_eq!(config.filters.source_ip.len(), 1);
        assert_eq!(config.filters.source_ip[0].cidrs, vec!["10.0.0.0/8"]);
        assert!(!config.dns.cache);
        assert_eq!(config.dns.cache_ttl, 120);
        assert!(config.transport.http2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file() {
        let result = AppConfig::load("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ProxyError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_invalid_yaml() {
        let file = create_temp_config("server: [not, a, map");
        let result = AppConfig::load(file.path());
        assert!(matches!(result, Err(ProxyError::ConfigParse { .. })));
    }

    #[test]
    fn test_empty_allowed_hosts() {
        let yaml = r#"
filters:
  allowed_hosts: ""
"#;
        let file = create_temp_config(yaml);
        let result = AppConfig::load(file.path());
        assert!(matches!(result, Err(ProxyError::ConfigValidation { .. })));
    }

    #[test]
    fn test_invalid_log_level() {
        let yaml = r#"
logging:
  level: "invalid"
"#;
        let file = create_temp_config(yaml);
        let result = AppConfig::load(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_source_ip_rule_without_cidrs() {
        let yaml = r#"
filters:
  source_ip:
    - hosts: "admin\\.example\\.com"
      cidrs: []
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_source_ip_rules_from_flags() {
        let hosts = vec!["admin\\.example\\.com".to_string(), "db\\..*".to_string()];
        let cidrs = vec![
            "10.0.0.0/8, 192.168.0.0/16".to_string(),
            "172.16.0.0/12".to_string(),
        ];

        let rules = SourceIpRule::from_flags(&hosts, &cidrs).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].cidrs, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(rules[1].hosts, "db\\..*");
        assert_eq!(rules[1].cidrs, vec!["172.16.0.0/12"]);
    }

    #[test]
    fn test_source_ip_rules_count_mismatch() {
        let hosts = vec!["admin\\.example\\.com".to_string()];
        let result = SourceIpRule::from_flags(&hosts, &[]);
        assert!(matches!(result, Err(ProxyError::ConfigValidation { .. })));
    }

    #[test]
    fn test_summary_lists_every_field_once() {
        let summary = AppConfig::default().summary();
        let names: Vec<_> = summary.iter().map(|(name, _)| *name).collect();

        assert_eq!(names.first(), Some(&"http_port"));
        assert!(names.contains(&"allowed_hosts"));
        assert!(names.contains(&"dns_cache_ttl"));

        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), names.len());
    }
}
