//! # v4v6-proxy
//!
//! Puts IPv6-only web servers in reach of IPv4 clients. Requests arriving
//! on the plain HTTP and HTTPS listeners are forwarded to the AAAA address
//! of the host they name; TLS is terminated locally using certificates
//! picked by SNI.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default config search path
//! v4v6-proxy
//!
//! # Run with custom config
//! v4v6-proxy -c /path/to/config.yaml
//!
//! # Only proxy example.com hosts, and keep admin.example.com internal
//! v4v6-proxy --allowed-hosts '.*\.example\.com$' \
//!     --source-ip-filter-hosts '^admin\.example\.com$' \
//!     --source-ip-filter-cidrs '10.0.0.0/8,192.168.0.0/16'
//!
//! # Increase verbosity
//! v4v6-proxy -vvvv  # trace level
//! ```

use clap::builder::BoolishValueParser;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use v4v6_proxy::config::{AppConfig, SourceIpRule};
use v4v6_proxy::error::Result;
use v4v6_proxy::logging;
use v4v6_proxy::resolver::{Lookup, SystemLookup};
use v4v6_proxy::server::{AppContext, ProxyServer};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "./config.yaml",
    "./config.yml",
    "/etc/v4v6-proxy/config.yaml",
];

/// Reverse proxy forwarding IPv4 traffic to IPv6-only backends.
#[derive(Parser, Debug)]
#[command(name = "v4v6-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,

    /// Plain HTTP listener port
    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// HTTPS listener port
    #[arg(long, env = "HTTPS_PORT")]
    https_port: Option<u16>,

    /// Directory holding one subdirectory per certificate bundle
    #[arg(long, env = "CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Certificate chain file name inside each bundle
    #[arg(long, env = "CERT_FILE_NAME")]
    cert_file_name: Option<String>,

    /// Private key file name inside each bundle
    #[arg(long, env = "KEY_FILE_NAME")]
    key_file_name: Option<String>,

    /// Regex of hosts the proxy serves
    #[arg(long, env = "ALLOWED_HOSTS")]
    allowed_hosts: Option<String>,

    /// Cache AAAA lookups
    #[arg(long, env = "CACHE_DNS", value_parser = BoolishValueParser::new())]
    cache_dns: Option<bool>,

    /// Seconds before a cached address is re-checked
    #[arg(long, env = "DNS_CACHE_TTL")]
    dns_cache_ttl: Option<u64>,

    /// Idle backend connections kept per host
    #[arg(long, env = "MAX_IDLE_PER_HOST")]
    max_idle_per_host: Option<usize>,

    /// Negotiate HTTP/2 with TLS backends
    #[arg(long)]
    http2: bool,

    /// Host regex of a source IP rule; pairs with --source-ip-filter-cidrs
    #[arg(long)]
    source_ip_filter_hosts: Vec<String>,

    /// Comma-separated CIDRs of a source IP rule
    #[arg(long)]
    source_ip_filter_cidrs: Vec<String>,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }

    /// Applies command line and environment overrides on top of `config`.
    fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(port) = self.https_port {
            config.server.https_port = port;
        }
        if let Some(dir) = &self.cert_dir {
            config.certificates.dir = dir.clone();
        }
        if let Some(name) = &self.cert_file_name {
            config.certificates.cert_file_name = name.clone();
        }
        if let Some(name) = &self.key_file_name {
            config.certificates.key_file_name = name.clone();
        }
        if let Some(pattern) = &self.allowed_hosts {
            config.filters.allowed_hosts = pattern.clone();
        }
        if let Some(cache) = self.cache_dns {
            config.dns.cache = cache;
        }
        if let Some(ttl) = self.dns_cache_ttl {
            config.dns.cache_ttl = ttl;
        }
        if let Some(max_idle) = self.max_idle_per_host {
            config.transport.max_idle_per_host = max_idle;
        }
        if self.http2 {
            config.transport.http2 = true;
        }
        if !self.source_ip_filter_hosts.is_empty() || !self.source_ip_filter_cidrs.is_empty() {
            config.filters.source_ip =
                SourceIpRule::from_flags(&self.source_ip_filter_hosts, &self.source_ip_filter_cidrs)?;
        }
        Ok(())
    }
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps())
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting v4v6-proxy");
    for (key, value) in config.summary() {
        info!(key = key, value = %value, "Configuration");
    }

    let lookup: Arc<dyn Lookup> = Arc::new(SystemLookup::from_system_conf());
    let context = match AppContext::from_config(&config, lookup) {
        Ok(context) => context,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let server = ProxyServer::new(context);
    if let Err(e) = server.run(shutdown).await {
        error!(error = %e, "Proxy server error");
        std::process::exit(1);
    }
}

/// Loads the configuration file, applies overrides and validates the result.
///
/// An explicitly named file must load; otherwise the first default path
/// that exists is used, and built-in defaults when none does.
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => match DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
        {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        },
    };

    args.apply(&mut config)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "v4v6-proxy",
            "--http-port",
            "8080",
            "--allowed-hosts",
            ".*\\.example\\.com$",
            "--cache-dns",
            "false",
            "--source-ip-filter-hosts",
            "^admin\\.",
            "--source-ip-filter-cidrs",
            "10.0.0.0/8, 192.168.0.0/16",
        ]);
        let mut config = AppConfig::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.filters.allowed_hosts, ".*\\.example\\.com$");
        assert!(!config.dns.cache);
        assert_eq!(config.filters.source_ip.len(), 1);
        assert_eq!(
            config.filters.source_ip[0].cidrs,
            vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()]
        );
    }

    #[test]
    fn test_mismatched_source_ip_flags() {
        let args = Args::parse_from([
            "v4v6-proxy",
            "--source-ip-filter-hosts",
            "a",
            "--source-ip-filter-hosts",
            "b",
            "--source-ip-filter-cidrs",
            "10.0.0.0/8",
        ]);
        assert!(args.apply(&mut AppConfig::default()).is_err());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(Args::parse_from(["v4v6-proxy"]).log_level(), None);
        assert_eq!(Args::parse_from(["v4v6-proxy", "-vv"]).log_level(), Some("debug"));
        assert_eq!(Args::parse_from(["v4v6-proxy", "-q"]).log_level(), Some("error"));
        assert!(Args::parse_from(["v4v6-proxy", "-vvvv"]).trace_deps());
    }
}
