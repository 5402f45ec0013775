//! # v4v6-proxy Library
//!
//! A reverse proxy that lets IPv4-only clients reach IPv6-only web servers.
//! The proxy terminates TLS with certificates chosen by SNI, looks up the
//! AAAA record of the requested host and forwards the request there with
//! the original `Host` header.
//!
//! ## Modules
//!
//! - [`certs`]: Certificate loading and SNI selection
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and handling
//! - [`filter`]: Allowed-host and source-IP admission filters
//! - [`logging`]: Logging setup and configuration
//! - [`proxy`]: The request dispatcher
//! - [`resolver`]: AAAA resolution with a self-pruning cache
//! - [`server`]: HTTP and HTTPS listeners
//! - [`transport`]: Per-host backend connection pools
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use v4v6_proxy::config::AppConfig;
//! use v4v6_proxy::resolver::SystemLookup;
//! use v4v6_proxy::server::{AppContext, ProxyServer};
//!
//! let config = AppConfig::load("config.yaml")?;
//! let context = AppContext::from_config(&config, Arc::new(SystemLookup::from_system_conf()))?;
//! ProxyServer::new(context).run(CancellationToken::new()).await?;
//! ```
//!
//! ## Request flow
//!
//! 1. **Filters**: the allowed-host pattern, then source-IP rules
//! 2. **Resolution**: AAAA lookup, served from cache when enabled
//! 3. **Forwarding**: over the transport dedicated to the host, using the
//!    same scheme the client used

pub mod certs;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod transport;

pub use certs::CertificateStore;
pub use config::AppConfig;
pub use error::{ProxyError, Result};
pub use proxy::ReverseProxy;
pub use resolver::DnsResolver;
pub use server::{AppContext, ProxyServer};
pub use transport::TransportPool;
