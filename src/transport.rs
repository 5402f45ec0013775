//! Outbound connection pools, one per backend host.
//!
//! Transports are keyed by the host the client asked for, not by the
//! address it resolved to, so address changes reuse the same pool. Each
//! transport pins its TLS server name to that host: the backend is dialed
//! by IPv6 literal but its certificate is verified against its real name.

use crate::config::TransportConfig;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper_rustls::{FixedServerNameResolver, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Boxed error used for request and response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Builds the TLS client configuration used for every backend: webpki
/// roots plus `extra_roots`, TLS 1.2 minimum.
pub fn client_tls_config(extra_roots: &[PathBuf]) -> Result<ClientConfig> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    for path in extra_roots {
        let file = File::open(path).map_err(|e| {
            ProxyError::config_validation(format!(
                "failed to read root certificates {}: {}",
                path.display(),
                e
            ))
        })?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()?;
        for cert in certs {
            roots.add(cert)?;
        }
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(config)
}

/// Connection pool for a single backend host.
pub struct Transport {
    server_name: String,
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl Transport {
    fn new(host: &str, settings: &TransportConfig, tls_config: ClientConfig) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            ProxyError::upstream(host, format!("invalid TLS server name: {}", e))
        })?;

        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .with_server_name_resolver(FixedServerNameResolver::new(server_name))
            .enable_http1();
        let connector = if settings.http2 {
            builder.enable_http2().build()
        } else {
            builder.build()
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build(connector);

        Ok(Self {
            server_name: host.to_string(),
            client,
        })
    }

    /// The TLS server name presented to and verified against the backend.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Sends `request` to the backend addressed by its URI.
    pub async fn send(&self, request: Request<ProxyBody>) -> Result<Response<Incoming>> {
        self.client
            .request(request)
            .await
            .map_err(|e| ProxyError::upstream(&self.server_name, error_chain(&e)))
    }
}

/// Lazily populated map of host → transport. Entries live for the whole
/// process.
pub struct TransportPool {
    settings: TransportConfig,
    tls_config: ClientConfig,
    transports: DashMap<String, Arc<Transport>>,
}

impl TransportPool {
    pub fn new(settings: TransportConfig) -> Result<Self> {
        let tls_config = client_tls_config(&settings.extra_root_certificates)?;
        Ok(Self::with_tls_config(settings, tls_config))
    }

    pub fn with_tls_config(settings: TransportConfig, tls_config: ClientConfig) -> Self {
        Self {
            settings,
            tls_config,
            transports: DashMap::new(),
        }
    }

    /// Returns the transport for `host`, creating it on first use.
    ///
    /// Creation goes through the map entry, so concurrent first requests
    /// for a host end up sharing one transport.
    pub fn get(&self, host: &str) -> Result<Arc<Transport>> {
        if let Some(transport) = self.transports.get(host) {
            return Ok(Arc::clone(transport.value()));
        }

        let transport = self
            .transports
            .entry(host.to_string())
            .or_try_insert_with(|| {
                debug!(host = %host, "Creating backend transport");
                Transport::new(host, &self.settings, self.tls_config.clone()).map(Arc::new)
            })?;
        Ok(Arc::clone(transport.value()))
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

/// Renders an error with all of its sources, hyper's top-level messages
/// being rather terse.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool() -> TransportPool {
        TransportPool::new(TransportConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_transport_is_reused() {
        let pool = pool();
        let first = pool.get("y.com").unwrap();
        let second = pool.get("y.com").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_per_host() {
        let pool = pool();
        let a = pool.get("a.example.com").unwrap();
        let b = pool.get("b.example.com").unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.server_name(), "a.example.com");
        assert_eq!(b.server_name(), "b.example.com");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_concurrent_first_use_registers_once() {
        let pool = Arc::new(pool());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.get("y.com").unwrap())
            })
            .collect();
        let transports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(pool.len(), 1);
        for transport in &transports[1..] {
            assert!(Arc::ptr_eq(&transports[0], transport));
        }
    }

    #[test]
    fn test_missing_extra_root_file() {
        let settings = TransportConfig {
            extra_root_certificates: vec![PathBuf::from("/no/such/root.pem")],
            ..Default::default()
        };
        assert!(matches!(
            TransportPool::new(settings),
            Err(ProxyError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn test_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = ProxyError::Io(inner);
        assert_eq!(error_chain(&outer), "I/O error: refused");
    }
}
