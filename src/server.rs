//! Listeners and connection handling.
//!
//! The plain HTTP and the HTTPS listener share one [`ReverseProxy`]. TLS is
//! terminated with the certificate store acting as the SNI resolver.

use crate::certs::CertificateStore;
use crate::config::{AppConfig, ServerConfig};
use crate::error::{ProxyError, Result};
use crate::filter::build_filters;
use crate::proxy::ReverseProxy;
use crate::resolver::{DnsResolver, Lookup};
use crate::transport::TransportPool;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept`, so a persistent failure such as running out
/// of file descriptors does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything the listeners need, built once at startup and never mutated.
pub struct AppContext {
    pub certificates: Arc<CertificateStore>,
    pub proxy: Arc<ReverseProxy>,
    pub server: ServerConfig,
}

impl AppContext {
    /// Loads certificates and wires up filters, resolver and transports.
    ///
    /// Fails when the certificate directory yields no bundle at all.
    pub fn from_config(config: &AppConfig, lookup: Arc<dyn Lookup>) -> Result<Self> {
        let certificates = CertificateStore::load(
            &config.certificates.dir,
            &config.certificates.cert_file_name,
            &config.certificates.key_file_name,
        )?;
        if certificates.is_empty() {
            return Err(ProxyError::certificate_load(format!(
                "no certificates found in {}",
                config.certificates.dir.display()
            )));
        }
        info!(
            count = certificates.len(),
            first = certificates.first_bundle().map(|entry| entry.name()).unwrap_or_default(),
            names = ?certificates.names(),
            "Loaded certificates"
        );

        let filters = build_filters(&config.filters)?;
        let resolver = DnsResolver::from_config(lookup, &config.dns);
        let transports = TransportPool::new(config.transport.clone())?;
        let proxy = ReverseProxy::new(filters, resolver, transports, &config.transport);

        Ok(Self {
            certificates: Arc::new(certificates),
            proxy: Arc::new(proxy),
            server: config.server.clone(),
        })
    }
}

/// Builds the TLS server configuration: SNI-driven certificate choice,
/// TLS 1.2 minimum, ALPN for h2 and http/1.1.
pub fn server_tls_config(certificates: Arc<CertificateStore>) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
    .with_no_client_auth()
    .with_cert_resolver(certificates);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

pub struct ProxyServer {
    context: Arc<AppContext>,
}

impl ProxyServer {
    pub fn new(context: AppContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Binds both listeners and serves until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let http_listener = bind_dual_stack(self.context.server.http_port).await?;
        let https_listener = bind_dual_stack(self.context.server.https_port).await?;
        self.serve(http_listener, https_listener, shutdown).await
    }

    /// Serves on already bound listeners until `shutdown` is cancelled.
    pub async fn serve(
        &self,
        http_listener: TcpListener,
        https_listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(Arc::clone(
            &self.context.certificates,
        ))?));

        let sweeper = if self.context.proxy.resolver().cache_enabled() {
            Some(self.context.proxy.resolver().spawn_sweeper(shutdown.child_token()))
        } else {
            None
        };

        info!(address = %http_listener.local_addr()?, "Starting http server");
        info!(address = %https_listener.local_addr()?, "Starting https server");

        let timeout = self.context.server.header_read_timeout();
        let http = tokio::spawn(accept_loop(
            http_listener,
            None,
            Arc::clone(&self.context.proxy),
            timeout,
            shutdown.clone(),
        ));
        let https = tokio::spawn(accept_loop(
            https_listener,
            Some(acceptor),
            Arc::clone(&self.context.proxy),
            timeout,
            shutdown.clone(),
        ));

        let (http, https) = tokio::join!(http, https);
        for result in [http, https] {
            if let Err(e) = result {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }

        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "DNS cache sweeper ended abnormally");
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Binds `[::]:port`, falling back to `0.0.0.0:port` on hosts without IPv6.
async fn bind_dual_stack(port: u16) -> Result<TcpListener> {
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!(port = port, error = %e, "IPv6 bind failed, falling back to IPv4");
            Ok(TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?)
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    proxy: Arc<ReverseProxy>,
    header_read_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                if !accept_backoff(&shutdown).await {
                    break;
                }
                continue;
            }
        };

        let proxy = Arc::clone(&proxy);
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        serve_connection(stream, remote_addr, true, proxy, header_read_timeout)
                            .await
                    }
                    Err(e) => debug!(remote = %remote_addr, error = %e, "TLS handshake failed"),
                },
                None => {
                    serve_connection(stream, remote_addr, false, proxy, header_read_timeout).await
                }
            }
        });
    }
}

/// Waits out [`ACCEPT_RETRY_DELAY`]. Returns `false` if `shutdown` fires first.
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

/// How a connection that ended with an error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionFailure {
    /// The client went away or timed out; routine.
    Teardown,
    /// The response could not be written back to the client.
    Write,
    Other,
}

impl ConnectionFailure {
    fn classify(err: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(e) = err.downcast_ref::<hyper::Error>() {
            if e.is_incomplete_message() || e.is_closed() || e.is_canceled() || e.is_timeout() {
                return Self::Teardown;
            }
            if e.is_body_write_aborted() {
                return Self::Write;
            }
        }

        let mut source = Some(err);
        while let Some(cause) = source {
            if cause.is::<std::io::Error>() {
                return Self::Write;
            }
            source = cause.source();
        }
        Self::Other
    }
}

async fn serve_connection<S>(
    stream: S,
    remote_addr: SocketAddr,
    is_tls: bool,
    proxy: Arc<ReverseProxy>,
    header_read_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, Infallible>(proxy.handle(request, remote_addr, is_tls).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);

    if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
        match ConnectionFailure::classify(e.as_ref()) {
            ConnectionFailure::Teardown => {
                debug!(remote = %remote_addr, error = %e, "Connection closed by client")
            }
            ConnectionFailure::Write => {
                error!(remote = %remote_addr, error = %e, "Error writing response")
            }
            ConnectionFailure::Other => {
                warn!(remote = %remote_addr, error = %e, "Connection failed")
            }
        }
    }
}
