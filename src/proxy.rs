//! Request dispatcher.
//!
//! Every inbound request goes through the same steps:
//! - derive the routing host from `Host` (or the HTTP/2 authority)
//! - run the filter chain, answering `400 bad request` on denial
//! - resolve the host to an IPv6 address, answering `502 bad gateway`
//!   when there is none
//! - forward over the host's transport, keeping the scheme the client
//!   used and the original `Host` header

use crate::config::TransportConfig;
use crate::error::{ProxyError, Result};
use crate::filter::{Filter, RequestInfo};
use crate::resolver::DnsResolver;
use crate::transport::{BoxError, ProxyBody, TransportPool};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use std::net::{Ipv6Addr, SocketAddr};
use tracing::{debug, error, info, warn};

const BAD_REQUEST_BODY: &str = "bad request";
const BAD_GATEWAY_BODY: &str = "bad gateway";

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// The reverse proxy handler shared by both listeners.
pub struct ReverseProxy {
    filters: Vec<Box<dyn Filter>>,
    resolver: DnsResolver,
    transports: TransportPool,
    backend_http_port: u16,
    backend_https_port: u16,
}

impl ReverseProxy {
    pub fn new(
        filters: Vec<Box<dyn Filter>>,
        resolver: DnsResolver,
        transports: TransportPool,
        settings: &TransportConfig,
    ) -> Self {
        Self {
            filters,
            resolver,
            transports,
            backend_http_port: settings.backend_http_port,
            backend_https_port: settings.backend_https_port,
        }
    }

    pub fn resolver(&self) -> &DnsResolver {
        &self.resolver
    }

    pub fn transports(&self) -> &TransportPool {
        &self.transports
    }

    /// Handles one request. Never fails: every outcome is an HTTP response.
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = request.method().clone();
        let uri = request.uri().clone();

        let Some(host) = routing_host(&request) else {
            warn!(method = %method, url = %uri, remote = %remote_addr, "request without host");
            return text_response(StatusCode::BAD_REQUEST, BAD_REQUEST_BODY);
        };

        let info = RequestInfo {
            host: &host,
            remote_addr,
            method: &method,
            uri: &uri,
        };
        for filter in &self.filters {
            if let Err(e) = filter.check(&info) {
                debug!(filter = filter.name(), error = %e, "Request rejected");
                return text_response(StatusCode::BAD_REQUEST, BAD_REQUEST_BODY);
            }
        }

        let address = match self.resolver.resolve(&host).await {
            Ok(address) => address,
            Err(e) => {
                error!(method = %method, url = %uri, error = %e, "could not find ipv6 address");
                return text_response(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY);
            }
        };

        let (scheme, port) = if is_tls {
            (Scheme::HTTPS, self.backend_https_port)
        } else {
            (Scheme::HTTP, self.backend_http_port)
        };

        let backend_request =
            match build_backend_request(request, &host, scheme, address, port, remote_addr) {
                Ok(request) => request,
                Err(e) => {
                    error!(method = %method, url = %uri, error = %e, "failed to build backend request");
                    return text_response(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY);
                }
            };

        let transport = match self.transports.get(&host) {
            Ok(transport) => transport,
            Err(e) => {
                error!(host = %host, error = %e, "failed to create transport");
                return text_response(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY);
            }
        };

        info!(
            method = %method,
            url = %uri,
            target = %backend_request.uri(),
            "proxying request"
        );

        match transport.send(backend_request).await {
            Ok(response) => client_response(response),
            Err(e) => {
                error!(method = %method, url = %uri, error = %e, "backend request failed");
                text_response(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY)
            }
        }
    }
}

/// Extracts the routing host: port stripped, lowercased.
pub fn routing_host<B>(request: &Request<B>) -> Option<String> {
    let raw = match request.headers().get(header::HOST) {
        Some(value) => value.to_str().ok()?.to_string(),
        None => request.uri().authority()?.as_str().to_string(),
    };

    let authority: Authority = raw.parse().ok()?;
    let host = authority.host().to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(host)
}

/// Rewrites an inbound request for the backend at `address`.
///
/// The URI points at the IPv6 literal, `Host` carries the original
/// name, hop-by-hop headers are dropped and the caller is appended to
/// `X-Forwarded-For`.
pub fn build_backend_request<B>(
    request: Request<B>,
    host: &str,
    scheme: Scheme,
    address: Ipv6Addr,
    port: u16,
    remote_addr: SocketAddr,
) -> Result<Request<ProxyBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = request.into_parts();

    let default_port = if scheme == Scheme::HTTPS { 443 } else { 80 };
    let authority = if port == default_port {
        format!("[{}]", address)
    } else {
        format!("[{}]:{}", address, port)
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    parts.uri = Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::upstream(host, format!("invalid backend uri: {}", e)))?;

    // The transport picks the wire protocol.
    parts.version = Version::HTTP_11;

    remove_hop_by_hop_headers(&mut parts.headers);

    let host_value = HeaderValue::from_str(host)
        .map_err(|e| ProxyError::upstream(host, format!("invalid host header: {}", e)))?;
    parts.headers.insert(header::HOST, host_value);

    append_forwarded_for(&mut parts.headers, remote_addr);

    let body: ProxyBody = body.map_err(Into::into).boxed_unsync();
    Ok(Request::from_parts(parts, body))
}

fn client_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    remove_hop_by_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.map_err(BoxError::from).boxed_unsync())
}

fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote_addr: SocketAddr) {
    let client_ip = remote_addr.ip().to_canonical().to_string();
    let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
