//! Error types for the v4v6-proxy application.
//!
//! Startup errors (configuration, certificate loading) are fatal; the
//! per-request variants are turned into HTTP responses by the proxy.

use thiserror::Error;

/// Main error type for the v4v6-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// A certificate bundle could not be loaded.
    #[error("Failed to load certificates: {message}")]
    CertificateLoad { message: String },

    /// No loaded certificate covers the requested server name.
    #[error("No certificate found for {server_name}")]
    CertificateNotFound { server_name: String },

    /// The host has no usable IPv6 address.
    #[error("Could not find IPv6 address for {host}: {message}")]
    Resolution { host: String, message: String },

    /// A request filter rejected the request.
    #[error("Request denied: {reason}")]
    FilterDenied { reason: String },

    /// The backend could not be reached or answered with garbage.
    #[error("Upstream error for {host}: {message}")]
    Upstream { host: String, message: String },

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new certificate load error.
    pub fn certificate_load(message: impl Into<String>) -> Self {
        Self::CertificateLoad {
            message: message.into(),
        }
    }

    pub fn certificate_not_found(server_name: impl Into<String>) -> Self {
        Self::CertificateNotFound {
            server_name: server_name.into(),
        }
    }

    /// Creates a new resolution error for `host`.
    pub fn resolution(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn filter_denied(reason: impl Into<String>) -> Self {
        Self::FilterDenied {
            reason: reason.into(),
        }
    }

    pub fn upstream(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::ConfigNotFound {
            path: "/etc/config.yaml".to_string(),
        };
        assert!(err.to_string().contains("/etc/config.yaml"));

        let err = ProxyError::config_parse("invalid yaml");
        assert!(err.to_string().contains("invalid yaml"));

        let err = ProxyError::resolution("x.com", "no AAAA record");
        assert_eq!(
            err.to_string(),
            "Could not find IPv6 address for x.com: no AAAA record"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }

    #[test]
    fn test_error_from_rustls() {
        let err: ProxyError = rustls::Error::General("bad key".to_string()).into();
        assert!(matches!(err, ProxyError::Tls(_)));
        assert!(err.to_string().contains("bad key"));
    }
}
