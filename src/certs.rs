//! SNI-driven certificate selection.
//!
//! Certificates are loaded once at startup from a directory with one
//! subdirectory per bundle (the layout certbot uses for `live/`). The
//! store then answers, for every TLS handshake, which bundle to present
//! for the server name the client asked for.
//!
//! ## Matching
//!
//! - A DNS name equal to the server name matches.
//! - `*.<suffix>` matches any server name ending in `<suffix>`, across any
//!   number of labels, but not `<suffix>` itself.
//!
//! The longest matching DNS name wins; equally long matches go to the
//! bundle whose name sorts first.

use crate::error::{ProxyError, Result};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use x509_parser::extensions::GeneralName;

/// One certificate bundle: chain, key and the DNS names it covers.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    name: String,
    dns_names: Vec<String>,
    key: Arc<CertifiedKey>,
}

impl CertificateEntry {
    /// Builds an entry from an in-memory PEM chain and PEM private key.
    pub fn from_pem(name: impl Into<String>, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let name = name.into();

        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| {
                ProxyError::certificate_load(format!("failed to load cert {}: {}", name, e))
            })?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| {
                ProxyError::certificate_load(format!("failed to load key {}: {}", name, e))
            })?
            .ok_or_else(|| {
                ProxyError::certificate_load(format!("failed to load key {}: no private key", name))
            })?;

        Self::from_der(name, chain, key)
    }

    fn from_der(
        name: String,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let leaf = chain.first().ok_or_else(|| {
            ProxyError::certificate_load(format!("failed to load cert {}: empty chain", name))
        })?;
        let dns_names = leaf_dns_names(leaf).map_err(|message| {
            ProxyError::certificate_load(format!("failed to parse cert {}: {}", name, message))
        })?;

        let signing_key = any_supported_type(&key).map_err(|e| {
            ProxyError::certificate_load(format!("unsupported key for cert {}: {}", name, e))
        })?;

        let certified = CertifiedKey::new(chain, signing_key);
        certified.keys_match().map_err(|e| {
            ProxyError::certificate_load(format!("key does not match cert {}: {}", name, e))
        })?;

        Ok(Self {
            name,
            dns_names,
            key: Arc::new(certified),
        })
    }

    /// Bundle identifier (the directory name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercased SAN DNS names of the leaf certificate.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// The chain and signing key, ready to hand to rustls.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.key)
    }
}

/// Extracts the SAN DNS names from a DER certificate.
fn leaf_dns_names(leaf: &CertificateDer<'_>) -> std::result::Result<Vec<String>, String> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).map_err(|e| e.to_string())?;

    let san = cert.subject_alternative_name().map_err(|e| e.to_string())?;
    Ok(san
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Whether certificate name `dns_name` covers `server_name`.
fn matches_dns_name(dns_name: &str, server_name: &str) -> bool {
    if dns_name == server_name {
        return true;
    }

    match dns_name.strip_prefix("*.") {
        Some(suffix) => server_name != suffix && server_name.ends_with(suffix),
        None => false,
    }
}

/// All loaded certificate bundles, keyed by bundle name.
#[derive(Debug, Default)]
pub struct CertificateStore {
    entries: BTreeMap<String, CertificateEntry>,
}

impl CertificateStore {
    /// Loads every bundle below `dir`.
    ///
    /// Each immediate subdirectory must contain `cert_file_name` and
    /// `key_file_name`. Plain files next to the bundles are ignored. A
    /// single bad bundle fails the whole load.
    pub fn load<P: AsRef<Path>>(dir: P, cert_file_name: &str, key_file_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let read_dir = fs::read_dir(dir).map_err(|e| {
            ProxyError::certificate_load(format!("failed to read certs dir {}: {}", dir.display(), e))
        })?;

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| {
                ProxyError::certificate_load(format!(
                    "failed to read certs dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let is_dir = dir_entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }

            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let bundle = dir_entry.path();
            let chain = read_chain(&bundle.join(cert_file_name), &name)?;
            let key = read_key(&bundle.join(key_file_name), &name)?;
            let entry = CertificateEntry::from_der(name, chain, key)?;

            debug!(
                bundle = %entry.name(),
                dns_names = ?entry.dns_names(),
                "Loaded certificate bundle"
            );
            entries.push(entry);
        }

        let store = Self::from_entries(entries);
        info!(
            dir = %dir.display(),
            bundles = store.len(),
            "Certificate store loaded"
        );
        Ok(store)
    }

    /// Builds a store from already loaded entries.
    pub fn from_entries(entries: impl IntoIterator<Item = CertificateEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    /// Selects the bundle to present for `server_name`.
    pub fn select(&self, server_name: &str) -> Result<&CertificateEntry> {
        let server_name = server_name.to_ascii_lowercase();
        let mut best: Option<(&CertificateEntry, usize)> = None;

        // BTreeMap iteration is ordered by bundle name, so keeping the first
        // of equally long matches gives the deterministic tie-break.
        for entry in self.entries.values() {
            for dns_name in &entry.dns_names {
                if !matches_dns_name(dns_name, &server_name) {
                    continue;
                }
                if best.map_or(true, |(_, len)| dns_name.len() > len) {
                    best = Some((entry, dns_name.len()));
                }
            }
        }

        best.map(|(entry, _)| entry)
            .ok_or_else(|| ProxyError::certificate_not_found(server_name))
    }

    /// Bundle names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// The bundle that sorts first, used to name the store in logs.
    pub fn first_bundle(&self) -> Option<&CertificateEntry> {
        self.entries.values().next()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            warn!("TLS handshake without SNI, no certificate to present");
            return None;
        };

        match self.select(server_name) {
            Ok(entry) => Some(entry.certified_key()),
            Err(e) => {
                warn!(server_name = %server_name, error = %e, "No certificate for handshake");
                None
            }
        }
    }
}

fn read_chain(path: &Path, bundle: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::certificate_load(format!(
            "failed to load cert {} ({}): {}",
            bundle,
            path.display(),
            e
        ))
    })?;

    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::certificate_load(format!("failed to load cert {}: {}", bundle, e)))
}

fn read_key(path: &Path, bundle: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::certificate_load(format!(
            "failed to load key {} ({}): {}",
            bundle,
            path.display(),
            e
        ))
    })?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::certificate_load(format!("failed to load key {}: {}", bundle, e)))?
        .ok_or_else(|| {
            ProxyError::certificate_load(format!("failed to load key {}: no private key", bundle))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, dns_names: &[&str]) -> CertificateEntry {
        let names: Vec<String> = dns_names.iter().map(|n| n.to_string()).collect();
        let generated = rcgen::generate_simple_self_signed(names).unwrap();
        CertificateEntry::from_pem(
            name,
            generated.cert.pem().as_bytes(),
            generated.key_pair.serialize_pem().as_bytes(),
        )
        .unwrap()
    }

    fn write_bundle(root: &Path, bundle: &str, dns_names: &[&str]) {
        let names: Vec<String> = dns_names.iter().map(|n| n.to_string()).collect();
        let generated = rcgen::generate_simple_self_signed(names).unwrap();
        let dir = root.join(bundle);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("fullchain.pem"), generated.cert.pem()).unwrap();
        fs::write(dir.join("privkey.pem"), generated.key_pair.serialize_pem()).unwrap();
    }

    #[test]
    fn test_matches_dns_name() {
        assert!(matches_dns_name("a.example.com", "a.example.com"));
        assert!(!matches_dns_name("a.example.com", "b.example.com"));

        assert!(matches_dns_name("*.example.com", "b.example.com"));
        assert!(matches_dns_name("*.example.com", "x.y.example.com"));
        assert!(!matches_dns_name("*.example.com", "example.com"));
        assert!(!matches_dns_name("*.example.com", "example.org"));
        // Plain suffix comparison, not bound to a label.
        assert!(matches_dns_name("*.example.com", "fooexample.com"));
    }

    #[test]
    fn test_select_exact_and_wildcard() {
        let store = CertificateStore::from_entries(vec![
            entry("exact", &["a.example.com"]),
            entry("wildcard", &["*.example.com"]),
        ]);

        assert_eq!(store.select("a.example.com").unwrap().name(), "exact");
        assert_eq!(store.select("b.example.com").unwrap().name(), "wildcard");
        assert!(matches!(
            store.select("example.com"),
            Err(ProxyError::CertificateNotFound { .. })
        ));
    }

    #[test]
    fn test_select_longest_match_wins() {
        let store = CertificateStore::from_entries(vec![
            entry("broad", &["*.example.com"]),
            entry("narrow", &["*.api.example.com"]),
        ]);

        assert_eq!(store.select("v1.api.example.com").unwrap().name(), "narrow");
        assert_eq!(store.select("www.example.com").unwrap().name(), "broad");
    }

    #[test]
    fn test_select_tie_break_by_bundle_name() {
        let store = CertificateStore::from_entries(vec![
            entry("zeta", &["*.example.com"]),
            entry("alpha", &["*.example.com"]),
        ]);

        for _ in 0..10 {
            assert_eq!(store.select("www.example.com").unwrap().name(), "alpha");
        }
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let store = CertificateStore::from_entries(vec![entry("main", &["www.example.com"])]);
        assert_eq!(store.select("WWW.Example.COM").unwrap().name(), "main");
    }

    #[test]
    fn test_load_directory() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "example.com", &["example.com", "www.example.com"]);
        write_bundle(root.path(), "wild", &["*.example.org"]);
        fs::write(root.path().join("README"), "not a bundle").unwrap();

        let store = CertificateStore::load(root.path(), "fullchain.pem", "privkey.pem").unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.names(), vec!["example.com", "wild"]);
        assert_eq!(store.first_bundle().unwrap().name(), "example.com");
        assert_eq!(
            store.select("www.example.com").unwrap().dns_names(),
            &["example.com".to_string(), "www.example.com".to_string()]
        );
        assert_eq!(store.select("a.example.org").unwrap().name(), "wild");
    }

    #[test]
    fn test_load_empty_directory() {
        let root = TempDir::new().unwrap();
        let store = CertificateStore::load(root.path(), "fullchain.pem", "privkey.pem").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_missing_directory() {
        let result = CertificateStore::load("/no/such/certs", "fullchain.pem", "privkey.pem");
        assert!(matches!(result, Err(ProxyError::CertificateLoad { .. })));
    }

    #[test]
    fn test_load_fails_on_single_bad_bundle() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "good", &["good.example.com"]);

        let bad = root.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("fullchain.pem"), "garbage").unwrap();
        fs::write(bad.join("privkey.pem"), "garbage").unwrap();

        let result = CertificateStore::load(root.path(), "fullchain.pem", "privkey.pem");
        assert!(matches!(result, Err(ProxyError::CertificateLoad { .. })));
    }

    #[test]
    fn test_load_fails_on_missing_key() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "good", &["good.example.com"]);
        fs::remove_file(root.path().join("good").join("privkey.pem")).unwrap();

        let result = CertificateStore::load(root.path(), "fullchain.pem", "privkey.pem");
        assert!(matches!(result, Err(ProxyError::CertificateLoad { .. })));
    }

    #[test]
    fn test_load_fails_on_mismatched_key() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "a", &["a.example.com"]);
        let other = rcgen::generate_simple_self_signed(vec!["b.example.com".to_string()]).unwrap();
        fs::write(
            root.path().join("a").join("privkey.pem"),
            other.key_pair.serialize_pem(),
        )
        .unwrap();

        let result = CertificateStore::load(root.path(), "fullchain.pem", "privkey.pem");
        assert!(matches!(result, Err(ProxyError::CertificateLoad { .. })));
    }

    #[test]
    fn test_from_pem_rejects_mismatched_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["a.example.com".to_string()]).unwrap();
        let other = rcgen::generate_simple_self_signed(vec!["a.example.com".to_string()]).unwrap();

        let result = CertificateEntry::from_pem(
            "a",
            cert.cert.pem().as_bytes(),
            other.key_pair.serialize_pem().as_bytes(),
        );
        assert!(matches!(result, Err(ProxyError::CertificateLoad { .. })));
    }
}
