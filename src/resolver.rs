//! AAAA resolution with a failure-triggered cache.
//!
//! A cached address is served for as long as it stays in the cache; age
//! alone never forces a new lookup on the request path. Instead, a
//! background sweep periodically re-resolves entries older than the TTL
//! and drops only those whose host no longer resolves. An origin whose DNS
//! is flapping therefore keeps being served from its last good address.

use crate::config::DnsConfig;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use trust_dns_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Interval between two cache sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Source of live address lookups.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Returns every address currently published for `host`.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Lookups against the system's configured name servers.
pub struct SystemLookup {
    resolver: TokioAsyncResolver,
}

impl SystemLookup {
    /// Builds a lookup from `/etc/resolv.conf` (or the platform
    /// equivalent), falling back to the trust-dns defaults.
    pub fn from_system_conf() -> Self {
        let (config, mut opts) = match trust_dns_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "Failed to read system resolver configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };

        opts.ip_strategy = LookupIpStrategy::Ipv6Only;
        // Every call must hit the network; caching is ours to do.
        opts.cache_size = 0;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProxyError::resolution(host, e.to_string()))?;
        Ok(response.iter().collect())
    }
}

/// A cached resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// The resolved address.
    pub address: Ipv6Addr,

    /// When the address was resolved.
    pub created_at: Instant,
}

/// Resolves hostnames to IPv6 addresses, optionally caching the result.
#[derive(Clone)]
pub struct DnsResolver {
    lookup: Arc<dyn Lookup>,
    cache_enabled: bool,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl DnsResolver {
    pub fn new(lookup: Arc<dyn Lookup>, cache_enabled: bool, ttl: Duration) -> Self {
        Self {
            lookup,
            cache_enabled,
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(lookup: Arc<dyn Lookup>, config: &DnsConfig) -> Self {
        Self::new(lookup, config.cache, config.cache_ttl())
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Resolves `host` to its first IPv6 address.
    ///
    /// A cache hit is returned as is, whatever its age.
    pub async fn resolve(&self, host: &str) -> Result<Ipv6Addr> {
        if self.cache_enabled {
            if let Some(address) = self.cached(host) {
                trace!(host = %host, address = %address, "DNS cache hit");
                return Ok(address);
            }
        }

        let address = self.lookup_aaaa(host).await?;

        if self.cache_enabled {
            self.lock_cache().insert(
                host.to_string(),
                CacheEntry {
                    address,
                    created_at: Instant::now(),
                },
            );
        }

        debug!(host = %host, address = %address, "Resolved IPv6 address");
        Ok(address)
    }

    /// The cached address for `host`, if any.
    pub fn cached(&self, host: &str) -> Option<Ipv6Addr> {
        self.lock_cache().get(host).map(|entry| entry.address)
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    /// Runs one sweep cycle and returns the number of evicted entries.
    ///
    /// Works on a snapshot so no lookup runs while the cache is locked.
    /// An entry is evicted only when it is older than the TTL *and* its
    /// host fails to resolve now; surviving entries are left untouched.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<(String, CacheEntry)> = self
            .lock_cache()
            .iter()
            .map(|(host, entry)| (host.clone(), *entry))
            .collect();

        let mut evicted = 0;
        for (host, entry) in snapshot {
            if entry.created_at.elapsed() <= self.ttl {
                continue;
            }

            if let Err(e) = self.lookup_aaaa(&host).await {
                let mut cache = self.lock_cache();
                // The request path may have replaced the entry meanwhile.
                if cache.get(&host) == Some(&entry) {
                    cache.remove(&host);
                    evicted += 1;
                    info!(host = %host, address = %entry.address, error = %e, "Evicted stale DNS cache entry");
                }
            }
        }

        evicted
    }

    /// Spawns the periodic sweep. The first cycle runs immediately; the
    /// task ends when `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let resolver = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("DNS cache sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let evicted = resolver.sweep().await;
                        trace!(evicted, remaining = resolver.cache_len(), "DNS cache sweep finished");
                    }
                }
            }
        })
    }

    async fn lookup_aaaa(&self, host: &str) -> Result<Ipv6Addr> {
        let addresses = self.lookup.lookup_ip(host).await?;
        first_ipv6(addresses)
            .ok_or_else(|| ProxyError::resolution(host, "could not find AAAA record"))
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First address that is IPv6 and not an IPv4-mapped address.
fn first_ipv6(addresses: impl IntoIterator<Item = IpAddr>) -> Option<Ipv6Addr> {
    addresses.into_iter().find_map(|ip| match ip {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(v6),
        _ => None,
    })
}
