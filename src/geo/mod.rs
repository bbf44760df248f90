//! Visitor geolocation
//!
//! An ordered chain of providers is tried with a bounded timeout each. The
//! lookup never fails: when every provider gives up the result collapses to a
//! sentinel location so visit recording is never blocked on geolocation.

mod maxmind;
mod providers;

pub use maxmind::MaxMindProvider;
pub use providers::{IpGeolocationProvider, IpInfoProvider};

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GeoConfig;

pub const SENTINEL_IP: &str = "0.0.0.0";

/// Normalized geolocation, whatever provider produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub ip: String,
    pub city: String,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub country_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub org: Option<String>,
    pub timezone: Option<String>,
    pub postal: Option<String>,
}

impl GeoLocation {
    pub fn sentinel() -> Self {
        Self {
            ip: SENTINEL_IP.to_string(),
            city: crate::db::UNKNOWN.to_string(),
            region: None,
            country_code: None,
            country_name: crate::db::UNKNOWN.to_string(),
            latitude: 0.0,
            longitude: 0.0,
            org: None,
            timezone: None,
            postal: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no data for {0}")]
    NotFound(String),

    #[error("provider needs a public caller address")]
    NeedsAddress,

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// A single geolocation source
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Locate `ip`, or the caller of the provider itself when `None`
    async fn locate(&self, ip: Option<IpAddr>) -> Result<GeoLocation, GeoError>;
}

/// Which step of the chain produced the location
#[derive(Debug, Clone, PartialEq)]
pub enum GeoOutcome {
    Primary(GeoLocation),
    Fallback { provider: String, location: GeoLocation },
    Sentinel,
}

impl GeoOutcome {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, GeoOutcome::Sentinel)
    }

    pub fn into_location(self) -> GeoLocation {
        match self {
            GeoOutcome::Primary(location) => location,
            GeoOutcome::Fallback { location, .. } => location,
            GeoOutcome::Sentinel => GeoLocation::sentinel(),
        }
    }
}

pub struct GeoLookup {
    providers: Vec<Box<dyn GeoProvider>>,
    timeout: Duration,
    /// Successful outcomes only; the sentinel is never cached
    cache: Mutex<TimedCache<IpAddr, GeoOutcome>>,
}

impl GeoLookup {
    pub fn new(providers: Vec<Box<dyn GeoProvider>>, timeout: Duration, cache_ttl_secs: u64) -> Self {
        Self {
            providers,
            timeout,
            cache: Mutex::new(TimedCache::with_lifespan(cache_ttl_secs)),
        }
    }

    /// Build the provider chain in the configured order
    pub fn from_config(config: &GeoConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("portfolio-stats/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut providers: Vec<Box<dyn GeoProvider>> = Vec::new();
        for name in &config.providers {
            match name.as_str() {
                "ipinfo" => providers.push(Box::new(IpInfoProvider::new(
                    client.clone(),
                    &config.ipinfo_url,
                    &config.ipinfo_token,
                ))),
                "ipgeolocation" => {
                    if config.ipgeolocation_api_key.is_empty() {
                        warn!("ipgeolocation provider configured without an API key, skipping");
                        continue;
                    }
                    providers.push(Box::new(IpGeolocationProvider::new(
                        client.clone(),
                        &config.ipgeolocation_url,
                        &config.ipgeolocation_api_key,
                    )));
                }
                "maxmind" => {
                    let provider = MaxMindProvider::open(&config.maxmind_database);
                    if provider.is_available() {
                        providers.push(Box::new(provider));
                    }
                }
                other => anyhow::bail!("Unknown geolocation provider '{}'", other),
            }
        }

        info!(
            providers = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            timeout_ms = config.timeout_ms,
            "Geolocation chain ready"
        );
        Ok(Self::new(providers, Duration::from_millis(config.timeout_ms), config.cache_ttl_secs))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Resolve a caller, or whoever calls the providers when `None`.
    ///
    /// A known but non-public address (private, loopback, documentation) has
    /// no location: it resolves to the sentinel without asking any provider.
    pub async fn lookup(&self, caller: Option<IpAddr>) -> GeoOutcome {
        if let Some(ip) = caller {
            if !is_public_ip(&ip) {
                debug!(%ip, "Non-public caller, skipping geolocation");
                return GeoOutcome::Sentinel;
            }
            if let Some(outcome) = self.cache.lock().await.cache_get(&ip) {
                debug!(%ip, "Geolocation cache hit");
                return outcome.clone();
            }
        }

        for (index, provider) in self.providers.iter().enumerate() {
            let attempt = tokio::time::timeout(self.timeout, provider.locate(caller)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(GeoError::Timeout(self.timeout)),
            };

            match result {
                Ok(location) => {
                    debug!(provider = provider.name(), ip = %location.ip, "Geolocation resolved");
                    let outcome = if index == 0 {
                        GeoOutcome::Primary(location)
                    } else {
                        GeoOutcome::Fallback {
                            provider: provider.name().to_string(),
                            location,
                        }
                    };
                    if let Some(ip) = caller {
                        self.cache.lock().await.cache_set(ip, outcome.clone());
                    }
                    return outcome;
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Geolocation provider failed");
                }
            }
        }

        warn!("All geolocation providers failed, using sentinel location");
        GeoOutcome::Sentinel
    }
}

/// Addresses worth sending to a geolocation provider
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            !(ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified())
        }
        IpAddr::V6(ipv6) => {
            // fc00::/7 unique local, fe80::/10 link local
            let first = ipv6.segments()[0];
            !(ipv6.is_loopback()
                || ipv6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        city: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GeoProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn locate(&self, ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeoLocation {
                ip: ip.map(|ip| ip.to_string()).unwrap_or_else(|| "8.8.8.8".to_string()),
                city: self.city.to_string(),
                country_name: "Testland".to_string(),
                latitude: 1.5,
                longitude: 2.5,
                ..GeoLocation::sentinel()
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl GeoProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn locate(&self, _ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
            Err(GeoError::Status(500))
        }
    }

    struct Slow;

    #[async_trait]
    impl GeoProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn locate(&self, _ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(GeoError::NotFound("never".into()))
        }
    }

    fn fixed(name: &'static str, city: &'static str) -> (Box<dyn GeoProvider>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Box::new(Fixed { name, city, calls: calls.clone() }), calls)
    }

    fn public_ip() -> Option<IpAddr> {
        Some("81.2.69.142".parse().unwrap())
    }

    #[tokio::test]
    async fn first_provider_success_is_primary() {
        let (primary, _) = fixed("a", "Alpha");
        let (secondary, secondary_calls) = fixed("b", "Beta");
        let lookup = GeoLookup::new(vec![primary, secondary], Duration::from_secs(1), 60);

        let outcome = lookup.lookup(public_ip()).await;
        assert!(matches!(&outcome, GeoOutcome::Primary(l) if l.city == "Alpha"));
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_falls_through_to_next_provider() {
        let (secondary, _) = fixed("b", "Beta");
        let lookup = GeoLookup::new(vec![Box::new(Failing) as Box<dyn GeoProvider>, secondary], Duration::from_secs(1), 60);

        match lookup.lookup(public_ip()).await {
            GeoOutcome::Fallback { provider, location } => {
                assert_eq!(provider, "b");
                assert_eq!(location.city, "Beta");
            }
            other => panic!("expected fallback, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_provider_is_bounded_by_timeout() {
        let (secondary, _) = fixed("b", "Beta");
        let lookup = GeoLookup::new(vec![Box::new(Slow) as Box<dyn GeoProvider>, secondary], Duration::from_millis(50), 60);

        let outcome = lookup.lookup(public_ip()).await;
        assert!(matches!(outcome, GeoOutcome::Fallback { .. }));
    }

    #[tokio::test]
    async fn all_failures_collapse_to_sentinel() {
        let lookup = GeoLookup::new(vec![Box::new(Failing) as Box<dyn GeoProvider>, Box::new(Failing)], Duration::from_secs(1), 60);

        let outcome = lookup.lookup(public_ip()).await;
        assert!(outcome.is_sentinel());
        let location = outcome.into_location();
        assert_eq!(location.ip, "0.0.0.0");
        assert_eq!(location.city, "Unknown");
        assert_eq!(location.country_name, "Unknown");
        assert_eq!((location.latitude, location.longitude), (0.0, 0.0));
    }

    #[tokio::test]
    async fn empty_chain_is_sentinel() {
        let lookup = GeoLookup::new(Vec::new(), Duration::from_secs(1), 60);
        assert!(lookup.lookup(None).await.is_sentinel());
    }

    #[tokio::test]
    async fn known_ip_is_served_from_cache() {
        let (primary, calls) = fixed("a", "Alpha");
        let lookup = GeoLookup::new(vec![primary], Duration::from_secs(1), 60);

        lookup.lookup(public_ip()).await;
        lookup.lookup(public_ip()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Unknown callers are never cached
        lookup.lookup(None).await;
        lookup.lookup(None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_public_caller_resolves_to_sentinel_without_providers() {
        let (primary, calls) = fixed("a", "Alpha");
        let lookup = GeoLookup::new(vec![primary], Duration::from_secs(1), 60);

        for ip in ["192.168.1.20", "192.168.1.21", "127.0.0.1", "203.0.113.9"] {
            assert!(lookup.lookup(Some(ip.parse().unwrap())).await.is_sentinel());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cached_fallback_keeps_its_provider() {
        let (secondary, calls) = fixed("b", "Beta");
        let lookup = GeoLookup::new(vec![Box::new(Failing) as Box<dyn GeoProvider>, secondary], Duration::from_secs(1), 60);

        let first = lookup.lookup(public_ip()).await;
        let second = lookup.lookup(public_ip()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert!(matches!(second, GeoOutcome::Fallback { ref provider, .. } if provider == "b"));
    }

    #[test]
    fn classifies_public_addresses() {
        assert!(is_public_ip(&"81.2.69.142".parse().unwrap()));
        assert!(is_public_ip(&"2a02:26f0::1".parse().unwrap()));
        assert!(!is_public_ip(&"10.0.0.1".parse().unwrap()));
        assert!(!is_public_ip(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip(&"::1".parse().unwrap()));
        assert!(!is_public_ip(&"fd00::1".parse().unwrap()));
        assert!(!is_public_ip(&"fe80::1".parse().unwrap()));
    }
}
