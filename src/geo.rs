use dashmap::DashMap;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const IP_API_URL: &str = "http://ip-api.com/json";

/// Country and city of a visitor address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
}

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    country: Option<String>,
    city: Option<String>,
}

/// Resolves visitor IPs to a location through ip-api.com.
///
/// Results (including misses) are cached per address for the lifetime of the
/// process, so one IP costs at most one outbound request. Only ever called
/// from the click recorder's background tasks.
#[derive(Clone, Debug)]
pub struct GeoLocator {
    client: Option<reqwest::Client>,
    cache: Arc<DashMap<String, Option<GeoInfo>>>,
}

impl GeoLocator {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| tracing::warn!("Geo lookups disabled, HTTP client failed: {}", e))
            .ok();

        Self {
            client,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// A locator that never leaves the process; every lookup is a miss.
    pub fn disabled() -> Self {
        Self {
            client: None,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Look up `ip`. Returns `None` for private addresses, failed or
    /// rate-limited requests, and addresses with no useful data.
    pub async fn lookup(&self, ip: &str) -> Option<GeoInfo> {
        if is_private(ip) {
            return None;
        }
        let client = self.client.as_ref()?;

        if let Some(entry) = self.cache.get(ip) {
            return entry.clone();
        }

        let result = fetch(client, ip).await;
        self.cache.insert(ip.to_owned(), result.clone());
        result
    }
}

impl Default for GeoLocator {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch(client: &reqwest::Client, ip: &str) -> Option<GeoInfo> {
    let url = format!("{IP_API_URL}/{ip}?fields=status,country,city");

    let body: IpApiResponse = client
        .get(&url)
        .send()
        .await
        .map_err(|e| tracing::debug!("geo lookup network error for {}: {}", ip, e))
        .ok()?
        .json()
        .await
        .map_err(|e| tracing::debug!("geo lookup parse error for {}: {}", ip, e))
        .ok()?;

    if body.status != "success" {
        tracing::debug!("geo lookup returned non-success status for {}", ip);
        return None;
    }

    let info = GeoInfo {
        country: body.country.filter(|s| !s.is_empty()),
        city: body.city.filter(|s| !s.is_empty()),
    };

    if info.country.is_none() && info.city.is_none() {
        return None;
    }
    Some(info)
}

/// Addresses that must never be sent to a public geolocation API.
/// Unparseable input counts as private.
fn is_private(ip: &str) -> bool {
    let ip = ip.strip_prefix("::ffff:").unwrap_or(ip);

    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            addr.is_loopback()
                || addr.is_link_local()
                || addr.is_unspecified()
                || addr.is_broadcast()
                || addr.is_private()
        }
        Ok(IpAddr::V6(addr)) => {
            let first = addr.segments()[0];
            addr.is_loopback()
                || addr.is_unspecified()
                || (first & 0xffc0) == 0xfe80 // link-local
                || (first & 0xfe00) == 0xfc00 // unique-local
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_skipped() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.20.0.1",
            "192.168.1.10",
            "169.254.0.5",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:10.0.0.1",
            "not-an-ip",
        ] {
            assert!(is_private(ip), "{ip} should be private");
        }
    }

    #[test]
    fn public_addresses_are_looked_up() {
        for ip in ["8.8.8.8", "172.32.0.1", "2001:4860:4860::8888", "::ffff:1.1.1.1"] {
            assert!(!is_private(ip), "{ip} should be public");
        }
    }

    #[tokio::test]
    async fn disabled_locator_never_resolves() {
        let geo = GeoLocator::disabled();
        assert_eq!(geo.lookup("8.8.8.8").await, None);
    }
}
