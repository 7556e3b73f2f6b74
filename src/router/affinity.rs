//! Sticky-session support for backend routing.
//!
//! Two affinity modes exist: a `MPP.Route` cookie naming the backend that
//! served the session, and a bounded source-IP route cache. Affinity only
//! applies while the selection holds more than one backend; with a single
//! backend routing is trivially sticky and no cookie is ever written.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};

use cookie::Cookie;
use http::HeaderMap;
use http::header::{COOKIE, SET_COOKIE};
use lru::LruCache;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::metrics::RouterMetrics;

/// Cookie naming the backend that served this session.
pub const ROUTE_COOKIE: &str = "MPP.Route";

const IP_ROUTE_CAPACITY: usize = 256;

/// Process-wide source-IP route cache, bounded to 256 entries.
static IP_ROUTES: LazyLock<Mutex<LruCache<u64, Url>>> = LazyLock::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(IP_ROUTE_CAPACITY).expect("capacity is non-zero"),
    ))
});

/// Supported session-affinity modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityOption {
    Cookies,
    SourceIp,
}

impl AffinityOption {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cookies => "cookies",
            Self::SourceIp => "sourceip",
        }
    }
}

impl std::fmt::Display for AffinityOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("'{0}' is not a valid affinity option")]
pub struct ParseAffinityOptionError(String);

impl FromStr for AffinityOption {
    type Err = ParseAffinityOptionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cookies" => Ok(Self::Cookies),
            "sourceip" => Ok(Self::SourceIp),
            other => Err(ParseAffinityOptionError(other.to_string())),
        }
    }
}

/// Per-request sticky-session lookup and save over the enabled modes.
#[derive(Debug, Clone, Default)]
pub struct AffinityProvider {
    cookies_enabled: bool,
    source_ip_enabled: bool,
}

impl AffinityProvider {
    pub fn new(options: &[AffinityOption]) -> Self {
        let mut provider = Self::default();
        for option in options {
            match option {
                AffinityOption::Cookies => provider.cookies_enabled = true,
                AffinityOption::SourceIp => provider.source_ip_enabled = true,
            }
        }
        provider
    }

    pub fn cookies_enabled(&self) -> bool {
        self.cookies_enabled
    }

    /// Locate the preferred target for this request, if any.
    ///
    /// Only consulted when the selection has more than one member: the route
    /// cookie wins if its target is still selected, then the source-IP cache.
    pub fn preferred_target(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<IpAddr>,
        selection: &[Url],
        metrics: &RouterMetrics,
    ) -> Option<Url> {
        if selection.len() <= 1 {
            return None;
        }
        if self.cookies_enabled {
            if let Some(cookie_url) = route_cookie(headers) {
                if let Some(target) = selection.iter().find(|url| same_backend(url, &cookie_url)) {
                    metrics.record_affinity_hit(AffinityOption::Cookies);
                    return Some(target.clone());
                }
                debug!(target = %cookie_url, "sticky cookie target is no longer selected");
            }
        }
        if self.source_ip_enabled {
            let key = source_ip_key(headers, remote_addr);
            let cached = IP_ROUTES
                .lock()
                .expect("ip route cache poisoned")
                .get(&key)
                .cloned();
            if let Some(url) = cached {
                metrics.record_affinity_hit(AffinityOption::SourceIp);
                return Some(url);
            }
        }
        None
    }

    /// Remember the backend this request was routed to.
    pub fn save_preferred_target(
        &self,
        response_headers: &mut HeaderMap,
        request_headers: &HeaderMap,
        remote_addr: Option<IpAddr>,
        routed: &Url,
        needs_cookie: bool,
    ) {
        if needs_cookie {
            let backend = backend_of(routed);
            let cookie = Cookie::build((ROUTE_COOKIE, backend.clone()))
                .http_only(true)
                .build();
            if let Ok(value) = cookie.to_string().parse() {
                debug!(%backend, "setting route cookie");
                response_headers.append(SET_COOKIE, value);
            }
        }
        if self.source_ip_enabled {
            IP_ROUTES
                .lock()
                .expect("ip route cache poisoned")
                .put(source_ip_key(request_headers, remote_addr), routed.clone());
        }
    }
}

/// The `<scheme>://<host[:port]>` form used in cookies, headers, and metric
/// labels.
pub fn backend_of(url: &Url) -> String {
    format!("{}://{}", url.scheme(), url.authority())
}

/// Two URLs name the same backend when scheme and authority agree.
pub fn same_backend(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.authority() == b.authority()
}

fn route_cookie(headers: &HeaderMap) -> Option<Url> {
    let header = headers.get(COOKIE)?.to_str().ok()?;
    for cookie in Cookie::split_parse(header).flatten() {
        if cookie.name() != ROUTE_COOKIE {
            continue;
        }
        match Url::parse(cookie.value()) {
            Ok(url) => return Some(url),
            Err(err) => {
                error!(value = cookie.value(), error = %err,
                    "sticky cookie contained an unparsable url");
                return None;
            }
        }
    }
    None
}

/// Derive the source-IP cache key: `X-Forwarded-For` when present, else the
/// peer address. IPv4 octets big-endian; anything else collapses to key 0.
fn source_ip_key(headers: &HeaderMap, remote_addr: Option<IpAddr>) -> u64 {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let ip = match forwarded {
        Some(list) => list
            .split(',')
            .next()
            .and_then(|first| first.trim().parse().ok()),
        None => remote_addr,
    };
    match ip {
        Some(IpAddr::V4(v4)) => u64::from(u32::from_be_bytes(v4.octets())),
        _ => 0,
    }
}
