//! Backend routes: canonical target identifiers and the route table.
//!
//! A route identifier is always `host:port` with a lowercase host, IPv6
//! literals in brackets and an explicit port. Registration (from a backend
//! URL) and lookup (from a decoded `direct-tcpip` target) both go through
//! [`RouteKey`], so the two paths cannot disagree.

use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::error::TunnelError;
use crate::listener::HandoffSender;
use crate::stream::TunnelStream;

/// Canonical identifier of a backend route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey(String);

impl RouteKey {
    /// Build a key from a host and port as sent by an SSH client.
    pub fn new(host: &str, port: u32) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = host.to_ascii_lowercase();
        if host.contains(':') {
            Self(format!("[{}]:{}", host, port))
        } else {
            Self(format!("{}:{}", host, port))
        }
    }

    /// Build a key from a configured backend URL.
    ///
    /// The port falls back to the scheme default (80 for http, 443 for https).
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Backend URL {} has no host", url))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("Backend URL {} has no port and no known default", url))?;
        Ok(Self::new(host, u32::from(port)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a configured backend URL.
pub fn parse_backend_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("Invalid backend URL: {}", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!("Unsupported backend scheme '{}' in {}", other, raw)),
    }
}

/// Read-only map from route identifier to the producer side of that
/// route's handoff queue.
///
/// Built once at startup and never mutated afterwards, so lookups need no
/// locking.
pub struct RouteTable<S = russh::ChannelStream<russh::server::Msg>> {
    routes: HashMap<RouteKey, HandoffSender<TunnelStream<S>>>,
}

impl<S> RouteTable<S> {
    pub fn new(routes: HashMap<RouteKey, HandoffSender<TunnelStream<S>>>) -> Self {
        Self { routes }
    }

    /// Resolve a decoded target to its route.
    pub fn lookup(&self, key: &RouteKey) -> Result<&HandoffSender<TunnelStream<S>>, TunnelError> {
        self.routes
            .get(key)
            .ok_or_else(|| TunnelError::RouteNotFound(key.to_string()))
    }

    /// Close every route's producer side. Safe to call more than once.
    pub fn close_all(&self) {
        for sender in self.routes.values() {
            sender.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_url_and_target_agree() {
        let url = parse_backend_url("http://Host-A:2222/some/path").unwrap();
        let from_url = RouteKey::from_url(&url).unwrap();
        let from_target = RouteKey::new("host-a", 2222);
        assert_eq!(from_url, from_target);
        assert_eq!(from_url.as_str(), "host-a:2222");
    }

    #[test]
    fn test_key_default_ports() {
        let http = parse_backend_url("http://backend.internal").unwrap();
        assert_eq!(RouteKey::from_url(&http).unwrap().as_str(), "backend.internal:80");

        let https = parse_backend_url("https://backend.internal/").unwrap();
        assert_eq!(
            RouteKey::from_url(&https).unwrap().as_str(),
            "backend.internal:443"
        );
    }

    #[test]
    fn test_key_ipv6() {
        let url = parse_backend_url("http://[::1]:8080").unwrap();
        assert_eq!(RouteKey::from_url(&url).unwrap().as_str(), "[::1]:8080");
        assert_eq!(RouteKey::new("::1", 8080).as_str(), "[::1]:8080");
        assert_eq!(RouteKey::new("[::1]", 8080).as_str(), "[::1]:8080");
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        assert!(parse_backend_url("ftp://host:21").is_err());
        assert!(parse_backend_url("not a url").is_err());
    }

    #[test]
    fn test_lookup_miss_is_route_not_found() {
        let table: RouteTable<tokio::io::DuplexStream> = RouteTable::new(HashMap::new());
        let err = table.lookup(&RouteKey::new("host-b", 2222)).unwrap_err();
        assert!(matches!(err, TunnelError::RouteNotFound(ref t) if t == "host-b:2222"));
    }
}
