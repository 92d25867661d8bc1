//! One live session per origin
//!
//! Each connection is attributed to an origin key derived from the address it
//! came from. While a connection from an origin is alive, further attempts
//! from the same origin are turned away. Deployments behind a reverse proxy
//! see every client with the proxy's address, so forwarding headers take
//! precedence over the transport peer address.

use log::debug;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::http::HeaderMap;

/// Headers consulted, in order, before falling back to the peer address
const FORWARDING_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

/// Derives the origin key for a connection
///
/// `X-Forwarded-For` may carry a proxy chain; the first hop is the client.
/// The peer port is dropped so reconnects from a new source port still map
/// to the same origin.
pub fn origin_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    for name in FORWARDING_HEADERS {
        let forwarded = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        if let Some(address) = forwarded {
            return address.to_string();
        }
    }
    peer.ip().to_string()
}

/// Tracks which origins currently hold a session slot
///
/// `try_admit` and `release` are not synchronized internally; the relay calls
/// them under the same lock that guards the player store, which makes the
/// check-and-insert atomic with respect to concurrent connects.
#[derive(Debug)]
pub struct SessionGuard {
    slots: HashSet<String>,
    enforce: bool,
}

impl SessionGuard {
    /// Guard that allows one session per origin
    pub fn new() -> Self {
        Self {
            slots: HashSet::new(),
            enforce: true,
        }
    }

    /// Guard that admits everything, for single-origin testing
    pub fn permissive() -> Self {
        Self {
            slots: HashSet::new(),
            enforce: false,
        }
    }

    /// Claims the slot for `origin`. Returns false if it is already held.
    pub fn try_admit(&mut self, origin: &str) -> bool {
        if !self.enforce {
            return true;
        }
        let admitted = self.slots.insert(origin.to_string());
        if !admitted {
            debug!("Origin {} already holds a session", origin);
        }
        admitted
    }

    /// Frees the slot for `origin`. Releasing an absent slot is a no-op.
    pub fn release(&mut self, origin: &str) {
        self.slots.remove(origin);
    }

    pub fn is_held(&self, origin: &str) -> bool {
        self.slots.contains(origin)
    }
}

#[cfg(test)]
impl SessionGuard {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.5:51234".parse().unwrap()
    }

    #[test]
    fn test_origin_from_peer_address() {
        let headers = HeaderMap::new();
        assert_eq!(origin_key(&headers, peer()), "10.0.0.5");
    }

    #[test]
    fn test_origin_ignores_peer_port() {
        let headers = HeaderMap::new();
        let other_port: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        assert_eq!(origin_key(&headers, peer()), origin_key(&headers, other_port));
    }

    #[test]
    fn test_origin_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.1.1.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(origin_key(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn test_origin_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(origin_key(&headers, peer()), "198.51.100.2");
    }

    #[test]
    fn test_origin_ipv6_peer() {
        let headers = HeaderMap::new();
        let v6: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(origin_key(&headers, v6), "::1");
    }

    #[test]
    fn test_admit_and_reject() {
        let mut guard = SessionGuard::new();
        assert!(guard.try_admit("1.2.3.4"));
        assert!(!guard.try_admit("1.2.3.4"));
        assert!(guard.try_admit("5.6.7.8"));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_release_allows_readmission() {
        let mut guard = SessionGuard::new();
        assert!(guard.try_admit("1.2.3.4"));
        guard.release("1.2.3.4");
        assert!(!guard.is_held("1.2.3.4"));
        assert!(guard.try_admit("1.2.3.4"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut guard = SessionGuard::new();
        guard.release("never-admitted");
        assert!(guard.try_admit("1.2.3.4"));
        guard.release("1.2.3.4");
        guard.release("1.2.3.4");
        assert!(guard.is_empty());
    }

    #[test]
    fn test_permissive_guard_admits_everything() {
        let mut guard = SessionGuard::permissive();
        assert!(guard.try_admit("1.2.3.4"));
        assert!(guard.try_admit("1.2.3.4"));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_concurrent_admits_same_origin() {
        for _ in 0..50 {
            let guard = Arc::new(Mutex::new(SessionGuard::new()));
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let guard = Arc::clone(&guard);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        guard.lock().unwrap().try_admit("192.0.2.1")
                    })
                })
                .collect();

            let admitted = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|admitted| *admitted)
                .count();
            assert_eq!(admitted, 1);
        }
    }
}
