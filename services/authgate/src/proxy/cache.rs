//! Per-worker credential cache.
//!
//! Maps a credential fingerprint to the route it resolved to. Entries are
//! never swept: an expired entry reads as a miss and is overwritten by the
//! next successful resolution.
//!
//! Each worker owns its own cache. A credential resolved on one worker is
//! resolved again the first time it shows up on another worker.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::auth::Credentials;

/// Fixed-length cache key derived from a credential pair.
///
/// The username is length-prefixed before hashing so that `("ab", "c")` and
/// `("a", "bc")` produce different fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(credentials: &Credentials) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((credentials.username.len() as u64).to_be_bytes());
        hasher.update(credentials.username.as_bytes());
        hasher.update(credentials.password.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// A resolved backend target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub expires_at: Instant,
}

impl Route {
    /// Whether the route must no longer be used at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Fingerprint-to-route mapping with expiry on read.
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: HashMap<Fingerprint, Route>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live route for `fingerprint`, treating expired entries as absent.
    pub fn lookup(&self, fingerprint: &Fingerprint, now: Instant) -> Option<Route> {
        self.entries
            .get(fingerprint)
            .filter(|route| !route.is_expired_at(now))
            .cloned()
    }

    pub fn store(&mut self, fingerprint: Fingerprint, route: Route) {
        self.entries.insert(fingerprint, route);
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
