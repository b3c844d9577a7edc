//! Process-wide proxy counters.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Counters shared by all workers.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Frontend connections accepted.
    pub connections_accepted: AtomicU64,
    /// Frontend connections currently open.
    pub connections_active: AtomicU64,
    /// Frontend connections dropped at the per-worker limit.
    pub connections_rejected: AtomicU64,
    /// 407 challenges sent.
    pub challenges_sent: AtomicU64,
    /// Routes served from a worker's cache.
    pub cache_hits: AtomicU64,
    /// Store resolutions started.
    pub resolutions: AtomicU64,
    /// Unknown accounts or wrong passwords.
    pub auth_failures: AtomicU64,
    /// Lookup store unavailable.
    pub store_failures: AtomicU64,
    /// Backend connections established.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed or timed out.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub challenges_sent: u64,
    pub cache_hits: u64,
    pub resolutions: u64,
    pub auth_failures: u64,
    pub store_failures: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl ProxyStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            challenges_sent: self.challenges_sent.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            backend_connected: self.backend_connected.load(Ordering::Relaxed),
            backend_failed: self.backend_failed.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as one structured event.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            connections_accepted = s.connections_accepted,
            connections_active = s.connections_active,
            connections_rejected = s.connections_rejected,
            challenges_sent = s.challenges_sent,
            cache_hits = s.cache_hits,
            resolutions = s.resolutions,
            auth_failures = s.auth_failures,
            store_failures = s.store_failures,
            backend_connected = s.backend_connected,
            backend_failed = s.backend_failed,
            bytes_to_backend = s.bytes_to_backend,
            bytes_from_backend = s.bytes_from_backend,
            "Proxy statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ProxyStats::default();
        ProxyStats::incr(&stats.connections_accepted);
        ProxyStats::add(&stats.bytes_to_backend, 42);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 1);
        assert_eq!(snapshot.bytes_to_backend, 42);
        assert_eq!(snapshot.auth_failures, 0);
    }
}
