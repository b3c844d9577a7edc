//! Per-worker connection router.
//!
//! The router turns reactor notifications into pairer operations:
//! - the first chunk of a frontend goes through the auth gate, then the
//!   cache or the resolver, then a backend dial
//! - chunks that arrive while resolving or dialing are held, up to a limit
//! - frontends presenting a fingerprint that is already being resolved wait
//!   for that resolution instead of starting another one
//! - every later chunk, in either direction, is relayed verbatim
//! - a close on either side tears the pair down
//!
//! All failures are scoped to the connection that caused them: the client
//! gets a short message and the connection is closed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::auth::{
    challenge_response, extract_credentials, AUTH_FAILED_MESSAGE, BACKEND_UNREACHABLE_MESSAGE,
    STORE_UNAVAILABLE_MESSAGE,
};
use super::cache::{CredentialCache, Fingerprint, Route};
use super::pairer::{ConnectionPairer, Direction, FrontendState, Side};
use super::reactor::{ConnId, DialError, Reactor};
use super::resolver::ResolveError;
use super::stats::ProxyStats;

/// Routing state owned by a single worker.
pub struct ProxyRouter {
    worker: usize,
    pairer: ConnectionPairer,
    cache: CredentialCache,
    /// Frontends waiting on a resolution, keyed by the fingerprint resolved.
    inflight: HashMap<Fingerprint, Vec<ConnId>>,
    challenge: Bytes,
    stats: Arc<ProxyStats>,
}

impl ProxyRouter {
    pub fn new(worker: usize, realm: &str, stats: Arc<ProxyStats>) -> Self {
        Self {
            worker,
            pairer: ConnectionPairer::new(),
            cache: CredentialCache::new(),
            inflight: HashMap::new(),
            challenge: challenge_response(realm),
            stats,
        }
    }

    /// Cap the bytes held for a frontend before its backend connects.
    pub fn with_hold_limit(mut self, hold_limit: usize) -> Self {
        self.pairer = ConnectionPairer::with_hold_limit(hold_limit);
        self
    }

    pub fn pairer(&self) -> &ConnectionPairer {
        &self.pairer
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    pub fn on_accept(&mut self, conn: ConnId) {
        self.pairer.accept(conn);
        trace!(worker = self.worker, conn = %conn, "Frontend registered");
    }

    pub fn on_data<R: Reactor>(&mut self, conn: ConnId, chunk: Bytes, io: &mut R) {
        match self.pairer.state(conn) {
            Some(FrontendState::Accepted) => self.authenticate(conn, chunk, io),
            Some(FrontendState::Resolving) | Some(FrontendState::Dialing { .. }) => {
                self.hold(conn, chunk, io);
            }
            Some(FrontendState::Relaying { .. }) | None => self.relay(conn, chunk, io),
        }
    }

    pub fn on_close<R: Reactor>(&mut self, conn: ConnId, io: &mut R) {
        match self.pairer.teardown(conn, io) {
            Some(Side::Frontend) => debug!(worker = self.worker, conn = %conn, "Frontend closed"),
            Some(Side::Backend) => debug!(worker = self.worker, conn = %conn, "Backend closed"),
            None => trace!(worker = self.worker, conn = %conn, "Close for untracked connection"),
        }
    }

    /// Completion of a resolution started with [`Reactor::resolve`].
    ///
    /// The outcome applies to every frontend that joined the resolution.
    pub fn on_resolved<R: Reactor>(
        &mut self,
        frontend: ConnId,
        fingerprint: Fingerprint,
        outcome: Result<Route, ResolveError>,
        io: &mut R,
    ) {
        let waiters = self
            .inflight
            .remove(&fingerprint)
            .unwrap_or_else(|| vec![frontend]);

        match outcome {
            Ok(route) => {
                debug!(
                    worker = self.worker,
                    conn = %frontend,
                    backend_addr = %route.authority(),
                    protocol = %route.protocol,
                    waiters = waiters.len(),
                    "Route resolved"
                );
                self.cache.store(fingerprint, route.clone());
                for waiter in waiters {
                    if self.pairer.state(waiter) != Some(&FrontendState::Resolving) {
                        debug!(
                            worker = self.worker,
                            conn = %waiter,
                            "Frontend closed before resolution completed"
                        );
                        continue;
                    }
                    self.pairer.establish(waiter, route.clone(), io);
                }
            }
            Err(ResolveError::AuthFailed { username }) => {
                warn!(
                    worker = self.worker,
                    conn = %frontend,
                    username = %username,
                    waiters = waiters.len(),
                    "Basic authorization failed"
                );
                for waiter in waiters {
                    if self
                        .pairer
                        .reject(waiter, Bytes::from_static(AUTH_FAILED_MESSAGE), io)
                    {
                        ProxyStats::incr(&self.stats.auth_failures);
                    }
                }
            }
            Err(ResolveError::BackendUnavailable(e)) => {
                error!(
                    worker = self.worker,
                    conn = %frontend,
                    error = %e,
                    waiters = waiters.len(),
                    "Lookup store unavailable"
                );
                for waiter in waiters {
                    if self
                        .pairer
                        .reject(waiter, Bytes::from_static(STORE_UNAVAILABLE_MESSAGE), io)
                    {
                        ProxyStats::incr(&self.stats.store_failures);
                    }
                }
            }
        }
    }

    /// Completion of a dial started with [`Reactor::dial`].
    pub fn on_dialed<R: Reactor>(
        &mut self,
        frontend: ConnId,
        outcome: Result<ConnId, DialError>,
        io: &mut R,
    ) {
        let backend_addr = match self.pairer.state(frontend) {
            Some(FrontendState::Dialing { route }) => route.authority(),
            _ => String::from("-"),
        };

        match outcome {
            Ok(backend) => {
                if self.pairer.connect(frontend, backend, io) {
                    ProxyStats::incr(&self.stats.backend_connected);
                    debug!(
                        worker = self.worker,
                        conn = %frontend,
                        backend = %backend,
                        backend_addr = %backend_addr,
                        "Connected to backend"
                    );
                } else {
                    debug!(
                        worker = self.worker,
                        conn = %frontend,
                        backend = %backend,
                        "Frontend closed while dialing, dropping backend"
                    );
                }
            }
            Err(e) => {
                ProxyStats::incr(&self.stats.backend_failed);
                error!(
                    worker = self.worker,
                    conn = %frontend,
                    backend_addr = %backend_addr,
                    error = %e,
                    "Backend connection failed"
                );
                self.pairer
                    .reject(frontend, Bytes::from_static(BACKEND_UNREACHABLE_MESSAGE), io);
            }
        }
    }

    fn authenticate<R: Reactor>(&mut self, conn: ConnId, chunk: Bytes, io: &mut R) {
        let Some(credentials) = extract_credentials(&chunk) else {
            ProxyStats::incr(&self.stats.challenges_sent);
            debug!(
                worker = self.worker,
                conn = %conn,
                "No credentials in first chunk, sending challenge"
            );
            self.pairer.reject(conn, self.challenge.clone(), io);
            return;
        };

        // The first chunk goes to the backend verbatim, credentials included.
        if !self.hold(conn, chunk, io) {
            return;
        }

        let fingerprint = Fingerprint::of(&credentials);
        match self.cache.lookup(&fingerprint, Instant::now()) {
            Some(route) => {
                ProxyStats::incr(&self.stats.cache_hits);
                debug!(
                    worker = self.worker,
                    conn = %conn,
                    username = %credentials.username,
                    backend_addr = %route.authority(),
                    "Route cache hit"
                );
                self.pairer.establish(conn, route, io);
            }
            None => {
                self.pairer.mark_resolving(conn);
                if let Some(waiters) = self.inflight.get_mut(&fingerprint) {
                    waiters.push(conn);
                    debug!(
                        worker = self.worker,
                        conn = %conn,
                        username = %credentials.username,
                        fingerprint = %fingerprint,
                        "Route cache miss, joining resolution in flight"
                    );
                    return;
                }

                ProxyStats::incr(&self.stats.resolutions);
                debug!(
                    worker = self.worker,
                    conn = %conn,
                    username = %credentials.username,
                    fingerprint = %fingerprint,
                    "Route cache miss, resolving"
                );
                self.inflight.insert(fingerprint, vec![conn]);
                io.resolve(conn, fingerprint, credentials);
            }
        }
    }

    /// Hold a chunk for an unpaired frontend, aborting it past the hold limit.
    fn hold<R: Reactor>(&mut self, conn: ConnId, chunk: Bytes, io: &mut R) -> bool {
        let len = chunk.len();
        if self.pairer.hold(conn, chunk) {
            return true;
        }
        warn!(
            worker = self.worker,
            conn = %conn,
            bytes = len,
            "Too much data before backend connected, closing"
        );
        self.pairer.abort(conn, io);
        false
    }

    fn relay<R: Reactor>(&mut self, conn: ConnId, chunk: Bytes, io: &mut R) {
        let len = chunk.len() as u64;
        match self.pairer.forward(conn, chunk, io) {
            Some(Direction::Upstream) => ProxyStats::add(&self.stats.bytes_to_backend, len),
            Some(Direction::Downstream) => ProxyStats::add(&self.stats.bytes_from_backend, len),
            None => trace!(
                worker = self.worker,
                conn = %conn,
                bytes = len,
                "Dropping chunk for unpaired connection"
            ),
        }
    }
}
