//! Frontend/backend pairing and close propagation.
//!
//! The pairer owns both pairing tables of a worker:
//! - frontends: every accepted client connection and where it is in its
//!   lifecycle (`Accepted → Resolving → Dialing → Relaying`)
//! - backends: every connected backend and the frontend it serves
//!
//! Chunks that arrive before the backend is connected are held and flushed
//! in order once it is. Nothing is ever sent to a backend before its dial
//! completed. Held bytes per frontend are capped; a frontend that overruns
//! the cap has to be aborted by the caller.
//!
//! Teardown is symmetric and idempotent. When the frontend goes away its
//! backend is marked `closing` and closed once; the backend entry stays until
//! the reactor reports that close, and is then dropped without touching the
//! frontend again. When a backend goes away on its own, its frontend is
//! closed once.

use std::collections::HashMap;

use bytes::Bytes;

use super::cache::Route;
use super::reactor::{ConnId, Reactor};

/// Default cap on bytes held for one frontend before its backend connects.
pub const DEFAULT_HOLD_LIMIT: usize = 128 * 1024;

/// Lifecycle of a frontend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendState {
    /// Waiting for the first chunk.
    Accepted,
    /// Credentials parsed, waiting for the store.
    Resolving,
    /// Route known, waiting for the backend connect.
    Dialing { route: Route },
    /// Paired with `backend`.
    Relaying { backend: ConnId },
}

/// Which side of a pair a connection was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Frontend,
    Backend,
}

/// Direction of a relayed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

#[derive(Debug)]
struct FrontendConn {
    state: FrontendState,
    pending: Vec<Bytes>,
    held: usize,
}

#[derive(Debug)]
struct BackendConn {
    frontend: ConnId,
    closing: bool,
}

/// Pairing tables for one worker.
#[derive(Debug)]
pub struct ConnectionPairer {
    frontends: HashMap<ConnId, FrontendConn>,
    backends: HashMap<ConnId, BackendConn>,
    hold_limit: usize,
}

impl Default for ConnectionPairer {
    fn default() -> Self {
        Self::with_hold_limit(DEFAULT_HOLD_LIMIT)
    }
}

impl ConnectionPairer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hold_limit(hold_limit: usize) -> Self {
        Self {
            frontends: HashMap::new(),
            backends: HashMap::new(),
            hold_limit,
        }
    }

    /// Register a freshly accepted frontend.
    pub fn accept(&mut self, frontend: ConnId) {
        self.frontends.insert(
            frontend,
            FrontendConn {
                state: FrontendState::Accepted,
                pending: Vec::new(),
                held: 0,
            },
        );
    }

    pub fn state(&self, frontend: ConnId) -> Option<&FrontendState> {
        self.frontends.get(&frontend).map(|conn| &conn.state)
    }

    /// The backend currently paired with `frontend`.
    pub fn backend_of(&self, frontend: ConnId) -> Option<ConnId> {
        match self.state(frontend)? {
            FrontendState::Relaying { backend } => Some(*backend),
            _ => None,
        }
    }

    /// The frontend served by `backend`, unless that pairing is already closing.
    pub fn frontend_of(&self, backend: ConnId) -> Option<ConnId> {
        self.backends
            .get(&backend)
            .filter(|conn| !conn.closing)
            .map(|conn| conn.frontend)
    }

    /// Hold `chunk` until the frontend's backend is connected.
    ///
    /// Returns false if the frontend is unknown, already relaying, or the
    /// chunk would take it past the hold limit. An overrun chunk is dropped.
    pub fn hold(&mut self, frontend: ConnId, chunk: Bytes) -> bool {
        let limit = self.hold_limit;
        match self.frontends.get_mut(&frontend) {
            Some(conn) if !matches!(conn.state, FrontendState::Relaying { .. }) => {
                if conn.held + chunk.len() > limit {
                    return false;
                }
                conn.held += chunk.len();
                conn.pending.push(chunk);
                true
            }
            _ => false,
        }
    }

    pub fn mark_resolving(&mut self, frontend: ConnId) -> bool {
        match self.frontends.get_mut(&frontend) {
            Some(conn) if conn.state == FrontendState::Accepted => {
                conn.state = FrontendState::Resolving;
                true
            }
            _ => false,
        }
    }

    /// Start dialing `route` for `frontend`.
    ///
    /// Returns false (and dials nothing) if the frontend is gone or already
    /// dialing or relaying.
    pub fn establish<R: Reactor>(&mut self, frontend: ConnId, route: Route, io: &mut R) -> bool {
        let Some(conn) = self.frontends.get_mut(&frontend) else {
            return false;
        };
        if !matches!(
            conn.state,
            FrontendState::Accepted | FrontendState::Resolving
        ) {
            return false;
        }

        io.dial(frontend, &route);
        conn.state = FrontendState::Dialing { route };
        true
    }

    /// Record a completed dial and flush held chunks to the backend.
    ///
    /// If the frontend went away while dialing, the new backend is closed
    /// right away and false is returned.
    pub fn connect<R: Reactor>(&mut self, frontend: ConnId, backend: ConnId, io: &mut R) -> bool {
        let Some(conn) = self
            .frontends
            .get_mut(&frontend)
            .filter(|conn| matches!(conn.state, FrontendState::Dialing { .. }))
        else {
            io.close(backend);
            return false;
        };

        conn.state = FrontendState::Relaying { backend };
        conn.held = 0;
        for chunk in conn.pending.drain(..) {
            io.send(backend, chunk);
        }
        self.backends.insert(
            backend,
            BackendConn {
                frontend,
                closing: false,
            },
        );
        true
    }

    /// Relay `chunk` from `source` to its peer verbatim.
    ///
    /// Returns `None` without sending anything when `source` has no live
    /// pairing.
    pub fn forward<R: Reactor>(
        &mut self,
        source: ConnId,
        chunk: Bytes,
        io: &mut R,
    ) -> Option<Direction> {
        if let Some(backend) = self.backend_of(source) {
            io.send(backend, chunk);
            return Some(Direction::Upstream);
        }
        if let Some(frontend) = self.frontend_of(source) {
            io.send(frontend, chunk);
            return Some(Direction::Downstream);
        }
        None
    }

    /// Send a final message to an unpaired frontend and close it.
    pub fn reject<R: Reactor>(&mut self, frontend: ConnId, message: Bytes, io: &mut R) -> bool {
        let Some(conn) = self.frontends.remove(&frontend) else {
            return false;
        };
        if let FrontendState::Relaying { backend } = conn.state {
            self.close_backend(backend, io);
        }
        io.send(frontend, message);
        io.close(frontend);
        true
    }

    /// Drop an unpaired frontend and close it without a message.
    pub fn abort<R: Reactor>(&mut self, frontend: ConnId, io: &mut R) -> bool {
        let Some(conn) = self.frontends.remove(&frontend) else {
            return false;
        };
        if let FrontendState::Relaying { backend } = conn.state {
            self.close_backend(backend, io);
        }
        io.close(frontend);
        true
    }

    /// Handle the close of `conn`, closing its peer at most once.
    ///
    /// Safe to call any number of times; unknown connections return `None`.
    pub fn teardown<R: Reactor>(&mut self, conn: ConnId, io: &mut R) -> Option<Side> {
        if let Some(frontend) = self.frontends.remove(&conn) {
            if let FrontendState::Relaying { backend } = frontend.state {
                self.close_backend(backend, io);
            }
            return Some(Side::Frontend);
        }

        let backend = self.backends.remove(&conn)?;
        if !backend.closing {
            let paired = matches!(
                self.frontends.get(&backend.frontend).map(|f| &f.state),
                Some(FrontendState::Relaying { backend: b }) if *b == conn
            );
            if paired {
                self.frontends.remove(&backend.frontend);
                io.close(backend.frontend);
            }
        }
        Some(Side::Backend)
    }

    fn close_backend<R: Reactor>(&mut self, backend: ConnId, io: &mut R) {
        if let Some(peer) = self.backends.get_mut(&backend) {
            if !peer.closing {
                peer.closing = true;
                io.close(backend);
            }
        }
    }

    pub fn frontend_count(&self) -> usize {
        self.frontends.len()
    }

    /// Backends still tracked, including ones waiting for their close.
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frontends.is_empty() && self.backends.is_empty()
    }
}
