//! The socket layer as seen by the router.
//!
//! The router never touches sockets. It reacts to accept/data/close
//! notifications and asks the reactor to send, close, dial and resolve.
//! Dials and resolutions complete later, as separate notifications back into
//! the router, so neither ever blocks the worker.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use super::auth::Credentials;
use super::cache::{Fingerprint, Route};

/// Worker-local connection identifier. Never reused within a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backend dial failure.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the router asks of the socket layer.
pub trait Reactor {
    /// Queue `data` for `conn`. Unknown connections are ignored.
    fn send(&mut self, conn: ConnId, data: Bytes);

    /// Close `conn` after flushing what was queued. Unknown connections are ignored.
    fn close(&mut self, conn: ConnId);

    /// Start dialing `route` on behalf of `frontend`.
    ///
    /// Completes with `ProxyRouter::on_dialed`.
    fn dial(&mut self, frontend: ConnId, route: &Route);

    /// Start resolving `credentials` on behalf of `frontend`.
    ///
    /// Completes with `ProxyRouter::on_resolved`.
    fn resolve(&mut self, frontend: ConnId, fingerprint: Fingerprint, credentials: Credentials);
}

/// Reactor fake that records every request in order.
#[cfg(test)]
pub(crate) mod recording {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Effect {
        Send(ConnId, Bytes),
        Close(ConnId),
        Dial { frontend: ConnId, authority: String },
        Resolve { frontend: ConnId, username: String },
    }

    #[derive(Debug, Default)]
    pub struct RecordingReactor {
        pub effects: Vec<Effect>,
    }

    impl RecordingReactor {
        pub fn take(&mut self) -> Vec<Effect> {
            std::mem::take(&mut self.effects)
        }

        pub fn closes(&self, conn: ConnId) -> usize {
            self.effects
                .iter()
                .filter(|e| **e == Effect::Close(conn))
                .count()
        }

        pub fn dials(&self) -> usize {
            self.effects
                .iter()
                .filter(|e| matches!(e, Effect::Dial { .. }))
                .count()
        }

        pub fn resolves(&self) -> usize {
            self.effects
                .iter()
                .filter(|e| matches!(e, Effect::Resolve { .. }))
                .count()
        }
    }

    impl Reactor for RecordingReactor {
        fn send(&mut self, conn: ConnId, data: Bytes) {
            self.effects.push(Effect::Send(conn, data));
        }

        fn close(&mut self, conn: ConnId) {
            self.effects.push(Effect::Close(conn));
        }

        fn dial(&mut self, frontend: ConnId, route: &Route) {
            self.effects.push(Effect::Dial {
                frontend,
                authority: route.authority(),
            });
        }

        fn resolve(
            &mut self,
            frontend: ConnId,
            _fingerprint: Fingerprint,
            credentials: Credentials,
        ) {
            self.effects.push(Effect::Resolve {
                frontend,
                username: credentials.username,
            });
        }
    }
}
