//! Credential-gated TCP proxy.
//!
//! This module provides:
//! - Basic credential extraction and the 407 challenge
//! - Per-worker route cache keyed by a credential fingerprint
//! - Route resolution against the lookup store
//! - Frontend/backend pairing and relay
//! - Worker threads driving all of the above over tokio sockets
//!
//! ## Architecture
//!
//! ```text
//! Client -> Worker -> Router -> Cache hit?  -- yes --> Dial -> Backend
//!                        |                                 ^
//!                        +------- no --> Resolver -> Store-+
//! ```
//!
//! The router is written against the [`Reactor`] trait and never performs
//! I/O itself. [`Worker`] supplies the tokio implementation.
//!
//! ## Usage
//!
//! ```ignore
//! use authgate::proxy::{ProxyStats, WorkerConfig, WorkerPool};
//!
//! let listener = std::net::TcpListener::bind("0.0.0.0:9292")?;
//! let stats = Arc::new(ProxyStats::default());
//! let pool = WorkerPool::spawn(8, WorkerConfig::default(), listener, stats, |_| {
//!     Ok(MySqlStore::connect_lazy(&store_config)?)
//! })?;
//! ```

mod auth;
mod cache;
mod pairer;
mod reactor;
mod resolver;
mod router;
mod stats;
mod worker;

pub use auth::{
    challenge_response, extract_credentials, Credentials, AUTHORIZATION_MARKER,
    AUTH_FAILED_MESSAGE, BACKEND_UNREACHABLE_MESSAGE, STORE_UNAVAILABLE_MESSAGE,
};
pub use cache::{CredentialCache, Fingerprint, Route};
pub use pairer::{ConnectionPairer, Direction, FrontendState, Side};
pub use reactor::{ConnId, DialError, Reactor};
pub use resolver::{ResolveError, RouteResolver, DEFAULT_ROUTE_TTL};
pub use router::ProxyRouter;
pub use stats::{ProxyStats, ProxyStatsSnapshot};
pub use worker::{
    Worker, WorkerConfig, WorkerPool, DEFAULT_BUFFER_SIZE, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_REALM,
};
