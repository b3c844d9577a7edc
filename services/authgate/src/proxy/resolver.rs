//! Credential-to-route resolution against the lookup store.
//!
//! The resolver is the only component that talks to the store. A
//! connectivity failure gets exactly one more attempt; anything else is
//! final for the connection that asked.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::auth::Credentials;
use super::cache::Route;
use crate::store::{CredentialStore, StoreError};

/// Default lifetime of a resolved route.
pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Why a credential pair did not resolve to a route.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Unknown account or wrong password.
    #[error("authorization failed for account '{username}'")]
    AuthFailed { username: String },

    /// The store could not answer.
    #[error(transparent)]
    BackendUnavailable(StoreError),
}

/// Resolves credentials to routes through a [`CredentialStore`].
pub struct RouteResolver<S> {
    store: S,
    route_ttl: Duration,
}

impl<S: CredentialStore> RouteResolver<S> {
    pub fn new(store: S, route_ttl: Duration) -> Self {
        Self { store, route_ttl }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Look up `credentials.username` and validate the stored password.
    ///
    /// On success the route expires `route_ttl` from now.
    pub async fn resolve(&self, credentials: &Credentials) -> Result<Route, ResolveError> {
        let username = credentials.username.as_str();

        let record = match self.store.lookup(username).await {
            Ok(record) => record,
            Err(e) if e.is_retryable() => {
                warn!(username = %username, error = %e, "Lookup store unreachable, retrying once");
                self.store
                    .lookup(username)
                    .await
                    .map_err(ResolveError::BackendUnavailable)?
            }
            Err(e) => return Err(ResolveError::BackendUnavailable(e)),
        };

        let record = match record {
            Some(record) if record.password.as_bytes() == credentials.password.as_bytes() => record,
            Some(_) => {
                debug!(username = %username, "Password mismatch");
                return Err(ResolveError::AuthFailed {
                    username: username.to_string(),
                });
            }
            None => {
                debug!(username = %username, "Unknown account");
                return Err(ResolveError::AuthFailed {
                    username: username.to_string(),
                });
            }
        };

        Ok(Route {
            host: record.ip,
            port: record.port,
            protocol: record.protocol.unwrap_or_default(),
            expires_at: Instant::now() + self.route_ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HostRecord;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Store that replays a fixed script of answers.
    struct ScriptedStore {
        answers: Mutex<VecDeque<Result<Option<HostRecord>, StoreError>>>,
        calls: AtomicU32,
    }

    impl ScriptedStore {
        fn new(answers: Vec<Result<Option<HostRecord>, StoreError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialStore for ScriptedStore {
        async fn lookup(&self, _username: &str) -> Result<Option<HostRecord>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn record(password: &str) -> HostRecord {
        HostRecord {
            password: password.to_string(),
            ip: "10.0.0.5".to_string(),
            port: 6379,
            protocol: Some("redis".to_string()),
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable(sqlx::Error::PoolTimedOut)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_matching_password() {
        let resolver = RouteResolver::new(
            ScriptedStore::new(vec![Ok(Some(record("pass")))]),
            DEFAULT_ROUTE_TTL,
        );

        let route = resolver
            .resolve(&Credentials::new("user", "pass"))
            .await
            .unwrap();

        assert_eq!(route.host, "10.0.0.5");
        assert_eq!(route.port, 6379);
        assert_eq!(route.protocol, "redis");
        assert_eq!(route.expires_at, Instant::now() + DEFAULT_ROUTE_TTL);
        assert_eq!(resolver.store().calls(), 1);
    }

    #[tokio::test]
    async fn test_password_mismatch_is_auth_failure() {
        let resolver = RouteResolver::new(
            ScriptedStore::new(vec![Ok(Some(record("pass")))]),
            DEFAULT_ROUTE_TTL,
        );

        let err = resolver
            .resolve(&Credentials::new("user", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AuthFailed { ref username } if username == "user"));
    }

    #[tokio::test]
    async fn test_password_comparison_is_exact() {
        let resolver = RouteResolver::new(
            ScriptedStore::new(vec![Ok(Some(record("pass")))]),
            DEFAULT_ROUTE_TTL,
        );

        let err = resolver
            .resolve(&Credentials::new("user", "pass "))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_account_is_auth_failure() {
        let resolver = RouteResolver::new(ScriptedStore::new(vec![Ok(None)]), DEFAULT_ROUTE_TTL);

        let err = resolver
            .resolve(&Credentials::new("user", "pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AuthFailed { .. }));
        assert_eq!(resolver.store().calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_retried_once() {
        let resolver = RouteResolver::new(
            ScriptedStore::new(vec![Err(unavailable()), Ok(Some(record("pass")))]),
            DEFAULT_ROUTE_TTL,
        );

        let route = resolver
            .resolve(&Credentials::new("user", "pass"))
            .await
            .unwrap();
        assert_eq!(route.port, 6379);
        assert_eq!(resolver.store().calls(), 2);
    }

    #[tokio::test]
    async fn test_store_down_after_retry_is_backend_unavailable() {
        let resolver = RouteResolver::new(
            ScriptedStore::new(vec![Err(unavailable()), Err(unavailable()), Ok(None)]),
            DEFAULT_ROUTE_TTL,
        );

        let err = resolver
            .resolve(&Credentials::new("user", "pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::BackendUnavailable(_)));
        assert_eq!(resolver.store().calls(), 2);
    }

    #[tokio::test]
    async fn test_query_error_is_not_retried() {
        let resolver = RouteResolver::new(
            ScriptedStore::new(vec![Err(StoreError::Query(sqlx::Error::RowNotFound))]),
            DEFAULT_ROUTE_TTL,
        );

        let err = resolver
            .resolve(&Credentials::new("user", "pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::BackendUnavailable(_)));
        assert_eq!(resolver.store().calls(), 1);
    }
}
