pub mod config;
pub mod logging;
pub mod proxy;
pub mod store;

pub use config::Config;
pub use proxy::{
    ConnId, Credentials, ProxyRouter, ProxyStats, Route, RouteResolver, WorkerConfig, WorkerPool,
};
pub use store::{CredentialStore, HostRecord, MySqlStore, StoreConfig, StoreError};
