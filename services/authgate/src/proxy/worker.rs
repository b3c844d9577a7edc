//! Worker threads and the tokio-backed reactor.
//!
//! Every worker is an OS thread running a `current_thread` runtime with a
//! `LocalSet`. All workers accept from clones of one listening socket, so
//! the kernel spreads connections across them and a connection never moves.
//!
//! Inside a worker:
//! - each socket gets one local task that reads chunks into the worker's
//!   event queue and writes whatever the router queued for it
//! - dials and store lookups run as local tasks that post their completion
//!   back into the same queue
//! - a single loop drains the queue into the [`ProxyRouter`], so routing
//!   callbacks never interleave

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::LocalSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::auth::Credentials;
use super::cache::{Fingerprint, Route};
use super::reactor::{ConnId, DialError, Reactor};
use super::resolver::{ResolveError, RouteResolver, DEFAULT_ROUTE_TTL};
use super::router::ProxyRouter;
use super::stats::ProxyStats;
use crate::store::CredentialStore;

/// Default maximum concurrent frontend connections per worker.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default bound on a backend dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Default size of a single socket read.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default realm announced in the 407 challenge.
pub const DEFAULT_REALM: &str = "authgate";

/// Chunks a connection may have queued for writing before it is dropped.
pub const OUTBOUND_QUEUE_CHUNKS: usize = 256;

/// Bytes held per frontend before its backend connects, in read buffers.
const HOLD_LIMIT_BUFFERS: usize = 4;

/// Configuration shared by all workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent frontend connections per worker.
    pub max_connections: usize,
    /// Bound on a backend dial.
    pub dial_timeout: Duration,
    /// Lifetime of a resolved route.
    pub route_ttl: Duration,
    /// Size of a single socket read.
    pub buffer_size: usize,
    /// Realm announced in the 407 challenge.
    pub realm: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            route_ttl: DEFAULT_ROUTE_TTL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            realm: DEFAULT_REALM.to_string(),
        }
    }
}

/// Completions and socket notifications, drained by the worker loop.
enum WorkerEvent {
    Data {
        conn: ConnId,
        chunk: Bytes,
    },
    Closed {
        conn: ConnId,
    },
    Resolved {
        frontend: ConnId,
        fingerprint: Fingerprint,
        outcome: Result<Route, ResolveError>,
    },
    Dialed {
        frontend: ConnId,
        backend_addr: String,
        outcome: Result<TcpStream, DialError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Frontend,
    Backend,
}

/// [`Reactor`] implementation over tokio sockets.
struct TokioReactor<S> {
    next_id: u64,
    /// Write queues. Dropping a sender closes the connection once its queue drains.
    conns: HashMap<ConnId, mpsc::Sender<Bytes>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    resolver: Rc<RouteResolver<S>>,
    dial_timeout: Duration,
    buffer_size: usize,
    stats: Arc<ProxyStats>,
}

impl<S: CredentialStore> TokioReactor<S> {
    fn allocate(&mut self) -> ConnId {
        let conn = ConnId::new(self.next_id);
        self.next_id += 1;
        conn
    }

    /// Start the I/O task for `stream` under `conn`.
    fn attach(
        &mut self,
        conn: ConnId,
        stream: TcpStream,
        role: Role,
        permit: Option<OwnedSemaphorePermit>,
        span: Span,
    ) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CHUNKS);
        self.conns.insert(conn, tx);

        let task = ConnectionTask {
            conn,
            role,
            buffer_size: self.buffer_size,
            events: self.events.clone(),
            stats: Arc::clone(&self.stats),
            _permit: permit,
        };
        tokio::task::spawn_local(task.run(stream, rx).instrument(span));
    }

    /// Forget a connection whose task has ended.
    fn detach(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
    }
}

impl<S: CredentialStore> Reactor for TokioReactor<S> {
    fn send(&mut self, conn: ConnId, data: Bytes) {
        let Some(tx) = self.conns.get(&conn) else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(data) {
            warn!(conn = %conn, "Write queue full, closing connection");
            self.conns.remove(&conn);
        }
    }

    fn close(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
    }

    fn dial(&mut self, frontend: ConnId, route: &Route) {
        let events = self.events.clone();
        let host = route.host.clone();
        let port = route.port;
        let backend_addr = route.authority();
        let limit = self.dial_timeout;

        tokio::task::spawn_local(async move {
            let outcome = dial_backend(&host, port, limit).await;
            let _ = events.send(WorkerEvent::Dialed {
                frontend,
                backend_addr,
                outcome,
            });
        });
    }

    fn resolve(&mut self, frontend: ConnId, fingerprint: Fingerprint, credentials: Credentials) {
        let events = self.events.clone();
        let resolver = Rc::clone(&self.resolver);

        tokio::task::spawn_local(async move {
            let outcome = resolver.resolve(&credentials).await;
            let _ = events.send(WorkerEvent::Resolved {
                frontend,
                fingerprint,
                outcome,
            });
        });
    }
}

/// Connect to a backend, treating the bound like any other failure.
async fn dial_backend(host: &str, port: u16, limit: Duration) -> Result<TcpStream, DialError> {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(DialError::Io(e)),
        Err(_) => Err(DialError::Timeout(limit)),
    }
}

/// I/O for one socket: reads become events, queued writes are flushed.
struct ConnectionTask {
    conn: ConnId,
    role: Role,
    buffer_size: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
    stats: Arc<ProxyStats>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionTask {
    async fn run(self, mut stream: TcpStream, mut outbound: mpsc::Receiver<Bytes>) {
        let conn = self.conn;
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                queued = outbound.recv() => match queued {
                    Some(data) => {
                        if let Err(e) = stream.write_all(&data).await {
                            debug!(conn = %conn, error = %e, "Write failed");
                            break;
                        }
                    }
                    None => break,
                },
                read = stream.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if self.events.send(WorkerEvent::Data { conn, chunk }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(conn = %conn, error = %e, "Read failed");
                        break;
                    }
                },
            }
        }

        let _ = stream.shutdown().await;
        if self.role == Role::Frontend {
            self.stats.connections_active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        let _ = self.events.send(WorkerEvent::Closed { conn });
        debug!(conn = %conn, role = ?self.role, "Connection task finished");
    }
}

/// One single-threaded proxy worker.
pub struct Worker<S> {
    id: usize,
    router: ProxyRouter,
    reactor: TokioReactor<S>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ProxyStats>,
}

impl<S: CredentialStore> Worker<S> {
    pub fn new(id: usize, config: &WorkerConfig, store: S, stats: Arc<ProxyStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let resolver = Rc::new(RouteResolver::new(store, config.route_ttl));

        Self {
            id,
            router: ProxyRouter::new(id, &config.realm, Arc::clone(&stats))
                .with_hold_limit(config.buffer_size.max(1) * HOLD_LIMIT_BUFFERS),
            reactor: TokioReactor {
                next_id: 1,
                conns: HashMap::new(),
                events: tx,
                resolver,
                dial_timeout: config.dial_timeout,
                buffer_size: config.buffer_size.max(1),
                stats: Arc::clone(&stats),
            },
            events: rx,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            stats,
        }
    }

    /// Run until `shutdown` flips to true. Must be polled inside a `LocalSet`.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(worker = self.id, bind_addr = %local_addr, "Worker started");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                    Err(e) => {
                        error!(worker = self.id, error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(event) = self.events.recv() => self.dispatch(event),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            worker = self.id,
            open_frontends = self.router.pairer().frontend_count(),
            open_backends = self.router.pairer().backend_count(),
            cached_routes = self.router.cache().len(),
            "Worker stopped"
        );
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                ProxyStats::incr(&self.stats.connections_rejected);
                warn!(
                    worker = self.id,
                    peer_addr = %peer_addr,
                    "Connection rejected: max connections reached"
                );
                return;
            }
        };

        ProxyStats::incr(&self.stats.connections_accepted);
        ProxyStats::incr(&self.stats.connections_active);
        let _ = stream.set_nodelay(true);

        let conn = self.reactor.allocate();
        let span =
            tracing::info_span!("connection", worker = self.id, conn = %conn, peer = %peer_addr);
        debug!(parent: &span, "Accepted connection");

        self.router.on_accept(conn);
        self.reactor
            .attach(conn, stream, Role::Frontend, Some(permit), span);
    }

    fn dispatch(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Data { conn, chunk } => {
                self.router.on_data(conn, chunk, &mut self.reactor);
            }
            WorkerEvent::Closed { conn } => {
                self.reactor.detach(conn);
                self.router.on_close(conn, &mut self.reactor);
            }
            WorkerEvent::Resolved {
                frontend,
                fingerprint,
                outcome,
            } => {
                self.router
                    .on_resolved(frontend, fingerprint, outcome, &mut self.reactor);
            }
            WorkerEvent::Dialed {
                frontend,
                backend_addr,
                outcome,
            } => {
                let outcome = outcome.map(|stream| {
                    let backend = self.reactor.allocate();
                    let span = tracing::info_span!(
                        "backend",
                        worker = self.id,
                        conn = %backend,
                        frontend = %frontend,
                        addr = %backend_addr
                    );
                    self.reactor
                        .attach(backend, stream, Role::Backend, None, span);
                    backend
                });
                self.router.on_dialed(frontend, outcome, &mut self.reactor);
            }
        }
    }
}

/// A fixed set of worker threads sharing one listening socket.
pub struct WorkerPool {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads accepting from `listener`.
    ///
    /// `make_store` runs on each worker thread, inside that worker's runtime,
    /// so every worker gets its own store connections.
    pub fn spawn<S, F>(
        workers: usize,
        config: WorkerConfig,
        listener: std::net::TcpListener,
        stats: Arc<ProxyStats>,
        make_store: F,
    ) -> Result<Self>
    where
        S: CredentialStore,
        F: Fn(usize) -> Result<S> + Send + Sync + 'static,
    {
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let local_addr = listener.local_addr()?;

        let make_store = Arc::new(make_store);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut threads = Vec::with_capacity(workers);

        for id in 0..workers.max(1) {
            let socket = listener
                .try_clone()
                .context("Failed to clone listening socket")?;
            let config = config.clone();
            let stats = Arc::clone(&stats);
            let make_store = Arc::clone(&make_store);
            let shutdown_rx = shutdown_rx.clone();

            let handle = thread::Builder::new()
                .name(format!("authgate-worker-{}", id))
                .spawn(move || {
                    let store = make_store.as_ref();
                    if let Err(e) = run_worker(id, config, socket, stats, store, shutdown_rx) {
                        error!(worker = id, error = %e, "Worker failed");
                    }
                })
                .context("Failed to spawn worker thread")?;
            threads.push(handle);
        }

        info!(bind_addr = %local_addr, workers = threads.len(), "Worker pool started");

        Ok(Self {
            local_addr,
            shutdown: shutdown_tx,
            threads,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask every worker to stop accepting and exit.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop all workers and wait for their threads.
    pub fn shutdown(self) {
        self.signal_shutdown();
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

fn run_worker<S, F>(
    id: usize,
    config: WorkerConfig,
    socket: std::net::TcpListener,
    stats: Arc<ProxyStats>,
    make_store: &F,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: CredentialStore,
    F: Fn(usize) -> Result<S>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        let store = make_store(id).context("Failed to create lookup store")?;
        let listener = TcpListener::from_std(socket).context("Failed to register listener")?;
        Worker::new(id, &config, store, stats)
            .run(listener, shutdown)
            .await
            .context("Worker loop failed")
    })
}
