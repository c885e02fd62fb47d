//! Generic TCP accept-and-dispatch server.
//!
//! One instance serves one protocol. Connections are admitted against a
//! bounded pool, configured with TCP keep-alive, stamped with an overall
//! deadline, and handed to a [`ConnectionHandler`]. When the shutdown token
//! fires the accept loop exits, the listener closes, and the server waits
//! for in-flight handlers to drain.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Maximum concurrently handled connections per server.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 500;
/// Overall lifetime budget for a single connection.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// TCP keep-alive period applied to accepted sockets.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for reading a single request.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for writing a single response.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection context handed to handlers.
#[derive(Clone)]
pub struct ConnectionCtx {
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
    /// Absolute deadline for the whole connection.
    pub deadline: Instant,
}

impl ConnectionCtx {
    /// Deadline for the next backend call: the sooner of the connection
    /// deadline and `budget` from now.
    #[must_use]
    pub fn request_deadline(&self, budget: Duration) -> Instant {
        self.deadline.min(Instant::now() + budget)
    }
}

/// Implemented by protocol handlers driven by the server core.
///
/// The handler owns the stream for the connection's lifetime and is expected
/// to run its own request loop. Returning (for any reason) closes the
/// connection and releases its pool token.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection until the client closes, a deadline fires, or
    /// shutdown is signaled.
    async fn handle(&self, ctx: ConnectionCtx, stream: TcpStream);
}

/// Lifecycle callbacks for connection pool telemetry. All optional.
#[derive(Default)]
pub struct ServerHooks {
    /// A connection was admitted into the pool.
    pub on_acquired: Option<Box<dyn Fn() + Send + Sync>>,
    /// An admitted connection finished and released its token.
    pub on_released: Option<Box<dyn Fn() + Send + Sync>>,
    /// A connection was refused because the pool was exhausted.
    pub on_refused: Option<Box<dyn Fn() + Send + Sync>>,
    /// Pool occupancy changed; receives the new size.
    pub on_pool_size_changed: Option<Box<dyn Fn(i64) + Send + Sync>>,
}

/// Identity and wiring for one server instance.
pub struct ServerConfig {
    /// Name used in logs.
    pub name: &'static str,
    /// Listen address.
    pub addr: String,
    /// Connection pool capacity.
    pub max_connections: usize,
    /// Lifecycle callbacks.
    pub hooks: ServerHooks,
}

impl ServerConfig {
    /// Config with the default pool capacity and no hooks.
    #[must_use]
    pub fn new(name: &'static str, addr: String) -> Self {
        Self {
            name,
            addr,
            max_connections: MAX_CONCURRENT_CONNECTIONS,
            hooks: ServerHooks::default(),
        }
    }
}

/// A bound TCP server, ready to run.
pub struct TcpServer {
    listener: TcpListener,
    config: ServerConfig,
}

impl TcpServer {
    /// Bind the listener. A bind failure is fatal for the process.
    ///
    /// # Errors
    ///
    /// Returns the underlying bind error.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await.map_err(|e| {
            error!(server = config.name, addr = %config.addr, error = %e, "failed to bind listener");
            e
        })?;
        Ok(Self { listener, config })
    }

    /// The address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and dispatch connections until `shutdown` fires, then drain
    /// active handlers before returning.
    pub async fn run(self, shutdown: CancellationToken, handler: Arc<dyn ConnectionHandler>) {
        let Self { listener, config } = self;
        let name = config.name;
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        let pool_usage = Arc::new(AtomicI64::new(0));
        let hooks = Arc::new(config.hooks);
        let tracker = TaskTracker::new();

        info!(server = name, addr = %config.addr, "server started");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(server = name, error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(server = name, peer = %peer, "connection pool full, refusing connection");
                    if let Some(on_refused) = &hooks.on_refused {
                        on_refused();
                    }
                    drop(stream);
                    continue;
                }
            };

            if let Some(on_acquired) = &hooks.on_acquired {
                on_acquired();
            }
            let guard = PoolGuard::enter(Arc::clone(&hooks), Arc::clone(&pool_usage), permit);

            let ctx = ConnectionCtx {
                shutdown: shutdown.clone(),
                deadline: Instant::now() + CONNECTION_TIMEOUT,
            };
            let handler = Arc::clone(&handler);
            tracker.spawn(async move {
                let _guard = guard;
                if let Err(e) = configure_keepalive(&stream) {
                    debug!(server = name, error = %e, "failed to set keep-alive");
                }
                let deadline = ctx.deadline;
                if tokio::time::timeout_at(deadline, handler.handle(ctx, stream))
                    .await
                    .is_err()
                {
                    debug!(server = name, "connection deadline reached, closing");
                }
            });
        }

        // The listener drops here, so no new connections are accepted while
        // in-flight handlers finish.
        drop(listener);
        info!(server = name, active = tracker.len(), "shutting down, waiting for connections to drain");
        tracker.close();
        tracker.wait().await;
        info!(server = name, "all connections closed");
    }
}

/// RAII token pairing pool admission with guaranteed release telemetry.
///
/// Dropping the guard releases the semaphore permit and fires the release
/// callbacks, so every exit path of a worker (including panics) restores the
/// pool invariants.
struct PoolGuard {
    hooks: Arc<ServerHooks>,
    pool_usage: Arc<AtomicI64>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    fn enter(
        hooks: Arc<ServerHooks>,
        pool_usage: Arc<AtomicI64>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let usage = pool_usage.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(on_pool_size_changed) = &hooks.on_pool_size_changed {
            on_pool_size_changed(usage);
        }
        Self {
            hooks,
            pool_usage,
            _permit: permit,
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let usage = self.pool_usage.fetch_sub(1, Ordering::SeqCst) - 1;
        if let Some(on_pool_size_changed) = &self.hooks.on_pool_size_changed {
            on_pool_size_changed(usage);
        }
        if let Some(on_released) = &self.hooks.on_released {
            on_released();
        }
    }
}

fn configure_keepalive(stream: &TcpStream) -> io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIMEOUT);
    socket.set_tcp_keepalive(&keepalive)
}
