use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::config::SyncTarget;
use crate::{Error, Result};

/// Which side of the sync a pool talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Target,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Source => f.write_str("source"),
            Endpoint::Target => f.write_str("target"),
        }
    }
}

struct PgConnection {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgConnection {
    fn discard(self) {
        self.connection_task.abort();
    }
}

struct PoolInner {
    endpoint: Endpoint,
    config: tokio_postgres::Config,
    connect_timeout: Duration,
    max_connections: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PgConnection>>,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<PgConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded set of connections to one database.
///
/// At most `max_connections` connections are checked out at once. Cloning
/// the pool shares it.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool and opens its first connection, so an unreachable
    /// endpoint fails here rather than mid-run.
    pub async fn open(target: &SyncTarget, endpoint: Endpoint) -> Result<Self> {
        info!(
            %endpoint,
            host = %target.host,
            port = target.port,
            database = %target.database,
            max_connections = target.max_connections,
            "Opening connection pool"
        );

        let max_connections = target.max_connections.max(1);
        let pool = Self {
            inner: Arc::new(PoolInner {
                endpoint,
                config: target.pg_config(),
                connect_timeout: target.connect_timeout(),
                max_connections,
                permits: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(Vec::with_capacity(max_connections)),
                closed: AtomicBool::new(false),
            }),
        };

        let first = pool.connect().await?;
        pool.inner.idle().push(first);

        info!(%endpoint, "Connected to PostgreSQL");
        Ok(pool)
    }

    async fn connect(&self) -> Result<PgConnection> {
        let endpoint = self.inner.endpoint;
        let connecting = self.inner.config.connect(NoTls);

        let (client, connection) = tokio::time::timeout(self.inner.connect_timeout, connecting)
            .await
            .map_err(|_| {
                Error::connection(
                    endpoint.to_string(),
                    format!("connect timed out after {:?}", self.inner.connect_timeout),
                )
            })?
            .map_err(|e| Error::connection(endpoint.to_string(), e))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(%endpoint, "Connection error: {}", e);
            }
        });

        debug!(%endpoint, "Opened new connection");
        Ok(PgConnection {
            client,
            connection_task,
        })
    }

    /// Checks out a connection, waiting while the pool is at its ceiling.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let endpoint = self.inner.endpoint;
        if self.is_closed() {
            return Err(Error::connection(endpoint.to_string(), "pool is closed"));
        }

        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::connection(endpoint.to_string(), "pool is closed"))?;

        let reused = {
            let mut idle = self.inner.idle();
            loop {
                match idle.pop() {
                    Some(conn) if conn.client.is_closed() => conn.discard(),
                    other => break other,
                }
            }
        };

        let conn = match reused {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            clean: false,
            _permit: permit,
        })
    }

    /// Releases every idle connection and refuses further checkouts.
    ///
    /// Calling it again, or on a pool whose connections are all checked out,
    /// is harmless; checked-out connections are dropped when returned.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let drained: Vec<PgConnection> = std::mem::take(&mut *self.inner.idle());
        let count = drained.len();
        for conn in drained {
            conn.discard();
        }
        info!(endpoint = %self.inner.endpoint, released = count, "Closed connection pool");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.idle().len()
    }
}

/// A checked-out connection.
///
/// Returned to the pool on drop only after [`release`](Self::release);
/// a connection dropped mid-operation (error, timeout, cancellation) may
/// be inside an unfinished transaction and is discarded.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    pool: Arc<PoolInner>,
    clean: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Marks the connection reusable and hands it back.
    pub fn release(mut self) {
        self.clean = true;
    }
}

impl Deref for PooledConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        match &self.conn {
            Some(conn) => &conn.client,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Client {
        match &mut self.conn {
            Some(conn) => &mut conn.client,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let reusable = self.clean
            && !self.pool.closed.load(Ordering::SeqCst)
            && !conn.client.is_closed();

        if reusable {
            self.pool.idle().push(conn);
        } else {
            if !self.clean {
                debug!(endpoint = %self.pool.endpoint, "Discarding connection after unfinished operation");
            }
            conn.discard();
        }
    }
}

/// Owns the source and target pools for one run.
///
/// The two pools never share connections. Dropping the manager closes
/// whatever was opened.
#[derive(Default)]
pub struct ConnectionManager {
    source: Option<ConnectionPool>,
    target: Option<ConnectionPool>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&mut self, endpoint: Endpoint, target: &SyncTarget) -> Result<ConnectionPool> {
        let slot = match endpoint {
            Endpoint::Source => &mut self.source,
            Endpoint::Target => &mut self.target,
        };
        if let Some(previous) = slot.take() {
            warn!(%endpoint, "Replacing an already open pool");
            previous.close();
        }

        let pool = ConnectionPool::open(target, endpoint).await?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    pub fn source(&self) -> Option<&ConnectionPool> {
        self.source.as_ref()
    }

    pub fn target(&self) -> Option<&ConnectionPool> {
        self.target.as_ref()
    }

    pub fn close(&mut self) {
        for pool in [self.source.take(), self.target.take()].into_iter().flatten() {
            pool.close();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
