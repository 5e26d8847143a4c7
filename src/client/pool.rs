//! Client connection pooling keyed on scheme, effective host and port.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    task::{Context, Poll},
    time::Duration,
};

use actix_codec::AsyncWrite;
use actix_rt::time::{sleep, sleep_until, Instant, Sleep};
use pin_project_lite::pin_project;
use tokio::{runtime::Handle, sync::Notify};

use super::{
    config::PoolLimits,
    connection::{ConnectionInner, PooledConnection},
    Key,
};

struct IdleConnection {
    conn: PooledConnection,
    used: Instant,
    expires: Instant,
}

/// Idle connections of one destination.
///
/// A queue only exists while it holds connections; `pruner` wakes the destination's prune
/// task.
struct IdleQueue {
    id: u64,
    conns: VecDeque<IdleConnection>,
    pruner: Option<Arc<Notify>>,
}

impl IdleQueue {
    fn new(id: u64) -> Self {
        IdleQueue {
            id,
            conns: VecDeque::new(),
            pruner: None,
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.conns.iter().map(|idle| idle.expires).min()
    }
}

struct PoolInner {
    available: Mutex<HashMap<Key, IdleQueue>>,
    total_idle: AtomicUsize,
    queue_ids: AtomicU64,
    conn_lifetime: Duration,
    disconnect_timeout: Option<Duration>,
    handle: Handle,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Key, IdleQueue>> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a drained queue and stops its prune task.
fn remove_queue(map: &mut HashMap<Key, IdleQueue>, key: &Key) {
    if let Some(queue) = map.remove(key) {
        if let Some(pruner) = queue.pruner {
            pruner.notify_one();
        }
    }
}

/// Idle connections, keyed by destination.
///
/// The lock is never held across I/O; connections are closed after it is released.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub(crate) fn new(
        conn_lifetime: Duration,
        disconnect_timeout: Option<Duration>,
        handle: Handle,
    ) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                available: Mutex::new(HashMap::new()),
                total_idle: AtomicUsize::new(0),
                queue_ids: AtomicU64::new(0),
                conn_lifetime,
                disconnect_timeout,
                handle,
            }),
        }
    }

    /// Takes an idle connection for `key`, discarding any that are closed or too old.
    pub(crate) fn acquire(&self, key: &Key) -> Option<PooledConnection> {
        let mut stale = Vec::new();

        let found = {
            let mut map = self.inner.lock();
            let queue = map.get_mut(key)?;
            let now = Instant::now();
            let mut found = None;

            while let Some(mut idle) = queue.conns.pop_front() {
                self.inner.total_idle.fetch_sub(1, Ordering::AcqRel);

                if now - idle.conn.created() > self.inner.conn_lifetime || !idle.conn.is_open() {
                    stale.push(idle.conn);
                    continue;
                }

                found = Some(idle.conn);
                break;
            }

            if queue.conns.is_empty() {
                remove_queue(&mut map, key);
            }
            found
        };

        for conn in stale {
            log::trace!("discarding stale connection {} to {}", conn.id(), key);
            self.close(conn);
        }

        if let Some(ref conn) = found {
            log::trace!("reusing connection {} to {}", conn.id(), key);
        }
        found
    }

    /// Returns a connection to the pool.
    ///
    /// The connection is closed instead when pooling it would exceed either capacity limit.
    /// Returns true if the connection was pooled.
    pub(crate) fn release(&self, conn: PooledConnection, limits: &PoolLimits) -> bool {
        let key = conn.key().clone();
        let now = Instant::now();
        let expires = now + limits.idle_prune_interval;

        let mut map = self.inner.lock();

        let queued = map.get(&key).map_or(0, |queue| queue.conns.len());
        let total = self.inner.total_idle.load(Ordering::Acquire);
        if queued >= limits.max_per_destination || total >= limits.max_total {
            drop(map);
            log::trace!("pool for {} is full, closing connection {}", key, conn.id());
            self.close(conn);
            return false;
        }

        let queue = map.entry(key.clone()).or_insert_with(|| {
            IdleQueue::new(self.inner.queue_ids.fetch_add(1, Ordering::Relaxed))
        });
        let earliest = queue.next_expiry().map_or(true, |next| expires < next);
        queue.conns.push_back(IdleConnection {
            conn,
            used: now,
            expires,
        });
        self.inner.total_idle.fetch_add(1, Ordering::AcqRel);

        let spawn = match queue.pruner {
            Some(ref pruner) => {
                if earliest {
                    pruner.notify_one();
                }
                None
            }
            None => {
                let pruner = Arc::new(Notify::new());
                queue.pruner = Some(Arc::clone(&pruner));
                Some((queue.id, pruner))
            }
        };
        drop(map);

        if let Some((id, pruner)) = spawn {
            self.spawn_pruner(key, id, pruner);
        }
        true
    }

    /// Starts the prune task of one destination queue.
    ///
    /// The task sleeps until the earliest idle deadline and ends with its queue.
    fn spawn_pruner(&self, key: Key, id: u64, wake: Arc<Notify>) {
        let pool = Arc::downgrade(&self.inner);

        self.inner.handle.spawn(async move {
            while let Some(at) = prune(&pool, &key, id) {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = wake.notified() => {}
                }
            }
            log::trace!("idle queue for {} is gone, prune task exits", key);
        });
    }

    /// Closes a connection that is not returned to the pool.
    ///
    /// HTTP/1 connections are shut down gracefully in the background, bounded by the
    /// disconnect timeout.
    pub(crate) fn close(&self, conn: PooledConnection) {
        let (inner, _) = conn.into_parts();

        if let (Some(timeout), ConnectionInner::H1(io)) = (self.inner.disconnect_timeout, inner) {
            // the timer must be created on the pool's runtime
            self.inner
                .handle
                .spawn(async move { CloseConnection::new(io, timeout).await });
        }
    }

    /// Number of idle connections for `key`.
    pub fn idle_count(&self, key: &Key) -> usize {
        self.inner
            .lock()
            .get(key)
            .map_or(0, |queue| queue.conns.len())
    }

    /// Number of idle connections across all destinations.
    pub fn total_idle(&self) -> usize {
        self.inner.total_idle.load(Ordering::Acquire)
    }

    /// Closes every idle connection.
    pub fn clear(&self) {
        let queues = std::mem::take(&mut *self.inner.lock());

        for (_, queue) in queues {
            if let Some(pruner) = queue.pruner {
                pruner.notify_one();
            }

            for idle in queue.conns {
                self.inner.total_idle.fetch_sub(1, Ordering::AcqRel);
                self.close(idle.conn);
            }
        }
    }
}

/// Evicts the expired connections of queue `id`.
///
/// Returns when to look again, or `None` once the queue is gone.
fn prune(pool: &Weak<PoolInner>, key: &Key, id: u64) -> Option<Instant> {
    let pool = ConnectionPool {
        inner: pool.upgrade()?,
    };
    let now = Instant::now();

    let (expired, next) = {
        let mut map = pool.inner.lock();
        let queue = match map.get_mut(key) {
            Some(queue) if queue.id == id => queue,
            _ => return None,
        };

        let (expired, kept): (VecDeque<_>, VecDeque<_>) = queue
            .conns
            .drain(..)
            .partition(|idle: &IdleConnection| idle.expires <= now);
        queue.conns = kept;

        let next = queue.next_expiry();
        if next.is_none() {
            map.remove(key);
        }
        (expired, next)
    };

    for idle in expired {
        pool.inner.total_idle.fetch_sub(1, Ordering::AcqRel);
        log::debug!(
            "pruning connection {} to {}, idle for {:?}",
            idle.conn.id(),
            key,
            idle.used.elapsed()
        );
        pool.close(idle.conn);
    }

    next
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("total_idle", &self.total_idle())
            .finish()
    }
}

pin_project! {
    #[project = CloseConnectionProj]
    struct CloseConnection<Io> {
        io: Io,
        #[pin]
        timeout: Sleep,
    }
}

impl<Io> CloseConnection<Io>
where
    Io: AsyncWrite + Unpin,
{
    fn new(io: Io, timeout: Duration) -> Self {
        CloseConnection {
            io,
            timeout: sleep(timeout),
        }
    }
}

impl<Io> Future for CloseConnection<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();

        match this.timeout.poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Pin::new(this.io).poll_shutdown(cx).map(|res| {
                if let Err(err) = res {
                    log::debug!("error shutting down connection: {err}");
                }
            }),
        }
    }
}
