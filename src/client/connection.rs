use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use actix_codec::{AsyncRead, AsyncWrite, ReadBuf};
use actix_rt::{task::JoinHandle, time::Instant};
use bytes::Bytes;
use futures_util::FutureExt as _;
use h2::client::SendRequest;

use super::{chain::Activity, Key, Protocol};

/// Trait alias for types impl [tokio::io::AsyncRead] and [tokio::io::AsyncWrite].
pub trait ConnectionIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ConnectionIo for T {}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// `H2ConnectionInner` has two parts: `SendRequest` and `Connection`.
///
/// `Connection` is spawned as a task on the runtime and `H2ConnectionInner` holds a handle
/// for this task, aborting it when the connection is discarded.
pub(crate) struct H2ConnectionInner {
    handle: JoinHandle<()>,
    sender: SendRequest<Bytes>,
}

impl H2ConnectionInner {
    pub(crate) fn new<Io: ConnectionIo>(
        sender: SendRequest<Bytes>,
        connection: h2::client::Connection<Io>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::debug!("h2 connection closed: {err}");
            }
        });

        Self { handle, sender }
    }

    pub(crate) fn sender(&self) -> SendRequest<Bytes> {
        self.sender.clone()
    }

    fn is_open(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for H2ConnectionInner {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Protocol specific part of a connection.
pub(crate) enum ConnectionInner {
    H1(Box<dyn ConnectionIo>),
    H2(H2ConnectionInner),
}

/// Identity of a pooled connection, kept aside while its I/O is in use.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionMeta {
    id: u64,
    key: Key,
    created: Instant,
}

/// Connection owned either by the pool or by exactly one exchange.
pub(crate) struct PooledConnection {
    meta: ConnectionMeta,
    inner: ConnectionInner,
}

impl PooledConnection {
    pub(crate) fn new(key: Key, inner: ConnectionInner) -> Self {
        PooledConnection {
            meta: ConnectionMeta {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                key,
                created: Instant::now(),
            },
            inner,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.meta.id
    }

    pub(crate) fn key(&self) -> &Key {
        &self.meta.key
    }

    pub(crate) fn created(&self) -> Instant {
        self.meta.created
    }

    pub(crate) fn protocol(&self) -> Protocol {
        match self.inner {
            ConnectionInner::H1(_) => Protocol::Http1,
            ConnectionInner::H2(_) => Protocol::Http2,
        }
    }

    pub(crate) fn into_parts(self) -> (ConnectionInner, ConnectionMeta) {
        (self.inner, self.meta)
    }

    pub(crate) fn from_parts(inner: ConnectionInner, meta: ConnectionMeta) -> Self {
        PooledConnection { meta, inner }
    }

    /// Check whether the peer may still accept a request on this connection.
    ///
    /// An idle HTTP/1 connection with readable data or a closed read half is not reusable.
    pub(crate) fn is_open(&mut self) -> bool {
        match self.inner {
            ConnectionInner::H1(ref mut io) => {
                let check = ConnectionCheckFuture { io };
                matches!(
                    check.now_or_never().unwrap_or(ConnectionState::Skip),
                    ConnectionState::Live
                )
            }
            ConnectionInner::H2(ref inner) => inner.is_open(),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("key", &self.meta.key)
            .field("protocol", &self.protocol())
            .finish()
    }
}

/// Type for check the connection and determine if it's usable.
struct ConnectionCheckFuture<'a, Io: ?Sized> {
    io: &'a mut Io,
}

enum ConnectionState {
    /// IO is pending and a new request would wake it.
    Live,

    /// IO unexpectedly has unread data and should be dropped.
    Tainted,

    /// IO reached EOF or failed.
    Skip,
}

impl<Io> Future for ConnectionCheckFuture<'_, Io>
where
    Io: AsyncRead + Unpin + ?Sized,
{
    type Output = ConnectionState;

    // this future is only used to get access to Context.
    // It should never return Poll::Pending.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut buf = [0; 2];
        let mut read_buf = ReadBuf::new(&mut buf);

        let state = match Pin::new(&mut *this.io).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) if !read_buf.filled().is_empty() => ConnectionState::Tainted,
            Poll::Pending => ConnectionState::Live,
            _ => ConnectionState::Skip,
        };

        Poll::Ready(state)
    }
}

/// I/O wrapper recording inbound activity for the read timeout.
pub(crate) struct ActivityIo<Io> {
    io: Io,
    activity: Activity,
}

impl<Io> ActivityIo<Io> {
    pub(crate) fn new(io: Io, activity: Activity) -> Self {
        ActivityIo { io, activity }
    }

    pub(crate) fn into_inner(self) -> Io {
        self.io
    }
}

impl<Io: AsyncRead + Unpin> AsyncRead for ActivityIo<Io> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        let res = Pin::new(&mut this.io).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        res
    }
}

impl<Io: AsyncWrite + Unpin> AsyncWrite for ActivityIo<Io> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use http::Uri;
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    fn key() -> Key {
        Key::from_uri(&Uri::from_static("http://localhost:8080/"), None).unwrap()
    }

    #[actix_rt::test]
    async fn idle_connection_is_open() {
        let (client, _server) = duplex(64);
        let mut conn = PooledConnection::new(key(), ConnectionInner::H1(Box::new(client)));
        assert!(conn.is_open());
        assert_eq!(conn.protocol(), Protocol::Http1);
    }

    #[actix_rt::test]
    async fn unread_data_taints_connection() {
        let (client, mut server) = duplex(64);
        server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();

        let mut conn = PooledConnection::new(key(), ConnectionInner::H1(Box::new(client)));
        assert!(!conn.is_open());
    }

    #[actix_rt::test]
    async fn closed_peer() {
        let (client, server) = duplex(64);
        drop(server);

        let mut conn = PooledConnection::new(key(), ConnectionInner::H1(Box::new(client)));
        assert!(!conn.is_open());
    }

    #[actix_rt::test]
    async fn ids_are_unique() {
        let a = PooledConnection::new(key(), ConnectionInner::H1(Box::new(duplex(8).0)));
        let b = PooledConnection::new(key(), ConnectionInner::H1(Box::new(duplex(8).0)));
        assert_ne!(a.id(), b.id());

        let id = a.id();
        let (inner, meta) = a.into_parts();
        assert_eq!(PooledConnection::from_parts(inner, meta).id(), id);
    }

    #[actix_rt::test]
    async fn reads_touch_activity() {
        let activity = Activity::new();
        let start = activity.last();

        let (client, mut server) = duplex(64);
        let mut io = ActivityIo::new(client, activity.clone());

        actix_rt::time::sleep(std::time::Duration::from_millis(5)).await;
        server.write_all(b"ping").await.unwrap();

        let mut buf = [0; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert!(activity.last() > start);
    }
}
