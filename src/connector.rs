use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use actix_rt::time::{sleep_until, Instant};
use actix_service::Service;
use actix_utils::future::poll_fn;
use http::{header::HOST, Uri};
use tokio::{
    runtime::{Handle, Runtime},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{
        guarded, h1_send, h2_handshake, h2_send, AssembledResponse, BoxTransport, Connect,
        ConnectError, ConnectionInner, ConnectionIo, ConnectionPool, ConnectorConfig,
        ExchangeSettings, HandlerChain, Key, PooledConnection, Protocol, ProxyConfig,
        SendRequestError, SetupError, TcpTransport, TimeoutKind, TransportFuture,
    },
    entity::{Body, Entity},
    error::ProcessingError,
    exchange::{Canceller, Exchange, ExchangeHandle},
    redirect,
    request::{ClientRequest, RequestHead},
    response::ClientResponse,
};

/// Manages HTTP client network connectivity and drives exchanges.
///
/// The connector owns a connection pool and, unless given a runtime handle, a multi-thread
/// runtime whose threads run all connection I/O. Clones share both.
///
/// Dropping the last clone of a connector that owns its runtime stops the I/O threads;
/// exchanges still in flight then fail with [`ConnectError::Disconnected`].
///
/// ```no_run
/// use std::time::Duration;
/// use courier::{Connector, ConnectorConfig};
///
/// let connector = Connector::builder()
///     .config(
///         ConnectorConfig::default()
///             .connect_timeout(Duration::from_secs(2))
///             .max_connections_per_destination(10),
///     )
///     .finish()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
    _runtime: Option<Arc<OwnedRuntime>>,
}

struct ConnectorInner {
    config: ConnectorConfig,
    pool: ConnectionPool,
    transport: BoxTransport,
    handle: Handle,
    closed: AtomicBool,
}

/// Runtime created by the builder. Shut down without waiting when the connector goes away.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            log::trace!("shutting down connector runtime");
            runtime.shutdown_background();
        }
    }
}

impl Connector {
    /// Creates a connector with the given configuration.
    pub fn new(config: ConnectorConfig) -> Result<Connector, SetupError> {
        Connector::builder().config(config).finish()
    }

    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::new()
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Idle connections held by this connector.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Submits a request; returns its completion signals immediately.
    pub fn submit(&self, req: ClientRequest) -> ExchangeHandle {
        let (mut exchange, handle) = Exchange::new();

        if self.inner.closed.load(Ordering::Acquire) {
            exchange.fail(ConnectError::Disconnected.into());
            return handle;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            inner.run(exchange, req).await;
        });

        handle
    }

    /// Submits a request and hands the response to `callback` on the worker pool.
    ///
    /// The callback receives the response as soon as its head is available.
    pub fn submit_with<F>(&self, req: ClientRequest, callback: F) -> Canceller
    where
        F: FnOnce(Result<ClientResponse, SendRequestError>) + Send + 'static,
    {
        let (available, _, canceller) = self.submit(req).into_parts();

        self.inner.handle.spawn(async move {
            let res = available.await;
            if actix_rt::task::spawn_blocking(move || callback(res))
                .await
                .is_err()
            {
                log::error!("response callback panicked");
            }
        });

        canceller
    }

    /// Sends a request and blocks until its response is available.
    ///
    /// Must not be called from a thread driving an async runtime.
    pub fn send(&self, req: ClientRequest) -> Result<ClientResponse, ProcessingError> {
        let (available, _, _) = self.submit(req).into_parts();
        available.wait().map_err(ProcessingError::from)
    }

    /// Rejects further submissions and closes idle connections.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.pool.clear();
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .field("owns_runtime", &self._runtime.is_some())
            .finish()
    }
}

type DoneSender = oneshot::Sender<Result<(), SendRequestError>>;

impl ConnectorInner {
    /// Drives one exchange across all redirect hops.
    async fn run(self: Arc<Self>, mut exchange: Exchange, req: ClientRequest) {
        let (mut head, mut body, overrides) = match req.into_parts() {
            Ok(parts) => parts,
            Err(err) => return exchange.fail(err.into()),
        };

        let settings = Arc::new(overrides.resolve(&self.config));
        let deadline = settings.total_timeout.map(|dur| Instant::now() + dur);
        let cancel = exchange.cancel.clone();
        let follow = settings.redirect.follow;

        loop {
            let prev = head.clone();
            let replay = if follow { body.try_clone() } else { None };

            let (head_tx, head_rx) = oneshot::channel();
            let (done_tx, done_rx) = oneshot::channel();
            self.handle.spawn(Arc::clone(&self).wire(
                head,
                body,
                Arc::clone(&settings),
                cancel.clone(),
                deadline,
                HandlerChain::new(head_tx, settings.read_timeout, deadline),
                done_tx,
            ));

            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SendRequestError::Canceled),
                _ = expire(deadline) => Err(SendRequestError::Timeout(TimeoutKind::Total)),
                res = head_rx => res.unwrap_or(Err(SendRequestError::Closed)),
            };

            let response = match res {
                Ok(response) => response,
                Err(err) => return exchange.fail(err),
            };

            let status = response.head.status();
            if follow && redirect::is_redirect(status) {
                let next = redirect::next_request(
                    status,
                    response.head.headers(),
                    &prev,
                    replay,
                    &mut exchange.visited,
                    &settings.redirect,
                );
                // redirect bodies are discarded
                drop(response);

                let (next_head, next_body) = match next {
                    Ok(next) => next,
                    Err(err) => return exchange.fail(err.into()),
                };

                let drained = async { done_rx.await.unwrap_or(Err(SendRequestError::Closed)) };
                match guarded(drained, &cancel, deadline).await {
                    Ok(()) => {}
                    Err(err @ SendRequestError::Canceled)
                    | Err(err @ SendRequestError::Timeout(TimeoutKind::Total)) => {
                        return exchange.fail(err)
                    }
                    Err(err) => log::debug!("redirect response ended with error: {err}"),
                }

                head = next_head;
                body = next_body;
                continue;
            }

            if cancel.is_cancelled() {
                return exchange.fail(SendRequestError::Canceled);
            }

            let AssembledResponse {
                head: res_head,
                body: res_body,
                continuation,
            } = response;
            let mut res = ClientResponse::new(res_head, res_body, prev.uri);
            res.continuation = continuation;
            exchange.complete_available(res);

            let done = done_rx.await.unwrap_or(Err(SendRequestError::Closed));
            if let Err(ref err) = done {
                log::debug!("exchange failed after response: {err}");
            }
            exchange.complete_done(done);
            return;
        }
    }

    /// Wire task of one hop: owns the connection until the response is complete.
    #[allow(clippy::too_many_arguments)]
    async fn wire(
        self: Arc<Self>,
        head: RequestHead,
        body: Body,
        settings: Arc<ExchangeSettings>,
        cancel: CancellationToken,
        deadline: Option<Instant>,
        mut chain: HandlerChain,
        done_tx: DoneSender,
    ) {
        let res = self
            .dispatch(head, body, &mut chain, &settings, &cancel, deadline)
            .await;

        let res = match res {
            Ok(()) => Ok(()),
            Err(err) => match chain.fail(err) {
                Some(err) => Err(err),
                // already reported through the response head
                None => Err(SendRequestError::Aborted),
            },
        };

        let _ = done_tx.send(res);
    }

    async fn dispatch(
        &self,
        head: RequestHead,
        body: Body,
        chain: &mut HandlerChain,
        settings: &ExchangeSettings,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), SendRequestError> {
        let sni = sni_host(&head, settings);
        let key = Key::from_uri(&head.uri, sni.as_deref())?;

        let conn = match self.pool.acquire(&key) {
            Some(conn) => conn,
            None => guarded(self.open(&key, &head.uri, settings), cancel, deadline).await?,
        };

        let entity = Entity::new(body, settings.entity_processing, settings.chunk_size);
        let (inner, meta) = conn.into_parts();

        let (inner, reusable) = match inner {
            ConnectionInner::H1(io) => {
                let (io, reusable) =
                    h1_send(io, head, entity, chain, settings, cancel, deadline).await?;
                (ConnectionInner::H1(io), reusable)
            }
            ConnectionInner::H2(h2) => {
                let reusable =
                    h2_send(h2.sender(), head, entity, chain, cancel, deadline).await?;
                (ConnectionInner::H2(h2), reusable)
            }
        };

        let conn = PooledConnection::from_parts(inner, meta);
        if reusable {
            self.pool.release(conn, &settings.pool);
        } else {
            log::trace!("connection {} to {} is not reusable", conn.id(), key);
            self.pool.close(conn);
        }

        Ok(())
    }

    /// Opens a new connection for `key`.
    async fn open(
        &self,
        key: &Key,
        uri: &Uri,
        settings: &ExchangeSettings,
    ) -> Result<PooledConnection, SendRequestError> {
        let proxy = settings.proxy.clone().or_else(|| {
            if self.config.proxy_from_env {
                ProxyConfig::from_env(uri)
            } else {
                None
            }
        });

        let req = Connect {
            uri: uri.clone(),
            key: key.clone(),
            proxy,
            timeout: settings.connect_timeout,
        };

        poll_fn(|cx| self.transport.poll_ready(cx))
            .await
            .map_err(connect_error)?;
        let (io, protocol) = self.transport.call(req).await.map_err(connect_error)?;

        let inner = match protocol {
            Protocol::Http1 => ConnectionInner::H1(io),
            Protocol::Http2 => {
                ConnectionInner::H2(h2_handshake(io, &self.config).await.map_err(connect_error)?)
            }
        };

        let conn = PooledConnection::new(key.clone(), inner);
        log::debug!(
            "opened {:?} connection {} to {}",
            protocol,
            conn.id(),
            key
        );
        Ok(conn)
    }
}

fn connect_error(err: ConnectError) -> SendRequestError {
    match err {
        ConnectError::Timeout => SendRequestError::Timeout(TimeoutKind::Connect),
        err => SendRequestError::Connect(err),
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// TLS server name: explicit setting, else a `Host` header naming a different host.
fn sni_host(head: &RequestHead, settings: &ExchangeSettings) -> Option<String> {
    if let Some(ref sni) = settings.sni_host {
        return Some(sni.clone());
    }

    let host = head.headers.get(HOST)?.to_str().ok()?;
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };

    let differs = head
        .uri
        .host()
        .map_or(true, |uri_host| !uri_host.eq_ignore_ascii_case(host));

    (differs && !host.is_empty()).then(|| host.to_owned())
}

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    handle: Option<Handle>,
    transport: Option<BoxTransport>,
    #[cfg(feature = "rustls")]
    tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl Default for ConnectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorBuilder {
    pub fn new() -> Self {
        ConnectorBuilder {
            config: ConnectorConfig::default(),
            handle: None,
            transport: None,
            #[cfg(feature = "rustls")]
            tls: None,
        }
    }

    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run connection I/O on an existing multi-thread runtime instead of an owned one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Use a custom service to open transport connections.
    pub fn transport<S>(mut self, service: S) -> Self
    where
        S: Service<Connect, Response = (Box<dyn ConnectionIo>, Protocol), Error = ConnectError>
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.transport = Some(Arc::new(BoxedTransport { service }));
        self
    }

    /// Use a custom rustls configuration for the default transport.
    #[cfg(feature = "rustls")]
    pub fn rustls(mut self, config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Validates the configuration and starts the connector.
    pub fn finish(self) -> Result<Connector, SetupError> {
        self.config.validate()?;

        let (handle, runtime) = match self.handle {
            Some(handle) => (handle, None),
            None => {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.enable_all().thread_name("courier-io");
                if let Some(threads) = self.config.io_threads {
                    builder.worker_threads(threads);
                }
                if let Some(threads) = self.config.worker_threads {
                    builder.max_blocking_threads(threads);
                }

                let runtime = builder.build().map_err(SetupError::Runtime)?;
                (runtime.handle().clone(), Some(Arc::new(OwnedRuntime(Some(runtime)))))
            }
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                #[allow(unused_mut)]
                let mut transport = TcpTransport::new(&self.config)?;
                #[cfg(feature = "rustls")]
                if let Some(tls) = self.tls {
                    transport = transport.rustls(tls);
                }
                Arc::new(transport) as BoxTransport
            }
        };

        let pool = ConnectionPool::new(
            self.config.conn_lifetime,
            self.config.disconnect_timeout,
            handle.clone(),
        );

        Ok(Connector {
            inner: Arc::new(ConnectorInner {
                config: self.config,
                pool,
                transport,
                handle,
                closed: AtomicBool::new(false),
            }),
            _runtime: runtime,
        })
    }
}

/// Adapts any connect service to the boxed transport signature.
struct BoxedTransport<S> {
    service: S,
}

impl<S> Service<Connect> for BoxedTransport<S>
where
    S: Service<Connect, Response = (Box<dyn ConnectionIo>, Protocol), Error = ConnectError>,
    S::Future: Send + 'static,
{
    type Response = (Box<dyn ConnectionIo>, Protocol);
    type Error = ConnectError;
    type Future = TransportFuture;

    actix_service::forward_ready!(service);

    fn call(&self, req: Connect) -> Self::Future {
        Box::pin(self.service.call(req))
    }
}
