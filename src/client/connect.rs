use std::{fmt, sync::Arc, time::Duration};

use actix_rt::{net::TcpStream, time::timeout};
use actix_service::Service;

use super::{
    config::{CodecLimits, ConnectorConfig},
    connection::ConnectionIo,
    error::{ConnectError, SetupError},
    h1proto::open_tunnel,
    Connect, Protocol, Scheme, TransportFuture,
};

#[cfg(feature = "rustls")]
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};

/// Default transport: TCP, optional proxy tunnel and TLS.
#[derive(Clone)]
pub struct TcpTransport {
    handshake_timeout: Duration,
    http2: bool,
    limits: CodecLimits,
    #[cfg(feature = "rustls")]
    tls: Arc<ClientConfig>,
}

impl TcpTransport {
    /// Creates the transport with webpki root certificates.
    pub fn new(config: &ConnectorConfig) -> Result<Self, SetupError> {
        Ok(TcpTransport {
            handshake_timeout: config.handshake_timeout,
            http2: config.http2,
            limits: config.limits,
            #[cfg(feature = "rustls")]
            tls: default_tls_config(config.http2)?,
        })
    }

    /// Use a custom rustls configuration.
    ///
    /// ALPN protocols are replaced to match the HTTP/2 setting.
    #[cfg(feature = "rustls")]
    pub fn rustls(mut self, config: Arc<ClientConfig>) -> Self {
        let mut config = ClientConfig::clone(&config);
        config.alpn_protocols = alpn_protocols(self.http2);
        self.tls = Arc::new(config);
        self
    }

    async fn connect(self, req: Connect) -> Result<(Box<dyn ConnectionIo>, Protocol), ConnectError> {
        let host = req
            .uri
            .host()
            .ok_or(ConnectError::Unresolved)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = req.key.port();

        let stream = match req.proxy {
            Some(ref proxy) => {
                log::trace!("connecting to {}:{} through proxy {:?}", host, port, proxy);
                let stream = TcpStream::connect((proxy.host(), proxy.port())).await?;
                let authority = authority(&host, port);
                open_tunnel(stream, &authority, proxy.authorization(), self.limits).await?
            }
            None => {
                log::trace!("connecting to {}:{}", host, port);
                TcpStream::connect((host.as_str(), port)).await?
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("can not set TCP_NODELAY: {err}");
        }

        match req.key.scheme() {
            Scheme::Http if self.http2 => Ok((Box::new(stream), Protocol::Http2)),
            Scheme::Http => Ok((Box::new(stream), Protocol::Http1)),
            Scheme::Https => self.secure(stream, req.key.host()).await,
        }
    }

    #[cfg(feature = "rustls")]
    async fn secure(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<(Box<dyn ConnectionIo>, Protocol), ConnectError> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| ConnectError::InvalidServerName(server_name.to_owned()))?;

        let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.tls));
        let stream = timeout(self.handshake_timeout, connector.connect(name, stream))
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(ConnectError::Tls)?;

        let protocol = match stream.get_ref().1.alpn_protocol() {
            Some(b"h2") if self.http2 => Protocol::Http2,
            Some(b"http/1.1") | None => Protocol::Http1,
            Some(proto) => {
                return Err(ConnectError::UnsupportedProtocol(
                    String::from_utf8_lossy(proto).into_owned(),
                ))
            }
        };

        log::trace!("TLS session with {server_name} established, {protocol:?}");
        Ok((Box::new(stream), protocol))
    }

    #[cfg(not(feature = "rustls"))]
    async fn secure(
        &self,
        _: TcpStream,
        _: &str,
    ) -> Result<(Box<dyn ConnectionIo>, Protocol), ConnectError> {
        Err(ConnectError::SslIsNotSupported)
    }
}

impl Service<Connect> for TcpTransport {
    type Response = (Box<dyn ConnectionIo>, Protocol);
    type Error = ConnectError;
    type Future = TransportFuture;

    actix_service::always_ready!();

    fn call(&self, req: Connect) -> Self::Future {
        let this = self.clone();
        let connect_timeout = req.timeout;

        Box::pin(async move {
            match connect_timeout {
                Some(dur) => timeout(dur, this.connect(req))
                    .await
                    .map_err(|_| ConnectError::Timeout)?,
                None => this.connect(req).await,
            }
        })
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("http2", &self.http2)
            .finish()
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(feature = "rustls")]
fn alpn_protocols(http2: bool) -> Vec<Vec<u8>> {
    if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

#[cfg(feature = "rustls")]
fn default_tls_config(http2: bool) -> Result<Arc<ClientConfig>, SetupError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| SetupError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = alpn_protocols(http2);
    Ok(Arc::new(config))
}
