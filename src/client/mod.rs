//! Connection management: transport, pooling and the HTTP/1 and HTTP/2 wire drivers.

use std::{fmt, sync::Arc, time::Duration};

use actix_service::Service;
use futures_util::future::BoxFuture;
use http::Uri;

mod chain;
mod config;
mod connect;
mod connection;
mod error;
mod h1proto;
mod h2proto;
mod pool;

pub(crate) use self::chain::{guarded, AssembledResponse, HandlerChain};
pub(crate) use self::config::ExchangeSettings;
pub(crate) use self::connection::{ConnectionInner, PooledConnection};
pub use self::{
    config::{
        properties, CodecLimits, ConnectorConfig, ContinuationConfig, PoolLimits, ProxyConfig,
        RedirectPolicy, RequestSettings,
    },
    connect::TcpTransport,
    connection::ConnectionIo,
    error::{
        ConnectError, InvalidUrl, PayloadError, ProcessingError, ProtocolError, RedirectError,
        SendRequestError, SetupError, TimeoutKind,
    },
    pool::ConnectionPool,
};
pub(crate) use self::{h1proto::send_request as h1_send, h2proto::send_request as h2_send};
pub(crate) use self::h2proto::handshake as h2_handshake;

/// URI scheme supported by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Destination identity used to select pooled connections.
///
/// The host is the TLS server name when one is configured for an https request, so requests
/// with different SNI never share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Key {
    pub fn from_uri(uri: &Uri, sni_host: Option<&str>) -> Result<Key, InvalidUrl> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(_) => return Err(InvalidUrl::UnknownScheme),
            None => return Err(InvalidUrl::MissingScheme),
        };

        let host = match (scheme, sni_host) {
            (Scheme::Https, Some(sni)) => sni,
            _ => uri.host().ok_or(InvalidUrl::MissingHost)?,
        };
        if host.is_empty() {
            return Err(InvalidUrl::MissingHost);
        }

        Ok(Key {
            scheme,
            host: host.to_ascii_lowercase(),
            port: uri.port_u16().unwrap_or_else(|| scheme.default_port()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Request to open a transport connection.
#[derive(Debug, Clone)]
pub struct Connect {
    pub uri: Uri,
    pub key: Key,
    pub proxy: Option<ProxyConfig>,
    pub timeout: Option<Duration>,
}

/// Application protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

pub type TransportFuture =
    BoxFuture<'static, Result<(Box<dyn ConnectionIo>, Protocol), ConnectError>>;

/// Service opening transport connections for the connector.
pub type BoxTransport = Arc<
    dyn Service<
            Connect,
            Response = (Box<dyn ConnectionIo>, Protocol),
            Error = ConnectError,
            Future = TransportFuture,
        > + Send
        + Sync,
>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_uri() {
        let key = Key::from_uri(&Uri::from_static("http://Example.COM/path"), None).unwrap();
        assert_eq!(key.scheme(), Scheme::Http);
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.port(), 80);
        assert_eq!(key.to_string(), "http://example.com:80");

        let key = Key::from_uri(&Uri::from_static("https://example.com:8443"), None).unwrap();
        assert_eq!(key.port(), 8443);
    }

    #[test]
    fn sni_selects_https_key() {
        let uri = Uri::from_static("https://10.0.0.1/");
        let plain = Key::from_uri(&uri, None).unwrap();
        let named = Key::from_uri(&uri, Some("api.example.com")).unwrap();
        assert_ne!(plain, named);
        assert_eq!(named.host(), "api.example.com");

        // cleartext ignores the server name
        let uri = Uri::from_static("http://10.0.0.1/");
        assert_eq!(Key::from_uri(&uri, Some("api.example.com")).unwrap().host(), "10.0.0.1");
    }

    #[test]
    fn invalid_uris() {
        assert!(matches!(
            Key::from_uri(&Uri::from_static("/relative"), None),
            Err(InvalidUrl::MissingScheme)
        ));
        assert!(matches!(
            Key::from_uri(&Uri::from_static("ftp://example.com"), None),
            Err(InvalidUrl::UnknownScheme)
        ));
    }
}
