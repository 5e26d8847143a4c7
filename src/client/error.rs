use std::io;

use derive_more::{Display, From};
use http::{StatusCode, Uri};

use crate::BoxError;

/// Invalid connector configuration, reported when the connector is constructed.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum SetupError {
    /// A timeout or pool size was configured with a negative value.
    #[display("`{option}` must not be negative, got {value}")]
    Negative { option: &'static str, value: i64 },

    /// A configuration value could not be parsed.
    #[display("invalid value for `{option}`: {value:?}")]
    InvalidValue { option: &'static str, value: String },

    /// A size limit that must be positive was set to zero.
    #[display("`{}` must be greater than zero", _0)]
    ZeroLimit(&'static str),

    /// TLS client configuration could not be built.
    #[display("TLS configuration error: {}", _0)]
    Tls(String),

    /// The connector's I/O runtime could not be started.
    #[display("failed to start I/O runtime: {}", _0)]
    Runtime(io::Error),
}

impl std::error::Error for SetupError {}

/// A set of errors that can occur while connecting to an HTTP host.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum ConnectError {
    /// SSL feature is not enabled
    #[display("SSL is not supported")]
    SslIsNotSupported,

    /// TLS handshake failed
    #[display("TLS handshake failed: {}", _0)]
    Tls(io::Error),

    /// Server name can not be used for TLS SNI
    #[display("Invalid TLS server name: {}", _0)]
    InvalidServerName(String),

    /// Negotiated application protocol is not supported
    #[display("Unsupported protocol negotiated: {}", _0)]
    UnsupportedProtocol(String),

    /// Proxy refused to open a tunnel
    #[display("Proxy tunnel rejected with status {}", _0)]
    Tunnel(StatusCode),

    /// Http2 error
    #[display("{}", _0)]
    H2(h2::Error),

    /// Connecting took too long
    #[display("Timeout while establishing connection")]
    Timeout,

    /// Connector has been disconnected
    #[display("Connector has been closed")]
    Disconnected,

    /// Unresolved host name
    #[display("Connector received `Connect` with unresolved host")]
    Unresolved,

    /// Connection io error
    #[display("{}", _0)]
    Io(io::Error),
}

impl std::error::Error for ConnectError {}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        ConnectError::Io(err)
    }
}

impl From<h2::Error> for ConnectError {
    fn from(err: h2::Error) -> Self {
        ConnectError::H2(err)
    }
}

#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum InvalidUrl {
    #[display("Missing URL scheme")]
    MissingScheme,

    #[display("Unknown URL scheme")]
    UnknownScheme,

    #[display("Missing host name")]
    MissingHost,

    #[display("URL parse error: {}", _0)]
    HttpError(http::Error),
}

impl std::error::Error for InvalidUrl {}

/// Malformed or unexpected response framing.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum ProtocolError {
    /// An invalid `HttpVersion`, such as `HTP/1.1`
    #[display("invalid HTTP version specified")]
    Version,

    /// An invalid status line, such as `HTTP/1.1 1337 ELITE`
    #[display("invalid status line")]
    Status,

    /// An invalid header
    #[display("invalid header provided")]
    Header,

    /// Status line longer than the configured limit
    #[display("status line exceeds {} bytes", _0)]
    LineTooLong(usize),

    /// Header section larger than the configured limit
    #[display("header section exceeds {} bytes", _0)]
    HeadersTooLarge(usize),

    /// More header fields than the decoder accepts
    #[display("too many headers")]
    TooManyHeaders,

    /// Chunked transfer coding could not be decoded
    #[display("invalid chunked encoding: {}", _0)]
    Chunked(io::Error),

    /// A status other than continue or a known rejection arrived during the continuation
    /// handshake
    #[display("unexpected status {} during continuation handshake", _0)]
    UnexpectedContinuation(StatusCode),

    /// Server switched protocols without being asked to
    #[display("unsolicited protocol switch")]
    Upgrade,

    /// A message part arrived out of order
    #[display("unexpected {} while {}", _0, _1)]
    OutOfOrder(&'static str, &'static str),

    /// An I/O error surfaced by the decoder
    #[display("I/O error: {}", _0)]
    Io(io::Error),
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

/// Which of the three timeout tiers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TimeoutKind {
    /// Bounds connection establishment, including TLS and HTTP/2 handshakes.
    #[display("connect")]
    Connect,

    /// Fires when no bytes arrive within the inactivity window.
    #[display("read")]
    Read,

    /// Deadline across the whole exchange, including every redirect hop.
    #[display("total")]
    Total,
}

/// Terminal failures while following redirects.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum RedirectError {
    /// Redirect status without a usable `Location` header
    #[display("redirect response ({}) has no Location header", _0)]
    MissingLocation(StatusCode),

    /// `Location` could not be resolved to an absolute URI
    #[display("invalid redirect location {:?}", _0)]
    InvalidLocation(String),

    /// The redirect target was already visited by this exchange
    #[display("redirect loop detected at {}", _0)]
    LoopDetected(Uri),

    /// More redirects than allowed
    #[display("maximum number of redirects ({}) exceeded", _0)]
    LimitExceeded(usize),

    /// A streamed request body can not be sent a second time
    #[display("request body can not be replayed for redirect to {}", _0)]
    NonReplayableBody(Uri),
}

impl std::error::Error for RedirectError {}

/// Errors observed by a reader of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum PayloadError {
    /// The body ended before its terminal marker
    #[display("payload reached EOF before completing")]
    Incomplete,

    /// A timeout fired while the body was streaming
    #[display("{} timeout while reading payload", _0)]
    Timeout(TimeoutKind),

    /// The exchange was canceled while the body was streaming
    #[display("exchange canceled while reading payload")]
    Canceled,

    /// The body is larger than the requested limit
    #[display("payload exceeds limit of {} bytes", _0)]
    Overflow(usize),
}

impl std::error::Error for PayloadError {}

impl From<&SendRequestError> for PayloadError {
    fn from(err: &SendRequestError) -> Self {
        match err {
            SendRequestError::Timeout(kind) => PayloadError::Timeout(*kind),
            SendRequestError::Canceled => PayloadError::Canceled,
            _ => PayloadError::Incomplete,
        }
    }
}

impl From<PayloadError> for io::Error {
    fn from(err: PayloadError) -> Self {
        let kind = match err {
            PayloadError::Timeout(_) => io::ErrorKind::TimedOut,
            PayloadError::Canceled => io::ErrorKind::Interrupted,
            PayloadError::Incomplete => io::ErrorKind::UnexpectedEof,
            PayloadError::Overflow(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// A set of errors that can occur during request sending and response reading
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum SendRequestError {
    /// Invalid URL
    #[display("Invalid URL: {}", _0)]
    Url(InvalidUrl),

    /// Failed to connect to host
    #[display("Failed to connect to host: {}", _0)]
    Connect(ConnectError),

    /// Malformed or unexpected response framing
    #[display("Protocol error: {}", _0)]
    Protocol(ProtocolError),

    /// One of the timeout tiers fired
    #[display("Timeout: {} timeout elapsed", _0)]
    Timeout(TimeoutKind),

    /// Redirect could not be followed
    #[display("Redirect failed: {}", _0)]
    Redirect(RedirectError),

    /// Exchange was canceled by the caller
    #[display("Exchange was canceled")]
    Canceled,

    /// Connection dropped with no more specific cause
    #[display("Connection closed before the response completed")]
    Closed,

    /// Reported on response-done when the cause was already delivered on response-available
    #[display("Exchange aborted before the response became available")]
    Aborted,

    /// Error sending request
    Send(io::Error),

    /// Http error
    #[display("{}", _0)]
    Http(http::Error),

    /// Http2 error
    #[display("{}", _0)]
    H2(h2::Error),

    /// Error producing the request body
    Body(BoxError),
}

impl SendRequestError {
    /// Returns the timeout tier if this error is a timeout.
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            SendRequestError::Timeout(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Returns true if the failure was raised while following redirects.
    pub fn is_redirect(&self) -> bool {
        matches!(self, SendRequestError::Redirect(_))
    }
}

impl std::error::Error for SendRequestError {}

/// Failure reported by the blocking submission API; carries the original cause.
#[derive(Debug, Display)]
#[display("Request processing failed: {}", cause)]
pub struct ProcessingError {
    cause: SendRequestError,
}

impl ProcessingError {
    /// Original failure.
    pub fn cause(&self) -> &SendRequestError {
        &self.cause
    }

    pub fn into_cause(self) -> SendRequestError {
        self.cause
    }
}

impl From<SendRequestError> for ProcessingError {
    fn from(cause: SendRequestError) -> Self {
        ProcessingError { cause }
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
