//! `courier` is an asynchronous HTTP client connector.
//!
//! It turns a logical outbound request into wire traffic over pooled connections and hands the
//! response back through two independent completion signals: one that resolves as soon as the
//! status line and headers are known, and one that resolves once the body has been drained or
//! the exchange has otherwise terminated.
//!
//! # Submitting a request
//! ```no_run
//! # #[actix_rt::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use courier::{ClientRequest, Connector};
//!
//! let connector = Connector::builder().finish()?;
//!
//! let mut exchange = connector.submit(ClientRequest::get("http://www.rust-lang.org"));
//! let mut response = exchange.available().await?;
//! println!("Response: {:?}", response.status());
//!
//! let body = response.bytes().await?;
//! exchange.done().await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```
//!
//! # Blocking callers
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use courier::{ClientRequest, Connector};
//!
//! let connector = Connector::builder().finish()?;
//! let response = connector.send(ClientRequest::post("http://httpbin.org/post").body("payload"))?;
//!
//! let mut body = String::new();
//! std::io::Read::read_to_string(&mut response.into_body().into_reader(), &mut body)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Request bodies
//! A body is framed with one of three [`TransferMode`]s. Bodies of known length are sent with
//! a `Content-Length`, bodies of unknown length are chunked, and bodies that must not be
//! chunked are buffered first so their length can be discovered. Bodies produced by blocking
//! serialization code are written into an [`EntitySink`] on a worker thread so connection
//! threads are never blocked by caller code.
//!
//! # Redirects, continuation and timeouts
//! Redirects are followed by default, bounded by a visited-set loop guard and a hop limit. An
//! `Expect: 100-continue` handshake can be enabled for large or streamed bodies. Connect, read
//! (inactivity) and total timeouts are configured independently on [`ConnectorConfig`] and can
//! be overridden per request with [`RequestSettings`].

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod client;
mod connector;
mod continuation;
mod entity;
pub mod error;
mod exchange;
mod h1;
mod redirect;
mod request;
mod response;

pub use self::client::{
    properties, BoxTransport, CodecLimits, Connect, ConnectionIo, ConnectionPool,
    ConnectorConfig, ContinuationConfig, Key, PoolLimits, Protocol, ProxyConfig, RedirectPolicy,
    RequestSettings, Scheme, TcpTransport, TransportFuture,
};
pub use self::connector::{Connector, ConnectorBuilder};
pub use self::continuation::{ContinuationOutcome, ContinuationState};
pub use self::entity::{Body, BodyStream, BodyWriter, EntityProcessing, EntitySink, TransferMode};
pub use self::exchange::{Canceller, ExchangeHandle, ResponseAvailable, ResponseDone};
pub use self::request::{ClientRequest, RequestHead};
pub use self::response::{BodyReader, ClientResponse, ResponseBody, ResponseHead};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
