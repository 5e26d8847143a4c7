use std::{
    fmt, io, mem,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf as _, Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt as _;
use http::{HeaderMap, StatusCode, Uri, Version};
use tokio::sync::mpsc;

use crate::{
    client::PayloadError,
    continuation::{ContinuationOutcome, ContinuationState},
};

/// Default limit of [`ResponseBody::bytes`].
pub(crate) const DEFAULT_BODY_LIMIT: usize = 8 * 1024 * 1024;

pub(crate) type BodySender = mpsc::UnboundedSender<Result<Bytes, PayloadError>>;

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseHead {
    pub(crate) fn new(version: Version, status: StatusCode, headers: HeaderMap) -> Self {
        ResponseHead {
            version,
            status,
            headers,
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Body of a response, fed by the connection as chunks arrive.
///
/// Chunks that arrive before the body is read are buffered. The stream ends after the last
/// chunk, or yields a [`PayloadError`] if the exchange failed while the body was streaming.
pub struct ResponseBody {
    rx: mpsc::UnboundedReceiver<Result<Bytes, PayloadError>>,
    limit: usize,
}

impl ResponseBody {
    pub(crate) fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            ResponseBody {
                rx,
                limit: DEFAULT_BODY_LIMIT,
            },
        )
    }

    /// An already finished, empty body.
    pub(crate) fn empty() -> Self {
        Self::channel().1
    }

    /// Change max size of the body collected by [`bytes`](Self::bytes).
    ///
    /// The default limit is 8 MiB.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Collects the whole body.
    pub async fn bytes(mut self) -> Result<Bytes, PayloadError> {
        let mut buf = BytesMut::new();

        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > self.limit {
                return Err(PayloadError::Overflow(self.limit));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(buf.freeze())
    }

    /// Converts the body into a blocking reader.
    ///
    /// The reader must not be used from within an async context.
    pub fn into_reader(self) -> BodyReader {
        BodyReader {
            body: self,
            current: Bytes::new(),
        }
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, PayloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// Blocking [`io::Read`] adapter over a [`ResponseBody`].
#[derive(Debug)]
pub struct BodyReader {
    body: ResponseBody,
    current: Bytes,
}

impl io::Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.body.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Client Response
pub struct ClientResponse {
    pub(crate) head: ResponseHead,
    pub(crate) body: ResponseBody,
    pub(crate) uri: Uri,
    pub(crate) continuation: ContinuationState,
}

impl ClientResponse {
    pub(crate) fn new(head: ResponseHead, body: ResponseBody, uri: Uri) -> Self {
        ClientResponse {
            head,
            body,
            uri,
            continuation: ContinuationState::default(),
        }
    }

    #[inline]
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Read the Response Version.
    #[inline]
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Get the status from the server.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Returns response's headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// URI of the request that produced this response, after any redirects.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Outcome of the `Expect: 100-continue` handshake, if one was performed.
    pub fn continuation(&self) -> Option<ContinuationOutcome> {
        self.continuation.outcome()
    }

    /// Full state of the `Expect: 100-continue` handshake.
    pub fn continuation_state(&self) -> ContinuationState {
        self.continuation
    }

    /// Takes the body out, leaving an empty one in its place.
    pub fn take_body(&mut self) -> ResponseBody {
        mem::replace(&mut self.body, ResponseBody::empty())
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Collects the body, see [`ResponseBody::bytes`].
    pub async fn bytes(&mut self) -> Result<Bytes, PayloadError> {
        self.take_body().bytes().await
    }
}

impl Stream for ClientResponse {
    type Item = Result<Bytes, PayloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().body).poll_next(cx)
    }
}

impl fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nClientResponse {:?} {}", self.version(), self.status())?;
        writeln!(f, "  uri: {}", self.uri)?;
        writeln!(f, "  headers:")?;
        for (key, val) in self.headers().iter() {
            writeln!(f, "    {:?}: {:?}", key, val)?;
        }
        Ok(())
    }
}
