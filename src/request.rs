use std::{fmt, io};

use bytes::Bytes;
use futures_core::Stream;
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, Method, Uri, Version,
};

use crate::{
    client::RequestSettings,
    entity::{Body, EntitySink},
    BoxError,
};

/// Method, target and headers of an outbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        RequestHead {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

impl Default for RequestHead {
    fn default() -> Self {
        RequestHead::new(Method::GET, Uri::default())
    }
}

/// An HTTP request to submit to a [`Connector`](crate::Connector).
///
/// ```
/// use courier::{ClientRequest, RequestSettings};
/// use std::time::Duration;
///
/// let req = ClientRequest::post("http://localhost:8080/upload")
///     .insert_header(("x-request-id", "42"))
///     .settings(RequestSettings::new().read_timeout(Duration::from_secs(10)))
///     .body("payload");
///
/// assert_eq!(req.method(), &http::Method::POST);
/// ```
pub struct ClientRequest {
    pub(crate) head: RequestHead,
    body: Body,
    settings: RequestSettings,
    err: Option<http::Error>,
}

impl ClientRequest {
    /// Create request with given method and URI.
    pub fn new<U>(method: Method, uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        let (uri, err) = match Uri::try_from(uri) {
            Ok(uri) => (uri, None),
            Err(err) => (Uri::default(), Some(err.into())),
        };

        ClientRequest {
            head: RequestHead::new(method, uri),
            body: Body::None,
            settings: RequestSettings::default(),
            err,
        }
    }

    pub fn get<U>(uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        ClientRequest::new(Method::GET, uri)
    }

    pub fn head<U>(uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        ClientRequest::new(Method::HEAD, uri)
    }

    pub fn post<U>(uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        ClientRequest::new(Method::POST, uri)
    }

    pub fn put<U>(uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        ClientRequest::new(Method::PUT, uri)
    }

    pub fn patch<U>(uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        ClientRequest::new(Method::PATCH, uri)
    }

    pub fn delete<U>(uri: U) -> Self
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        ClientRequest::new(Method::DELETE, uri)
    }

    /// Get the request URI.
    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    /// Get the request method.
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Set HTTP version of this request.
    ///
    /// HTTP/2 is negotiated per connection; this only selects between HTTP/1.0 and HTTP/1.1.
    pub fn version(mut self, version: Version) -> Self {
        self.head.version = version;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    /// Insert a header, replacing any that were set with an equivalent field name.
    pub fn insert_header<K, V>(mut self, (key, value): (K, V)) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match header_pair(key, value) {
            Ok((key, value)) => {
                self.head.headers.insert(key, value);
            }
            Err(err) => self.err = Some(err),
        }
        self
    }

    /// Append a header, keeping any that were set with an equivalent field name.
    pub fn append_header<K, V>(mut self, (key, value): (K, V)) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match header_pair(key, value) {
            Ok((key, value)) => {
                self.head.headers.append(key, value);
            }
            Err(err) => self.err = Some(err),
        }
        self
    }

    /// Set a body of known content.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// Set a streaming body. A known `length` is sent as `Content-Length`.
    pub fn streaming<S, E>(mut self, stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        use futures_util::TryStreamExt as _;

        self.body = Body::Stream {
            stream: Box::pin(stream.map_err(Into::<BoxError>::into)),
            length,
        };
        self
    }

    /// Set a body produced by blocking code writing into an [`EntitySink`].
    ///
    /// The writer runs on the worker pool. Headers can still be changed through the sink until
    /// the first byte is written.
    pub fn entity<F>(mut self, length: Option<u64>, writer: F) -> Self
    where
        F: FnOnce(&mut EntitySink) -> io::Result<()> + Send + 'static,
    {
        self.body = Body::Writer {
            writer: Box::new(writer),
            length,
        };
        self
    }

    /// Replace the per-request settings.
    pub fn settings(mut self, settings: RequestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings_mut(&mut self) -> &mut RequestSettings {
        &mut self.settings
    }

    pub(crate) fn into_parts(self) -> Result<(RequestHead, Body, RequestSettings), http::Error> {
        match self.err {
            Some(err) => Err(err),
            None => Ok((self.head, self.body, self.settings)),
        }
    }
}

fn header_pair<K, V>(key: K, value: V) -> Result<(HeaderName, HeaderValue), http::Error>
where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
{
    let key = HeaderName::try_from(key).map_err(Into::<http::Error>::into)?;
    let value = HeaderValue::try_from(value).map_err(Into::<http::Error>::into)?;
    Ok((key, value))
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\nClientRequest {:?} {} {}",
            self.head.version, self.head.method, self.head.uri
        )?;
        writeln!(f, "  headers:")?;
        for (key, val) in self.head.headers.iter() {
            writeln!(f, "    {:?}: {:?}", key, val)?;
        }
        writeln!(f, "  body: {:?}", self.body)
    }
}
