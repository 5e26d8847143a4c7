use actix_rt::time::{timeout, Instant};
use actix_utils::future::poll_fn;
use bytes::Bytes;
use h2::{
    client::{Builder, SendRequest},
    RecvStream, SendStream,
};
use http::{
    header::{HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE},
    request::Request,
    Method, Version,
};
use log::trace;
use tokio_util::sync::CancellationToken;

use super::{
    chain::{guarded, Dispatch, Event, HandlerChain},
    config::ConnectorConfig,
    connection::{ConnectionIo, H2ConnectionInner},
    error::{ConnectError, SendRequestError},
};
use crate::{entity::Entity, h1::BodyFraming, request::RequestHead, response::ResponseHead};

/// Sends one request on an HTTP/2 connection and feeds the response into `chain`.
///
/// Returns whether the connection may carry further exchanges.
pub(crate) async fn send_request(
    sender: SendRequest<Bytes>,
    mut head: RequestHead,
    mut entity: Entity,
    chain: &mut HandlerChain,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<bool, SendRequestError> {
    let framing = guarded(entity.commit(&mut head), cancel, deadline).await?;
    trace!("sending {} {} over HTTP/2: {:?}", head.method, head.uri, framing);

    let head_req = head.method == Method::HEAD;
    let eof = framing == BodyFraming::Empty;

    let mut req = Request::new(());
    *req.uri_mut() = head.uri.clone();
    *req.method_mut() = head.method.clone();
    *req.version_mut() = Version::HTTP_2;

    if let BodyFraming::Length(len) = framing {
        let mut buf = itoa::Buffer::new();
        if let Ok(value) = HeaderValue::from_str(buf.format(len)) {
            req.headers_mut().insert(CONTENT_LENGTH, value);
        }
    }

    for (key, value) in head.headers.iter() {
        match *key {
            // omit HTTP/1.x only headers
            CONNECTION | TRANSFER_ENCODING | HOST | UPGRADE | CONTENT_LENGTH => continue,
            _ => {}
        }
        req.headers_mut().append(key, value.clone());
    }

    let exchange = async {
        let mut sender = sender;
        poll_fn(|cx| sender.poll_ready(cx)).await?;

        let (fut, send) = sender.send_request(req, eof)?;
        if !eof {
            send_body(&mut entity, send).await?;
        }

        Ok::<_, SendRequestError>(fut)
    };
    let fut = guarded(exchange, cancel, deadline).await?;

    // inactivity is measured from the end of the request
    chain.activity().touch();

    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            chain.dispatch(Event::Cancelled)?;
            return Err(chain.closed());
        }
        kind = chain.expired() => {
            chain.dispatch(Event::TimedOut(kind))?;
            return Err(chain.closed());
        }
        res = fut => res?,
    };

    let (parts, body) = res.into_parts();
    chain.activity().touch();

    chain.dispatch(Event::StatusLine(parts.version, parts.status))?;
    let head = ResponseHead::new(parts.version, parts.status, parts.headers);
    chain.dispatch(Event::Head(head))?;

    if head_req {
        chain.dispatch(Event::Terminal)?;
        return Ok(true);
    }

    recv_body(body, chain, cancel).await?;
    Ok(true)
}

async fn recv_body(
    mut body: RecvStream,
    chain: &mut HandlerChain,
    cancel: &CancellationToken,
) -> Result<(), SendRequestError> {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                chain.dispatch(Event::Cancelled)?;
                return Err(chain.closed());
            }
            kind = chain.expired() => {
                chain.dispatch(Event::TimedOut(kind))?;
                return Err(chain.closed());
            }
            chunk = body.data() => chunk,
        };

        match chunk {
            Some(Ok(chunk)) => {
                chain.activity().touch();
                let _ = body.flow_control().release_capacity(chunk.len());

                if chain.dispatch(Event::Chunk(chunk))? != Dispatch::Continue {
                    return Ok(());
                }
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                chain.dispatch(Event::Terminal)?;
                return Ok(());
            }
        }
    }
}

async fn send_body(
    entity: &mut Entity,
    mut send: SendStream<Bytes>,
) -> Result<(), SendRequestError> {
    let mut buf: Option<Bytes> = None;

    loop {
        if buf.is_none() {
            match entity.next_chunk().await? {
                Some(b) => {
                    send.reserve_capacity(b.len());
                    buf = Some(b);
                }
                None => {
                    send.send_data(Bytes::new(), true)?;
                    send.reserve_capacity(0);
                    return Ok(());
                }
            }
        }

        match poll_fn(|cx| send.poll_capacity(cx)).await {
            None => return Ok(()),
            Some(Ok(cap)) => {
                if let Some(b) = buf.as_mut() {
                    let len = b.len();
                    let bytes = b.split_to(std::cmp::min(cap, len));
                    send.send_data(bytes, false)?;

                    if !b.is_empty() {
                        send.reserve_capacity(b.len());
                    } else {
                        buf = None;
                    }
                }
            }
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

/// Performs the HTTP/2 connection preface and starts the connection task.
pub(crate) async fn handshake<Io: ConnectionIo>(
    io: Io,
    config: &ConnectorConfig,
) -> Result<H2ConnectionInner, ConnectError> {
    let mut builder = Builder::new();
    builder
        .initial_window_size(config.stream_window_size)
        .initial_connection_window_size(config.conn_window_size)
        .enable_push(false);

    let (sender, connection) = timeout(config.handshake_timeout, builder.handshake(io))
        .await
        .map_err(|_| ConnectError::Timeout)??;

    let inner = H2ConnectionInner::new(sender, connection);
    inner.sender().ready().await?;
    Ok(inner)
}
