use std::{io::Write, pin::Pin};

use actix_codec::{AsyncRead, AsyncWrite, Decoder as _, Encoder as _};
use actix_rt::time::{sleep, Instant, Sleep};
use bytes::{buf::BufMut, BytesMut};
use http::{
    header::{HeaderValue, EXPECT, HOST},
    Method, StatusCode,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;

use super::{
    chain::{guarded, Dispatch, Event, HandlerChain},
    config::{CodecLimits, ExchangeSettings},
    connection::{ActivityIo, ConnectionIo},
    error::{ConnectError, SendRequestError, TimeoutKind},
};
use crate::{
    continuation::{should_engage, ContinuationOutcome},
    entity::Entity,
    h1::{RequestEncoder, RequestMessage, ResponseDecoder, ResponseMessage},
    request::RequestHead,
    response::ResponseHead,
};

const LW_BUFFER_SIZE: usize = 1024;
const HW_BUFFER_SIZE: usize = 8 * 1024;

/// Result of one wait on the connection.
enum Wake {
    Data,
    Eof,
    Timeout(TimeoutKind),
    Cancelled,
    ContinuationTimeout,
}

/// Sends one request over an HTTP/1 connection and feeds the response into `chain`.
///
/// Returns the connection and whether it may carry another exchange.
pub(crate) async fn send_request(
    io: Box<dyn ConnectionIo>,
    mut head: RequestHead,
    mut entity: Entity,
    chain: &mut HandlerChain,
    settings: &ExchangeSettings,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<(Box<dyn ConnectionIo>, bool), SendRequestError> {
    set_host(&mut head);

    let mut io = ActivityIo::new(io, chain.activity().clone());
    let framing = guarded(entity.commit(&mut head), cancel, deadline).await?;

    let expect = should_engage(&head.method, framing, &settings.continuation);
    if expect {
        head.headers
            .insert(EXPECT, HeaderValue::from_static("100-continue"));
        chain.attach_continuation();
    }

    let mut decoder = ResponseDecoder::new(settings.limits);
    decoder.set_head_request(head.method == Method::HEAD);

    let mut encoder = RequestEncoder::default();
    let mut write_buf = BytesMut::with_capacity(HW_BUFFER_SIZE);
    let mut read_buf = BytesMut::with_capacity(HW_BUFFER_SIZE);

    log::trace!("sending {} {} over HTTP/1", head.method, head.uri);
    encoder.encode(RequestMessage::Head(head, framing), &mut write_buf)?;

    let mut finished = false;
    let mut send_body = true;

    if expect {
        guarded(flush_buf(&mut io, &mut write_buf), cancel, deadline).await?;

        // inactivity is measured from the end of the head
        chain.activity().touch();

        let mut continuation = Box::pin(sleep(settings.continuation.timeout));

        while chain.continuation_outcome().is_none() && !finished {
            let wake =
                read_wake(&mut io, &mut read_buf, chain, cancel, Some(&mut continuation)).await?;
            match wake {
                Wake::Data => finished = drain(&mut decoder, &mut read_buf, chain)?,
                Wake::ContinuationTimeout => chain.continuation_timed_out(),
                wake => match abort(wake, &mut decoder, &mut read_buf, chain)? {
                    Some(err) => return Err(err),
                    None => finished = true,
                },
            }
        }

        if let Some(ContinuationOutcome::Rejected(status)) = chain.continuation_outcome() {
            log::debug!("request body withheld after {status}");
            send_body = false;
        }
    }

    if send_body {
        let write = async {
            while let Some(chunk) = entity.next_chunk().await? {
                encoder.encode(RequestMessage::Chunk(Some(chunk)), &mut write_buf)?;
                if write_buf.len() >= HW_BUFFER_SIZE {
                    flush_buf(&mut io, &mut write_buf).await?;
                }
            }
            encoder.encode(RequestMessage::Chunk(None), &mut write_buf)?;
            flush_buf(&mut io, &mut write_buf).await
        };
        guarded(write, cancel, deadline).await?;

        // inactivity is measured from the end of the request
        chain.activity().touch();
    }

    while !finished {
        match read_wake(&mut io, &mut read_buf, chain, cancel, None).await? {
            Wake::Data => finished = drain(&mut decoder, &mut read_buf, chain)?,
            wake => match abort(wake, &mut decoder, &mut read_buf, chain)? {
                Some(err) => return Err(err),
                None => finished = true,
            },
        }
    }

    let reusable = send_body && decoder.keep_alive() && read_buf.is_empty();
    Ok((io.into_inner(), reusable))
}

/// Sets the `Host` header from the request URI unless the caller provided one.
fn set_host(head: &mut RequestHead) {
    if head.headers.contains_key(HOST) {
        return;
    }

    if let Some(host) = head.uri.host() {
        let mut wrt = BytesMut::with_capacity(host.len() + 6).writer();

        let res = match head.uri.port_u16() {
            None | Some(80) | Some(443) => write!(wrt, "{}", host),
            Some(port) => write!(wrt, "{}:{}", host, port),
        };

        match res
            .ok()
            .and_then(|_| HeaderValue::from_maybe_shared(wrt.into_inner().freeze()).ok())
        {
            Some(value) => {
                head.headers.insert(HOST, value);
            }
            None => log::error!("can not set Host header for {}", head.uri),
        }
    }
}

async fn flush_buf<Io>(io: &mut Io, buf: &mut BytesMut) -> Result<(), SendRequestError>
where
    Io: AsyncWrite + Unpin,
{
    io.write_all(buf).await?;
    io.flush().await?;
    buf.clear();
    Ok(())
}

async fn read_wake<Io>(
    io: &mut Io,
    buf: &mut BytesMut,
    chain: &mut HandlerChain,
    cancel: &CancellationToken,
    continuation: Option<&mut Pin<Box<Sleep>>>,
) -> Result<Wake, SendRequestError>
where
    Io: AsyncRead + Unpin,
{
    if buf.capacity() - buf.len() < LW_BUFFER_SIZE {
        buf.reserve(HW_BUFFER_SIZE);
    }

    let continuation = async {
        match continuation {
            Some(timer) => timer.as_mut().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Wake::Cancelled),
        kind = chain.expired() => Ok(Wake::Timeout(kind)),
        _ = continuation => Ok(Wake::ContinuationTimeout),
        res = io.read_buf(buf) => match res? {
            0 => Ok(Wake::Eof),
            _ => Ok(Wake::Data),
        },
    }
}

/// Decodes everything buffered; returns true once the response is complete.
fn drain(
    decoder: &mut ResponseDecoder,
    buf: &mut BytesMut,
    chain: &mut HandlerChain,
) -> Result<bool, SendRequestError> {
    while let Some(msg) = decoder.decode(buf)? {
        if deliver(msg, chain)? != Dispatch::Continue {
            return Ok(true);
        }
    }
    Ok(false)
}

fn deliver(msg: ResponseMessage, chain: &mut HandlerChain) -> Result<Dispatch, SendRequestError> {
    let event = match msg {
        ResponseMessage::Status(version, status) => Event::StatusLine(version, status),
        ResponseMessage::Head(head) => Event::Head(head),
        ResponseMessage::Chunk(chunk) => Event::Chunk(chunk),
        ResponseMessage::Eof => Event::Terminal,
    };
    chain.dispatch(event)
}

/// Turns a wake that ends the exchange into its error.
///
/// A read-to-EOF body legitimately ends with the connection and yields `None`.
fn abort(
    wake: Wake,
    decoder: &mut ResponseDecoder,
    buf: &mut BytesMut,
    chain: &mut HandlerChain,
) -> Result<Option<SendRequestError>, SendRequestError> {
    match wake {
        Wake::Timeout(kind) => {
            chain.dispatch(Event::TimedOut(kind))?;
        }
        Wake::Cancelled => {
            log::debug!("exchange canceled while reading response");
            chain.dispatch(Event::Cancelled)?;
        }
        Wake::Eof => {
            while let Some(msg) = decoder.decode_eof(buf)? {
                if deliver(msg, chain)? != Dispatch::Continue {
                    break;
                }
            }
            if decoder.is_done() {
                return Ok(None);
            }
        }
        Wake::Data | Wake::ContinuationTimeout => {}
    }

    Ok(Some(chain.closed()))
}

/// Opens a `CONNECT` tunnel through an HTTP proxy.
pub(crate) async fn open_tunnel<Io>(
    mut io: Io,
    authority: &str,
    authorization: Option<HeaderValue>,
    limits: CodecLimits,
) -> Result<Io, ConnectError>
where
    Io: ConnectionIo,
{
    let mut buf = BytesMut::with_capacity(256).writer();
    write!(buf, "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n")?;
    if let Some(auth) = authorization {
        buf.get_mut().put_slice(b"Proxy-Authorization: ");
        buf.get_mut().put_slice(auth.as_bytes());
        buf.get_mut().put_slice(b"\r\n");
    }
    buf.get_mut().put_slice(b"\r\n");

    io.write_all(buf.get_ref()).await?;
    io.flush().await?;

    let mut decoder = ResponseDecoder::new(limits);
    let mut read_buf = BytesMut::with_capacity(LW_BUFFER_SIZE);

    let head = loop {
        match decoder.decode(&mut read_buf).map_err(protocol_io)? {
            Some(ResponseMessage::Head(head)) if !head.status().is_informational() => break head,
            Some(_) => continue,
            None => {}
        }

        if io.read_buf(&mut read_buf).await? == 0 {
            return Err(ConnectError::Disconnected);
        }
    };

    tunnel_status(&head)?;
    log::debug!("proxy tunnel to {authority} established");
    Ok(io)
}

fn tunnel_status(head: &ResponseHead) -> Result<(), ConnectError> {
    match head.status() {
        status if status.is_success() => Ok(()),
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            log::warn!("proxy requires authentication");
            Err(ConnectError::Tunnel(StatusCode::PROXY_AUTHENTICATION_REQUIRED))
        }
        status => Err(ConnectError::Tunnel(status)),
    }
}

fn protocol_io(err: crate::client::ProtocolError) -> ConnectError {
    ConnectError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}
