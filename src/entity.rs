//! Request body sources and transfer-mode selection.

use std::{fmt, io, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt as _;
use http::HeaderMap;
use tokio::sync::{mpsc, oneshot};

use crate::{client::SendRequestError, h1::BodyFraming, request::RequestHead, BoxError};

/// Chunks buffered between a blocking body writer and the connection.
const SINK_CAPACITY: usize = 16;

/// Streaming request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Blocking body producer, run on the worker pool.
pub type BodyWriter = Box<dyn FnOnce(&mut EntitySink) -> io::Result<()> + Send>;

/// How a request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// `Content-Length` known before the body is produced.
    PresetLength(u64),
    /// Body is buffered in full so its `Content-Length` can be sent.
    DelayedLength,
}

impl TransferMode {
    /// Picks the transfer mode for a body of the given length.
    ///
    /// Forced chunking, or an unknown length without a buffering request, selects
    /// [`Chunked`](Self::Chunked). A known length selects [`PresetLength`](Self::PresetLength)
    /// and an unknown length that must not be chunked selects
    /// [`DelayedLength`](Self::DelayedLength).
    pub fn select(processing: Option<EntityProcessing>, length: Option<u64>) -> Self {
        match (processing, length) {
            (Some(EntityProcessing::Chunked), _) => TransferMode::Chunked,
            (_, Some(len)) => TransferMode::PresetLength(len),
            (Some(EntityProcessing::Buffered), None) => TransferMode::DelayedLength,
            (None, None) => TransferMode::Chunked,
        }
    }
}

/// Forces how bodies of unknown length are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityProcessing {
    /// Never chunk; buffer bodies of unknown length.
    Buffered,
    /// Always chunk, even when the length is known.
    Chunked,
}

/// Request body.
pub enum Body {
    None,
    Bytes(Bytes),
    Stream {
        stream: BodyStream,
        length: Option<u64>,
    },
    Writer {
        writer: BodyWriter,
        length: Option<u64>,
    },
}

impl Body {
    /// Length of the body, if known before it is produced.
    pub fn length(&self) -> Option<u64> {
        match self {
            Body::None => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Stream { length, .. } | Body::Writer { length, .. } => *length,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Body::None)
    }

    /// Copies the body if it can be sent more than once.
    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self {
            Body::None => Some(Body::None),
            Body::Bytes(bytes) => Some(Body::Bytes(bytes.clone())),
            Body::Stream { .. } | Body::Writer { .. } => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::None
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::None => write!(f, "Body::None"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length: {length:?})"),
            Body::Writer { length, .. } => write!(f, "Body::Writer(length: {length:?})"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

type HeaderGate = oneshot::Sender<Result<(HeaderMap, Option<u64>), io::Error>>;

#[derive(Debug)]
enum EntityChunk {
    Data(Bytes),
    End,
    Failed(io::Error),
}

/// Byte sink a [`BodyWriter`] serializes the request body into.
///
/// Headers can be changed until the first byte is handed to the connection; the request head
/// is not written before that point.
pub struct EntitySink {
    mode: TransferMode,
    headers: Option<HeaderMap>,
    gate: Option<HeaderGate>,
    chunks: mpsc::Sender<EntityChunk>,
    buf: BytesMut,
    chunk_size: usize,
    written: u64,
}

impl EntitySink {
    pub fn transfer_mode(&self) -> TransferMode {
        self.mode
    }

    /// Request headers, until they are committed by the first flushed byte.
    pub fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        self.headers.as_mut()
    }

    fn commit(&mut self, length: Option<u64>) -> io::Result<()> {
        if let (Some(gate), Some(headers)) = (self.gate.take(), self.headers.take()) {
            gate.send(Ok((headers, length)))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request was dropped"))?;
        }
        Ok(())
    }

    fn send(&mut self, chunk: EntityChunk) -> io::Result<()> {
        self.chunks
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection went away"))
    }

    fn drain(&mut self, min: usize) -> io::Result<()> {
        while !self.buf.is_empty() && self.buf.len() >= min {
            let n = self.buf.len().min(self.chunk_size);
            let chunk = self.buf.split_to(n).freeze();
            self.send(EntityChunk::Data(chunk))?;
        }
        Ok(())
    }

    fn preset_length(&self) -> Option<u64> {
        match self.mode {
            TransferMode::PresetLength(len) => Some(len),
            _ => None,
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        let length = match self.mode {
            TransferMode::DelayedLength => Some(self.buf.len() as u64),
            _ => self.preset_length(),
        };

        self.commit(length)?;
        self.drain(1)?;
        self.send(EntityChunk::End)
    }

    fn fail(mut self, err: io::Error) {
        log::debug!("request body writer failed: {err}");

        match self.gate.take() {
            Some(gate) => {
                let _ = gate.send(Err(err));
            }
            None => {
                let _ = self.chunks.blocking_send(EntityChunk::Failed(err));
            }
        }
    }
}

impl io::Write for EntitySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(len) = self.preset_length() {
            if self.written + buf.len() as u64 > len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "request body is longer than its declared length",
                ));
            }
        }

        self.written += buf.len() as u64;
        self.buf.extend_from_slice(buf);

        if self.mode != TransferMode::DelayedLength {
            let length = self.preset_length();
            self.commit(length)?;
            self.drain(self.chunk_size)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.mode != TransferMode::DelayedLength {
            let length = self.preset_length();
            self.commit(length)?;
            self.drain(1)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EntitySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySink")
            .field("mode", &self.mode)
            .field("committed", &self.headers.is_none())
            .field("written", &self.written)
            .finish()
    }
}

enum EntityState {
    Empty,
    Full(Option<Bytes>),
    Stream(BodyStream),
    Sink(mpsc::Receiver<EntityChunk>),
}

/// Body of one request while it is being sent.
pub(crate) struct Entity {
    body: Option<Body>,
    processing: Option<EntityProcessing>,
    chunk_size: usize,
    state: EntityState,
}

impl Entity {
    pub(crate) fn new(body: Body, processing: Option<EntityProcessing>, chunk_size: usize) -> Self {
        Entity {
            body: Some(body),
            processing,
            chunk_size: chunk_size.max(1),
            state: EntityState::Empty,
        }
    }

    /// Finalizes request headers and decides the body framing.
    ///
    /// Writer bodies run on the worker pool; this waits until their headers are committed.
    pub(crate) async fn commit(
        &mut self,
        head: &mut RequestHead,
    ) -> Result<BodyFraming, SendRequestError> {
        let body = self.body.take().unwrap_or_default();
        let mode = TransferMode::select(self.processing, body.length());

        let framing = match body {
            Body::None => BodyFraming::Empty,

            Body::Bytes(bytes) if bytes.is_empty() => BodyFraming::Empty,

            Body::Bytes(bytes) => {
                let len = bytes.len() as u64;
                self.state = EntityState::Full(Some(bytes));
                framing_for(mode, len)
            }

            Body::Stream { mut stream, .. } if mode == TransferMode::DelayedLength => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk.map_err(SendRequestError::Body)?);
                }

                let len = buf.len() as u64;
                self.state = EntityState::Full(Some(buf.freeze()));
                BodyFraming::Length(len)
            }

            Body::Stream { stream, length } => {
                self.state = EntityState::Stream(stream);
                framing_for(mode, length.unwrap_or(0))
            }

            Body::Writer { writer, .. } => {
                let (gate_tx, gate_rx) = oneshot::channel();
                let (tx, rx) = mpsc::channel(SINK_CAPACITY);

                let sink = EntitySink {
                    mode,
                    headers: Some(head.headers.clone()),
                    gate: Some(gate_tx),
                    chunks: tx,
                    buf: BytesMut::new(),
                    chunk_size: self.chunk_size,
                    written: 0,
                };
                spawn_writer(writer, sink);
                self.state = EntityState::Sink(rx);

                let (headers, length) = gate_rx
                    .await
                    .map_err(|_| body_error("request body writer terminated"))?
                    .map_err(|err| SendRequestError::Body(err.into()))?;

                head.headers = headers;
                match length {
                    Some(len) => BodyFraming::Length(len),
                    None => BodyFraming::Chunked,
                }
            }
        };

        log::trace!("request body framing: {:?} ({:?})", framing, mode);
        Ok(framing)
    }

    /// Next slice of the body; `None` once the body is complete.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>, SendRequestError> {
        match self.state {
            EntityState::Empty => Ok(None),

            EntityState::Full(ref mut bytes) => Ok(bytes.take()),

            EntityState::Stream(ref mut stream) => loop {
                match stream.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => return Ok(Some(chunk)),
                    Some(Err(err)) => return Err(SendRequestError::Body(err)),
                    None => return Ok(None),
                }
            },

            EntityState::Sink(ref mut rx) => match rx.recv().await {
                Some(EntityChunk::Data(chunk)) => Ok(Some(chunk)),
                Some(EntityChunk::End) => {
                    self.state = EntityState::Empty;
                    Ok(None)
                }
                Some(EntityChunk::Failed(err)) => Err(SendRequestError::Body(err.into())),
                None => Err(body_error("request body writer ended without finishing")),
            },
        }
    }
}

fn framing_for(mode: TransferMode, len: u64) -> BodyFraming {
    match mode {
        TransferMode::PresetLength(len) => BodyFraming::Length(len),
        TransferMode::DelayedLength => BodyFraming::Length(len),
        TransferMode::Chunked => BodyFraming::Chunked,
    }
}

fn body_error(msg: &'static str) -> SendRequestError {
    SendRequestError::Body(msg.into())
}

fn spawn_writer(writer: BodyWriter, mut sink: EntitySink) {
    actix_rt::task::spawn_blocking(move || {
        let res = writer(&mut sink).and_then(|_| sink.finish());
        if let Err(err) = res {
            sink.fail(err);
        }
    });
}
