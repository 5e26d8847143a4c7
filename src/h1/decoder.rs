use std::task::Poll;

use actix_codec::Decoder;
use bytes::{Buf as _, Bytes, BytesMut};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    StatusCode, Version,
};

use super::chunked::ChunkedState;
use crate::{
    client::{CodecLimits, ProtocolError},
    response::ResponseHead,
};

const MAX_HEADERS: usize = 96;

/// Parts of a response, in the order they are read off the wire.
#[derive(Debug)]
pub(crate) enum ResponseMessage {
    /// Status line was parsed.
    Status(Version, StatusCode),
    /// Header section was parsed.
    Head(ResponseHead),
    /// Slice of the response body.
    Chunk(Bytes),
    /// The response is complete.
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyKind {
    Length(u64),
    Chunked(ChunkedState, u64),
    Eof,
}

#[derive(Debug)]
enum Stage {
    StatusLine,
    Headers { version: Version, status: StatusCode },
    Body(BodyKind),
    Finished,
    Done,
}

/// Incremental HTTP/1 response decoder.
#[derive(Debug)]
pub(crate) struct ResponseDecoder {
    limits: CodecLimits,
    head_request: bool,
    keep_alive: bool,
    stage: Stage,
}

impl ResponseDecoder {
    pub(crate) fn new(limits: CodecLimits) -> Self {
        ResponseDecoder {
            limits,
            head_request: false,
            keep_alive: false,
            stage: Stage::StatusLine,
        }
    }

    /// Responses to `HEAD` never carry a body.
    pub(crate) fn set_head_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }

    /// Check if the connection can carry another exchange after this response.
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Check if the terminal marker was produced.
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }

    fn decode_status_line(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<ResponseMessage>, ProtocolError> {
        let max = self.limits.max_initial_line_length;

        let end = match src.iter().position(|b| *b == b'\n') {
            Some(end) => end,
            None if src.len() > max => return Err(ProtocolError::LineTooLong(max)),
            None => return Ok(None),
        };

        if end > max {
            return Err(ProtocolError::LineTooLong(max));
        }

        let line = src.split_to(end + 1);
        let line = match line.strip_suffix(b"\r\n") {
            Some(line) => line,
            None => &line[..end],
        };

        let mut parts = line.splitn(3, |b| *b == b' ');

        let version = match parts.next() {
            Some(b"HTTP/1.1") => Version::HTTP_11,
            Some(b"HTTP/1.0") => Version::HTTP_10,
            _ => return Err(ProtocolError::Version),
        };

        let status = match parts.next() {
            Some(code) if code.len() == 3 => {
                StatusCode::from_bytes(code).map_err(|_| ProtocolError::Status)?
            }
            _ => return Err(ProtocolError::Status),
        };

        log::trace!("status line: {:?} {}", version, status);

        self.stage = Stage::Headers { version, status };
        Ok(Some(ResponseMessage::Status(version, status)))
    }

    fn decode_headers(
        &mut self,
        src: &mut BytesMut,
        version: Version,
        status: StatusCode,
    ) -> Result<Option<ResponseMessage>, ProtocolError> {
        let max = self.limits.max_header_size;

        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (len, headers) = match httparse::parse_headers(&src[..], &mut parsed) {
            Ok(httparse::Status::Complete((len, headers))) => {
                if len > max {
                    return Err(ProtocolError::HeadersTooLarge(max));
                }

                let mut map = HeaderMap::with_capacity(headers.len());
                for h in headers {
                    let name = HeaderName::from_bytes(h.name.as_bytes())
                        .map_err(|_| ProtocolError::Header)?;
                    let value =
                        HeaderValue::from_bytes(h.value).map_err(|_| ProtocolError::Header)?;
                    map.append(name, value);
                }

                (len, map)
            }
            Ok(httparse::Status::Partial) if src.len() > max => {
                return Err(ProtocolError::HeadersTooLarge(max))
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => return Err(ProtocolError::TooManyHeaders),
            Err(_) => return Err(ProtocolError::Header),
        };

        src.advance(len);

        if status == StatusCode::SWITCHING_PROTOCOLS {
            return Err(ProtocolError::Upgrade);
        }

        let head = ResponseHead::new(version, status, headers);

        if status.is_informational() {
            self.stage = Stage::StatusLine;
            return Ok(Some(ResponseMessage::Head(head)));
        }

        self.keep_alive = keep_alive(version, head.headers());
        self.stage = self.body_stage(&head)?;

        Ok(Some(ResponseMessage::Head(head)))
    }

    fn body_stage(&mut self, head: &ResponseHead) -> Result<Stage, ProtocolError> {
        let status = head.status();

        if self.head_request
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Stage::Finished);
        }

        let headers = head.headers();

        if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
            let te = te.to_str().map_err(|_| ProtocolError::Header)?;
            let chunked = te
                .rsplit(',')
                .next()
                .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"));

            return Ok(if chunked {
                Stage::Body(BodyKind::Chunked(ChunkedState::Size, 0))
            } else {
                self.keep_alive = false;
                Stage::Body(BodyKind::Eof)
            });
        }

        if let Some(len) = headers.get(header::CONTENT_LENGTH) {
            let len = len
                .to_str()
                .ok()
                .and_then(|len| len.trim().parse::<u64>().ok())
                .ok_or(ProtocolError::Header)?;

            return Ok(if len == 0 {
                Stage::Finished
            } else {
                Stage::Body(BodyKind::Length(len))
            });
        }

        // no framing information, read until the connection closes
        self.keep_alive = false;
        Ok(Stage::Body(BodyKind::Eof))
    }

    fn decode_body(&mut self, src: &mut BytesMut) -> Result<Option<ResponseMessage>, ProtocolError> {
        let max_chunk = self.limits.max_chunk_size.max(1);

        let kind = match self.stage {
            Stage::Body(ref mut kind) => kind,
            _ => return Ok(None),
        };

        match *kind {
            BodyKind::Length(ref mut remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }

                let take = (src.len() as u64).min(*remaining).min(max_chunk as u64);
                let buf = src.split_to(take as usize).freeze();
                *remaining -= take;

                if *remaining == 0 {
                    self.stage = Stage::Finished;
                }
                Ok(Some(ResponseMessage::Chunk(buf)))
            }

            BodyKind::Chunked(ref mut state, ref mut size) => loop {
                let mut buf = None;

                *state = match state.step(src, size, &mut buf, max_chunk) {
                    Poll::Pending => return Ok(None),
                    Poll::Ready(Ok(state)) => state,
                    Poll::Ready(Err(err)) => return Err(ProtocolError::Chunked(err)),
                };

                if *state == ChunkedState::End {
                    self.stage = Stage::Done;
                    return Ok(Some(ResponseMessage::Eof));
                }

                if let Some(buf) = buf {
                    return Ok(Some(ResponseMessage::Chunk(buf)));
                }

                if src.is_empty() {
                    return Ok(None);
                }
            },

            BodyKind::Eof => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    let take = src.len().min(max_chunk);
                    Ok(Some(ResponseMessage::Chunk(src.split_to(take).freeze())))
                }
            }
        }
    }
}

impl Decoder for ResponseDecoder {
    type Item = ResponseMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::StatusLine => self.decode_status_line(src),
            Stage::Headers { version, status } => self.decode_headers(src, version, status),
            Stage::Body(_) => self.decode_body(src),
            Stage::Finished => {
                self.stage = Stage::Done;
                Ok(Some(ResponseMessage::Eof))
            }
            Stage::Done => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }

        match self.stage {
            Stage::Body(BodyKind::Eof) => {
                self.stage = Stage::Done;
                Ok(Some(ResponseMessage::Eof))
            }
            // closed before the terminal marker; the caller decides what that means
            _ => Ok(None),
        }
    }
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    };

    match version {
        Version::HTTP_10 => has_token("keep-alive"),
        _ => !has_token("close"),
    }
}
