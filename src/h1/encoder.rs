use std::io::{self, Write as _};

use actix_codec::Encoder;
use bytes::{BufMut as _, Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, TRANSFER_ENCODING},
    Method, Version,
};

use crate::request::RequestHead;

const AVERAGE_HEADER_SIZE: usize = 30;

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

#[derive(Debug)]
pub(crate) enum RequestMessage {
    /// Request line and headers.
    Head(RequestHead, BodyFraming),
    /// Body bytes; `None` marks the end of the body.
    Chunk(Option<Bytes>),
}

/// HTTP/1 request encoder.
#[derive(Debug)]
pub(crate) struct RequestEncoder {
    framing: BodyFraming,
    remaining: u64,
}

impl Default for RequestEncoder {
    fn default() -> Self {
        RequestEncoder {
            framing: BodyFraming::Empty,
            remaining: 0,
        }
    }
}

impl RequestEncoder {
    fn encode_head(
        &mut self,
        head: &RequestHead,
        framing: BodyFraming,
        dst: &mut BytesMut,
    ) -> io::Result<()> {
        self.framing = framing;
        self.remaining = match framing {
            BodyFraming::Length(len) => len,
            _ => 0,
        };

        dst.reserve(256 + head.headers.len() * AVERAGE_HEADER_SIZE);

        let version = match head.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };

        write!(
            Writer(dst),
            "{} {} {}\r\n",
            head.method,
            head.uri.path_and_query().map(|u| u.as_str()).unwrap_or("/"),
            version,
        )?;

        for (name, value) in head.headers.iter() {
            // framing headers are derived from the body
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }

            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }

        match framing {
            BodyFraming::Empty => {
                if matches!(head.method, Method::POST | Method::PUT | Method::PATCH) {
                    dst.put_slice(b"content-length: 0\r\n");
                }
            }
            BodyFraming::Length(len) => {
                let mut buf = itoa::Buffer::new();
                dst.put_slice(b"content-length: ");
                dst.put_slice(buf.format(len).as_bytes());
                dst.put_slice(b"\r\n");
            }
            BodyFraming::Chunked => dst.put_slice(b"transfer-encoding: chunked\r\n"),
        }

        dst.put_slice(b"\r\n");
        Ok(())
    }

    fn encode_chunk(&mut self, msg: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        match self.framing {
            BodyFraming::Chunked => {
                if msg.is_empty() {
                    return Ok(());
                }

                write!(Writer(dst), "{:X}\r\n", msg.len())?;
                dst.reserve(msg.len() + 2);
                dst.put_slice(msg);
                dst.put_slice(b"\r\n");
                Ok(())
            }

            BodyFraming::Length(_) => {
                let len = msg.len() as u64;
                if len > self.remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "request body is longer than its declared length",
                    ));
                }

                self.remaining -= len;
                dst.extend_from_slice(msg);
                Ok(())
            }

            BodyFraming::Empty if msg.is_empty() => Ok(()),
            BodyFraming::Empty => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request declared no body",
            )),
        }
    }

    fn encode_eof(&mut self, dst: &mut BytesMut) -> io::Result<()> {
        match self.framing {
            BodyFraming::Chunked => {
                dst.put_slice(b"0\r\n\r\n");
                Ok(())
            }
            BodyFraming::Length(_) if self.remaining != 0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "request body is shorter than its declared length",
            )),
            _ => Ok(()),
        }
    }
}

impl Encoder<RequestMessage> for RequestEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: RequestMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RequestMessage::Head(head, framing) => self.encode_head(&head, framing, dst),
            RequestMessage::Chunk(Some(bytes)) => self.encode_chunk(&bytes, dst),
            RequestMessage::Chunk(None) => self.encode_eof(dst),
        }
    }
}

struct Writer<'a>(&'a mut BytesMut);

impl io::Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
