//! HTTP/1 response decoder and request encoder.

mod chunked;
mod decoder;
mod encoder;

pub(crate) use self::decoder::{ResponseDecoder, ResponseMessage};
pub(crate) use self::encoder::{BodyFraming, RequestEncoder, RequestMessage};
