//! Connector errors.

pub use crate::client::{
    ConnectError, InvalidUrl, PayloadError, ProcessingError, ProtocolError, RedirectError,
    SendRequestError, SetupError, TimeoutKind,
};
