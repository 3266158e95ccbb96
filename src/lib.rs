//! blerpc — BLE request/response driver core
//!
//! Turns one stream-oriented BLE peripheral link (read/write/notify
//! characteristics) into a request/response and subscription-stream
//! abstraction suitable for generated RPC service glue. The [`link::Link`]
//! trait is the transport boundary; [`driver::ServiceDriver`] multiplexes
//! concurrent operations over one shared connection; [`codec`] and
//! [`message`] frame typed messages as fixed-layout characteristic values.

pub mod codec;
pub mod driver;
pub mod link;
pub mod message;
mod session;
pub mod simulated;

use thiserror::Error;

use crate::codec::CodecError;
use crate::link::LinkError;

/// Errors surfaced by the driver to callers of read/write/subscribe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Client sent a non-empty request body into a read or subscribe call.
    #[error("request body must be empty for read and subscribe calls")]
    NonEmptyRequest,

    /// Device returned a result or notification with no value attached.
    #[error("device returned an empty response")]
    EmptyResponse,

    /// Device attached a payload to a write acknowledgement. Write
    /// responses carry no data in this protocol.
    #[error("device returned an unexpected write acknowledgement payload")]
    UnexpectedResponse,

    /// The connection dropped while the operation was pending, or
    /// `disconnect()` was called.
    #[error("connection dropped while the operation was pending")]
    Disconnected,

    /// The underlying connect attempt failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The driver has no link attached. Reserved for generated service
    /// glue that constructs drivers lazily.
    #[error("no link attached to this driver")]
    NoLink,

    #[error(transparent)]
    Link(LinkError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<LinkError> for DriverError {
    fn from(err: LinkError) -> Self {
        // A link-level disconnect and a session teardown must look the
        // same to callers.
        match err {
            LinkError::Disconnected => DriverError::Disconnected,
            other => DriverError::Link(other),
        }
    }
}
