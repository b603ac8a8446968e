//! Error taxonomy for calls made through the sharer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::identity::Uid;
use crate::transport::TransportError;

/// Failure on the remote side of a call. Serializable: it is shipped back in the
/// RETURN envelope in place of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteError {
    #[error("object {0} not available for calls")]
    ObjectNotFound(String),
    #[error("object {object} does not have function {method}")]
    MethodNotFound { object: String, method: String },
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unable to unwrap arguments: {0}")]
    Unwrap(String),
    #[error("unable to encode return value: {0}")]
    Encode(String),
    #[error("{0}")]
    Failed(String),
}

/// Error returned to the local caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("call timed out")]
    Timeout,
    #[error("client {0} disconnected")]
    Disconnected(Uid),
    #[error("not connected to client {0}")]
    NotConnected(Uid),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("alias {0} already registered")]
    AliasInUse(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("remote object has no function {0}")]
    NoSuchFunction(String),
    #[error("object {0} is not registered here")]
    NotLocal(Uid),
    #[error("connection to {0} failed")]
    ConnectionFailed(String),
    #[error("object sharer has shut down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Whether the call failed because the peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected(_) | Error::NotConnected(_))
    }
}
