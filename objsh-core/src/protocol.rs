//! Object sharer wire protocol: envelope types.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, WireValue};
use crate::error::RemoteError;
use crate::identity::Uid;

/// Keyword argument marking a CALL as a fire-and-forget signal delivery.
pub const SIGNAL_FLAG: &str = "os_signal";

/// All envelope types. Encoding is bincode; the envelope is always part 0 of a
/// message, followed by any buffer parts its values refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    Call {
        call_id: u64,
        object: Uid,
        method: String,
        args: Vec<WireValue>,
        kwargs: BTreeMap<String, WireValue>,
    },
    Return {
        call_id: u64,
        value: Result<WireValue, RemoteError>,
    },
    /// First message on a new connection: who we are and where we listen.
    HelloFrom {
        client: Uid,
        address: Option<String>,
    },
    HelloReply {
        client: Uid,
        address: Option<String>,
    },
    /// Graceful leave.
    GoodbyeFrom {
        address: Option<String>,
    },
    Ping,
    Pong,
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Whether this is a signal delivery (a CALL that expects no RETURN).
    pub fn is_signal(&self) -> bool {
        match self {
            Envelope::Call { kwargs, .. } => {
                matches!(kwargs.get(SIGNAL_FLAG), Some(WireValue::Bool(true)))
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Call { .. } if self.is_signal() => "signal",
            Envelope::Call { .. } => "call",
            Envelope::Return { .. } => "return",
            Envelope::HelloFrom { .. } => "hello_from",
            Envelope::HelloReply { .. } => "hello_reply",
            Envelope::GoodbyeFrom { .. } => "goodbye_from",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
        }
    }
}
