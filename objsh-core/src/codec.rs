//! Wire codec: turn call/return/signal values into a serializable tree plus
//! out-of-band buffer parts, and back.
//!
//! Numeric arrays are replaced by a `Buffer` record (dtype + shape) and their bytes
//! appended to the part list untouched. Shared objects are replaced by an
//! `ObjectRef` record carrying the object id and, for proxies, the owning client.
//! Walk order is depth-first with maps in key order, so both sides consume parts
//! in the same sequence.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::identity::Uid;
use crate::value::{DType, NdArray, ObjectHandle, Value};

/// Deepest container nesting accepted in either direction.
pub const MAX_DEPTH: usize = 64;

/// Buffer parts per message; the frame part count is a u8 and the envelope takes one.
pub const MAX_BUFFERS: usize = u8::MAX as usize - 1;

/// Serializable form of a `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Uid(Uid),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    /// Placeholder for the next buffer part.
    Buffer { dtype: DType, shape: Vec<usize> },
    /// Shared object reference. `owner` is set when the object is not owned by the sender.
    ObjectRef { uid: Uid, owner: Option<Owner> },
}

/// Where a forwarded object reference actually lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub client: Uid,
    pub address: Option<String>,
}

/// Turns object references back into handles on the receiving side.
pub trait ObjectResolver {
    /// `owner` is `None` when the object belongs to the sender of the message.
    fn resolve(&self, uid: Uid, owner: Option<&Owner>) -> Result<ObjectHandle, CodecError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("value nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("more than {MAX_BUFFERS} buffers in one message")]
    TooManyBuffers,
    #[error("buffer record without a matching part")]
    MissingPart,
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },
    #[error("cannot resolve object {0}: owning client unknown")]
    UnknownOwner(Uid),
    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Serialize(e.to_string())
    }
}

/// Wrap one value, appending buffer parts to `parts`.
pub fn wrap(value: &Value, parts: &mut Vec<Bytes>) -> Result<WireValue, CodecError> {
    wrap_at(value, parts, 0)
}

/// Wrap positional and keyword arguments, in that order, into one part list.
pub fn wrap_args(
    args: &[Value],
    kwargs: &BTreeMap<String, Value>,
) -> Result<(Vec<WireValue>, BTreeMap<String, WireValue>, Vec<Bytes>), CodecError> {
    let mut parts = Vec::new();
    let args = args
        .iter()
        .map(|v| wrap(v, &mut parts))
        .collect::<Result<Vec<_>, _>>()?;
    let kwargs = kwargs
        .iter()
        .map(|(k, v)| Ok((k.clone(), wrap(v, &mut parts)?)))
        .collect::<Result<BTreeMap<_, _>, CodecError>>()?;
    Ok((args, kwargs, parts))
}

fn wrap_at(value: &Value, parts: &mut Vec<Bytes>, depth: usize) -> Result<WireValue, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    Ok(match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => WireValue::Int(*i),
        Value::Float(f) => WireValue::Float(*f),
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::Bytes(b) => WireValue::Bytes(b.clone()),
        Value::Uid(u) => WireValue::Uid(*u),
        Value::List(items) => WireValue::List(
            items
                .iter()
                .map(|v| wrap_at(v, parts, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => WireValue::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), wrap_at(v, parts, depth + 1)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        Value::Array(a) => {
            if parts.len() >= MAX_BUFFERS {
                return Err(CodecError::TooManyBuffers);
            }
            parts.push(a.bytes().clone());
            WireValue::Buffer {
                dtype: a.dtype(),
                shape: a.shape().to_vec(),
            }
        }
        Value::Object(ObjectHandle::Local(uid)) => WireValue::ObjectRef {
            uid: *uid,
            owner: None,
        },
        Value::Object(ObjectHandle::Remote(proxy)) => WireValue::ObjectRef {
            uid: proxy.uid(),
            owner: Some(Owner {
                client: proxy.client(),
                address: proxy.address().map(str::to_string),
            }),
        },
    })
}

/// Inverse of `wrap`: consumes one part per `Buffer` record from the front of `parts`.
pub fn unwrap(
    wire: WireValue,
    parts: &mut VecDeque<Bytes>,
    resolver: &dyn ObjectResolver,
) -> Result<Value, CodecError> {
    unwrap_at(wire, parts, resolver, 0)
}

fn unwrap_at(
    wire: WireValue,
    parts: &mut VecDeque<Bytes>,
    resolver: &dyn ObjectResolver,
    depth: usize,
) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    Ok(match wire {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(i) => Value::Int(i),
        WireValue::Float(f) => Value::Float(f),
        WireValue::Str(s) => Value::Str(s),
        WireValue::Bytes(b) => Value::Bytes(b),
        WireValue::Uid(u) => Value::Uid(u),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|w| unwrap_at(w, parts, resolver, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, w)| Ok((k, unwrap_at(w, parts, resolver, depth + 1)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        WireValue::Buffer { dtype, shape } => {
            let part = parts.pop_front().ok_or(CodecError::MissingPart)?;
            Value::Array(NdArray::new(dtype, shape, part)?)
        }
        WireValue::ObjectRef { uid, owner } => {
            Value::Object(resolver.resolve(uid, owner.as_ref())?)
        }
    })
}
