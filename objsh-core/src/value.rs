//! Values carried by calls, returns and signals.
//!
//! `Value` is the dynamic argument type understood by the codec. Two shapes get
//! special treatment on the wire: `Array` (a typed, contiguous numeric block whose
//! bytes travel as a separate message part) and `Object` (a reference to a shared
//! object, sent as its identifier).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::identity::Uid;
use crate::proxy::Proxy;

#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// A bare identifier (not a reference that resolves to a proxy).
    Uid(Uid),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Array(NdArray),
    Object(ObjectHandle),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and integers widened to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uid(&self) -> Option<Uid> {
        match self {
            Value::Uid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The proxy behind a remote object reference.
    pub fn as_proxy(&self) -> Option<&Rc<Proxy>> {
        match self {
            Value::Object(ObjectHandle::Remote(p)) => Some(p),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Uid> for Value {
    fn from(v: Uid) -> Self {
        Value::Uid(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<Rc<Proxy>> for Value {
    fn from(v: Rc<Proxy>) -> Self {
        Value::Object(ObjectHandle::Remote(v))
    }
}

/// Reference to a shared object: one registered in this process, or a proxy
/// for one living in a peer.
#[derive(Clone)]
pub enum ObjectHandle {
    Local(Uid),
    Remote(Rc<Proxy>),
}

impl ObjectHandle {
    pub fn uid(&self) -> Uid {
        match self {
            ObjectHandle::Local(uid) => *uid,
            ObjectHandle::Remote(p) => p.uid(),
        }
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ObjectHandle::Local(a), ObjectHandle::Local(b)) => a == b,
            (ObjectHandle::Remote(a), ObjectHandle::Remote(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectHandle::Local(uid) => write!(f, "Local({})", uid),
            ObjectHandle::Remote(p) => write!(f, "Remote({} @ {})", p.uid(), p.client()),
        }
    }
}

/// Element type of a numeric buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DType {
    pub fn itemsize(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }
}

/// A primitive that can live in an `NdArray`. Stored little-endian.
pub trait Element: Copy + 'static {
    const DTYPE: DType;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! element {
    ($t:ty, $d:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$d;

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

element!(u8, U8);
element!(i8, I8);
element!(u16, U16);
element!(i16, I16);
element!(u32, U32);
element!(i32, I32);
element!(u64, U64);
element!(i64, I64);
element!(f32, F32);
element!(f64, F64);

/// Contiguous, homogeneous, fixed-stride block of numbers with a shape.
///
/// The data is a reference-counted byte block; cloning the array, wrapping it
/// for the wire and reconstructing it on receipt never copy the elements.
#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl NdArray {
    /// View `data` as an array. Fails unless its length is `prod(shape) * itemsize`.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self, CodecError> {
        let expected = shape
            .iter()
            .try_fold(dtype.itemsize(), |acc, &d| acc.checked_mul(d))
            .ok_or(CodecError::BufferSize {
                expected: usize::MAX,
                actual: data.len(),
            })?;
        if expected != data.len() {
            return Err(CodecError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// One-dimensional array holding `values`.
    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        Self {
            dtype: T::DTYPE,
            shape: vec![values.len()],
            data: encode_elements(values),
        }
    }

    /// Array of the given shape; `values` are laid out in row-major order.
    pub fn with_shape<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, CodecError> {
        Self::new(T::DTYPE, shape, encode_elements(values))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.itemsize()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// The raw little-endian bytes backing this array.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Element `index` (flat, row-major), decoded in place.
    pub fn get<T: Element>(&self, index: usize) -> Option<T> {
        if T::DTYPE != self.dtype || index >= self.len() {
            return None;
        }
        let size = self.dtype.itemsize();
        Some(T::read_le(&self.data[index * size..(index + 1) * size]))
    }

    /// Iterate elements without materializing a vector. `None` on a dtype mismatch.
    pub fn iter<T: Element>(&self) -> Option<impl Iterator<Item = T> + '_> {
        if T::DTYPE != self.dtype {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.dtype.itemsize())
                .map(T::read_le),
        )
    }

    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        self.iter().map(|it| it.collect())
    }
}

fn encode_elements<T: Element>(values: &[T]) -> Bytes {
    let mut raw = Vec::with_capacity(values.len() * T::DTYPE.itemsize());
    for v in values {
        v.write_le(&mut raw);
    }
    Bytes::from(raw)
}
