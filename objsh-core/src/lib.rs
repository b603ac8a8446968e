//! Object sharing over TCP: expose local objects to peer processes, call methods on
//! theirs through proxies, and broadcast fire-and-forget signals.
//! Single-threaded; drive it from a current-thread runtime inside a `LocalSet`.

pub mod codec;
pub mod error;
pub mod event_loop;
pub mod identity;
pub mod object;
pub mod objects;
pub mod protocol;
pub mod proxy;
pub mod reply;
pub mod scheduler;
pub mod sharer;
pub mod transport;
pub mod value;
pub mod wire;

pub use error::{Error, RemoteError};
pub use identity::Uid;
pub use object::{Args, CallContext, FunctionSpec, ObjectDescriptor, ObjectInfo, SharedObject};
pub use objects::{EchoServer, RootObject};
pub use protocol::Envelope;
pub use proxy::Proxy;
pub use reply::AsyncReply;
pub use scheduler::TimerId;
pub use sharer::{CallOptions, Sharer, SharerConfig, SignalCallback, SignalHandle, WeakSharer};
pub use value::{DType, NdArray, ObjectHandle, Value};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
