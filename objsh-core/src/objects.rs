//! Stock shared objects: the per-process root and a trivial echo service.

use crate::error::RemoteError;
use crate::object::{Args, CallContext, FunctionSpec, ObjectDescriptor, SharedObject};
use crate::value::Value;

/// Entry point every sharer registers under `"root"`. Peers use it during the
/// handshake, to look objects up and to deliver signals.
#[derive(Debug, Default)]
pub struct RootObject;

impl SharedObject for RootObject {
    fn describe(&self) -> ObjectDescriptor {
        ObjectDescriptor::new()
            .function(FunctionSpec::new("hello_world"))
            .function(FunctionSpec::new("hello_exception").doc("Always fails; exercises the error path."))
            .function(FunctionSpec::new("list_objects"))
            .function(FunctionSpec::new("get_object_info").params(&["objname"]))
            .function(FunctionSpec::new("receive_signal").params(&["uid", "signame"]))
    }

    fn call(&self, ctx: &CallContext<'_>, method: &str, args: Args) -> Result<Value, RemoteError> {
        let sharer = ctx.sharer();
        match method {
            "hello_world" => Ok(Value::from("Hello world!")),
            "hello_exception" => Err(RemoteError::Failed("Hello exception!".into())),
            "list_objects" => Ok(Value::List(sharer.list_objects())),
            "get_object_info" => {
                let uid = match args.value(0, "objname")? {
                    Value::Uid(uid) => Some(*uid),
                    Value::Str(name) => sharer.lookup(name),
                    _ => return Err(RemoteError::InvalidArguments("objname must be a name or id".into())),
                };
                Ok(uid
                    .and_then(|uid| sharer.get_object_info(uid))
                    .map(|info| info.to_value())
                    .unwrap_or_default())
            }
            "receive_signal" => {
                let uid = args.uid(0, "uid")?;
                let signal = args.str(1, "signame")?.to_string();
                let Args {
                    mut positional,
                    named,
                } = args;
                positional.drain(..positional.len().min(2));
                sharer.receive_signal(uid, &signal, Args::new(positional, named));
                Ok(Value::Null)
            }
            _ => Err(RemoteError::MethodNotFound {
                object: "root".into(),
                method: method.into(),
            }),
        }
    }
}

/// Returns its argument unchanged.
#[derive(Debug, Default)]
pub struct EchoServer;

impl SharedObject for EchoServer {
    fn describe(&self) -> ObjectDescriptor {
        ObjectDescriptor::new().function(FunctionSpec::new("echo").params(&["msg"]))
    }

    fn call(&self, _ctx: &CallContext<'_>, method: &str, args: Args) -> Result<Value, RemoteError> {
        match method {
            "echo" => Ok(args.value(0, "msg")?.clone()),
            _ => Err(RemoteError::MethodNotFound {
                object: "echo".into(),
                method: method.into(),
            }),
        }
    }
}
