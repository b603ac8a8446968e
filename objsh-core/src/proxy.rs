//! Local stand-in for an object living in a connected peer.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Weak;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, RemoteError};
use crate::identity::Uid;
use crate::object::{Args, ObjectDescriptor, ObjectInfo};
use crate::reply::AsyncReply;
use crate::sharer::{CallOptions, Inner, Sharer, SignalCallback, SignalHandle};
use crate::value::Value;

/// One per (client, object) pair; lookups of the same remote object through the
/// same client return the same `Rc<Proxy>`. Unusable once the client disconnects.
pub struct Proxy {
    uid: Uid,
    client: Uid,
    address: Option<String>,
    sharer: Weak<Inner>,
    descriptor: RefCell<Option<ObjectDescriptor>>,
    connected: Cell<bool>,
    cache: RefCell<HashMap<String, Value>>,
    on_disconnect: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Proxy {
    pub(crate) fn new(
        uid: Uid,
        client: Uid,
        address: Option<String>,
        descriptor: Option<ObjectDescriptor>,
        sharer: Weak<Inner>,
    ) -> Self {
        Self {
            uid,
            client,
            address,
            sharer,
            descriptor: RefCell::new(descriptor),
            connected: Cell::new(true),
            cache: RefCell::new(HashMap::new()),
            on_disconnect: RefCell::new(Vec::new()),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Client that owns the remote object.
    pub fn client(&self) -> Uid {
        self.client
    }

    /// Where the owning client listens, if it told us.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Descriptor of the remote object, if already known.
    pub fn descriptor(&self) -> Option<ObjectDescriptor> {
        self.descriptor.borrow().clone()
    }

    pub fn functions(&self) -> Vec<String> {
        self.descriptor
            .borrow()
            .as_ref()
            .map(|d| d.functions.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn properties(&self) -> Vec<String> {
        self.descriptor
            .borrow()
            .as_ref()
            .map(|d| d.properties.clone())
            .unwrap_or_default()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.descriptor
            .borrow()
            .as_ref()
            .is_some_and(|d| d.get_function(name).is_some())
    }

    /// Fetch the descriptor from the owning client unless already known.
    pub async fn describe(&self) -> Result<ObjectDescriptor, Error> {
        if let Some(d) = self.descriptor() {
            return Ok(d);
        }
        let sharer = self.sharer()?;
        let value = sharer
            .call(self.client, self.client, "get_object_info", vec![Value::Uid(self.uid)])
            .await?;
        if value.is_null() {
            return Err(RemoteError::ObjectNotFound(self.uid.to_string()).into());
        }
        let info = ObjectInfo::from_value(&value)
            .ok_or_else(|| RemoteError::Failed("malformed object info".into()))?;
        self.set_descriptor(info.descriptor.clone());
        Ok(info.descriptor)
    }

    /// Synchronous call with positional arguments and the default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.call_with(method, Args::positional(args), None).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let cache = self.check_call(method)?;
        if cache {
            if let Some(value) = self.cache.borrow().get(method) {
                debug!(object = %self.uid, method, "returning cached result");
                return Ok(value.clone());
            }
        }
        let value = self
            .sharer()?
            .call_with(self.client, self.uid, method, args, timeout)
            .await?;
        if cache {
            self.cache
                .borrow_mut()
                .insert(method.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Issue a call and return at once; the reply resolves while the loop runs.
    pub fn call_async(
        &self,
        method: &str,
        args: Args,
        options: CallOptions,
    ) -> Result<AsyncReply, Error> {
        self.check_call(method)?;
        self.sharer()?
            .call_async(self.client, self.uid, method, args, options)
    }

    /// Subscribe to a signal of the remote object.
    pub fn connect(&self, signal: &str, callback: SignalCallback) -> Result<SignalHandle, Error> {
        Ok(self
            .sharer()?
            .connect_signal(self.uid, signal, callback, Args::default()))
    }

    pub fn disconnect(&self, handle: SignalHandle) -> Result<bool, Error> {
        Ok(self.sharer()?.disconnect_signal(handle))
    }

    /// Run `action` once when the owning client goes away.
    pub fn on_disconnect(&self, action: impl FnOnce() + 'static) {
        if !self.connected.get() {
            action();
            return;
        }
        self.on_disconnect.borrow_mut().push(Box::new(action));
    }

    pub(crate) fn set_descriptor(&self, descriptor: ObjectDescriptor) {
        *self.descriptor.borrow_mut() = Some(descriptor);
    }

    pub(crate) fn client_disconnected(&self) {
        if !self.connected.replace(false) {
            return;
        }
        let actions = std::mem::take(&mut *self.on_disconnect.borrow_mut());
        for action in actions {
            action();
        }
    }

    fn sharer(&self) -> Result<Sharer, Error> {
        Sharer::upgrade(&self.sharer).ok_or(Error::Shutdown)
    }

    /// Reject calls that cannot succeed; returns whether the result may be cached.
    fn check_call(&self, method: &str) -> Result<bool, Error> {
        if !self.connected.get() {
            return Err(Error::Disconnected(self.client));
        }
        match &*self.descriptor.borrow() {
            Some(d) => d
                .get_function(method)
                .map(|f| f.cache_result)
                .ok_or_else(|| Error::NoSuchFunction(method.to_string())),
            None => Ok(false),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("uid", &self.uid)
            .field("client", &self.client)
            .field("connected", &self.connected.get())
            .finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjectProxy {} @ {}>", self.uid, self.client)
    }
}
