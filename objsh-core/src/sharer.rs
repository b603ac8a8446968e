//! Object sharer: registry of local objects, client table, proxy cache, pending
//! calls and signal subscriptions, plus the message dispatcher that ties them to
//! the event loop.
//!
//! All state lives in one `Inner` behind an `Rc`; nothing here is `Send`. Borrows
//! of the tables are never held while user code (object methods, signal or reply
//! callbacks) runs, so that code may call back into the sharer freely.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::codec::{self, CodecError, ObjectResolver, Owner, WireValue};
use crate::error::{Error, RemoteError};
use crate::event_loop::{Dispatch, EventLoop, WaitFor};
use crate::identity::Uid;
use crate::object::{Args, CallContext, ObjectDescriptor, ObjectInfo, SharedObject};
use crate::objects::RootObject;
use crate::protocol::{Envelope, SIGNAL_FLAG};
use crate::proxy::Proxy;
use crate::reply::{AsyncReply, ReplyCallback};
use crate::scheduler::TimerId;
use crate::transport::{ConnectionId, Transport};
use crate::value::{ObjectHandle, Value};

pub const ROOT_ALIAS: &str = "root";
pub const OBJECT_ADDED: &str = "object-added";
pub const OBJECT_REMOVED: &str = "object-removed";

#[derive(Debug, Clone)]
pub struct SharerConfig {
    /// Default timeout of synchronous calls.
    pub call_timeout: Duration,
    /// How long `connect` waits for the handshake to finish.
    pub connect_timeout: Duration,
    /// Deferred signals delivered per loop pass.
    pub signal_batch: usize,
    /// Host announced to peers; defaults to the bound address (loopback when
    /// bound to every interface).
    pub advertise_host: Option<String>,
}

impl Default for SharerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(20),
            signal_batch: 5,
            advertise_host: None,
        }
    }
}

/// Signal subscriber. Receives the emitted arguments followed by the bound extras.
pub type SignalCallback = Rc<dyn Fn(&Args)>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SignalHandle(u64);

/// Per-call options for `call_async`.
#[derive(Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub callback: Option<ReplyCallback>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn callback(mut self, callback: impl FnOnce(&Result<Value, Error>) + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

struct Registration {
    object: Rc<dyn SharedObject>,
    alias: Option<String>,
    info: ObjectInfo,
    /// Address of the registered `Rc`, to spot a second registration.
    key: usize,
}

struct ClientRecord {
    conn: ConnectionId,
    /// Address the peer listens on, as announced in its hello.
    address: Option<String>,
    /// Address we dialed to reach it, if we initiated the connection.
    dialed: Option<String>,
    root: Option<Rc<Proxy>>,
    /// Our subscriptions to the peer root's object-added/removed signals.
    watches: Vec<SignalHandle>,
}

struct PendingCall {
    reply: AsyncReply,
    timer: Option<TimerId>,
}

struct Subscription {
    object: Uid,
    signal: String,
    callback: SignalCallback,
    extra: Args,
}

#[derive(Default)]
struct SignalTable {
    last_handle: u64,
    by_handle: HashMap<u64, Subscription>,
    by_name: HashMap<(Uid, String), Vec<u64>>,
}

pub(crate) struct Inner {
    uid: Uid,
    config: SharerConfig,
    event_loop: EventLoop,
    address: RefCell<Option<String>>,

    objects: RefCell<HashMap<Uid, Registration>>,
    aliases: RefCell<HashMap<String, Uid>>,

    clients: RefCell<HashMap<Uid, ClientRecord>>,
    conn_clients: RefCell<HashMap<ConnectionId, Uid>>,
    dialing: RefCell<HashMap<ConnectionId, String>>,
    proxies: RefCell<HashMap<(Uid, Uid), Rc<Proxy>>>,
    /// Name (alias or id string) -> (client, object) of proxies found by name.
    proxy_names: RefCell<HashMap<String, (Uid, Uid)>>,
    /// What each client's `list_objects` last reported.
    client_objects: RefCell<HashMap<Uid, Vec<Value>>>,

    last_call_id: Cell<u64>,
    pending: RefCell<HashMap<u64, PendingCall>>,

    signals: RefCell<SignalTable>,
    deferred: RefCell<VecDeque<(ConnectionId, Vec<Bytes>)>>,
}

#[derive(Clone)]
pub struct Sharer {
    inner: Rc<Inner>,
}

#[derive(Clone)]
pub struct WeakSharer(Weak<Inner>);

impl WeakSharer {
    pub fn upgrade(&self) -> Option<Sharer> {
        Sharer::upgrade(&self.0)
    }
}

impl Sharer {
    /// New sharer with its root object registered under `"root"`. The root's id is
    /// the sharer's (and thus this client's) id.
    pub fn new(config: SharerConfig) -> Self {
        let uid = Uid::new();
        let sharer = Self {
            inner: Rc::new(Inner {
                uid,
                event_loop: EventLoop::new(config.signal_batch),
                config,
                address: RefCell::new(None),
                objects: RefCell::new(HashMap::new()),
                aliases: RefCell::new(HashMap::new()),
                clients: RefCell::new(HashMap::new()),
                conn_clients: RefCell::new(HashMap::new()),
                dialing: RefCell::new(HashMap::new()),
                proxies: RefCell::new(HashMap::new()),
                proxy_names: RefCell::new(HashMap::new()),
                client_objects: RefCell::new(HashMap::new()),
                last_call_id: Cell::new(0),
                pending: RefCell::new(HashMap::new()),
                signals: RefCell::new(SignalTable::default()),
                deferred: RefCell::new(VecDeque::new()),
            }),
        };
        let root: Rc<dyn SharedObject> = Rc::new(RootObject);
        sharer.insert_object(uid, root, Some(ROOT_ALIAS));
        info!(%uid, "object sharer created");
        sharer
    }

    pub(crate) fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<Inner> {
        Rc::downgrade(&self.inner)
    }

    /// Non-owning handle, for timers and callbacks stored inside the sharer.
    pub fn weak(&self) -> WeakSharer {
        WeakSharer(self.downgrade())
    }

    /// This process's client id (also the id of its root object).
    pub fn uid(&self) -> Uid {
        self.inner.uid
    }

    /// Address announced to peers, once listening.
    pub fn address(&self) -> Option<String> {
        self.inner.address.borrow().clone()
    }

    pub fn config(&self) -> &SharerConfig {
        &self.inner.config
    }

    fn transport(&self) -> &Transport {
        self.inner.event_loop.transport()
    }

    // ---- networking ----

    /// Start accepting peers. `port` `None` picks an ephemeral port.
    pub async fn listen(&self, host: &str, port: Option<u16>) -> Result<SocketAddr, Error> {
        let bound = self.transport().listen(host, port).await?;
        let host = match &self.inner.config.advertise_host {
            Some(h) => h.clone(),
            None if bound.ip().is_unspecified() => "127.0.0.1".to_string(),
            None => bound.ip().to_string(),
        };
        let address = format!("{}:{}", host, bound.port());
        info!(%address, "serving objects");
        *self.inner.address.borrow_mut() = Some(address);
        Ok(bound)
    }

    /// Connect to the peer at `address` and complete the handshake. Returns the
    /// peer's client id. Already-connected addresses return at once.
    pub async fn connect(&self, address: &str) -> Result<Uid, Error> {
        let address = normalize_address(address)?;
        if let Some(uid) = self.client_at(&address) {
            if self.root_proxy(uid).is_some() {
                return Ok(uid);
            }
        }
        let conn = self.dial(&address)?;
        let done = || self.handshake_done(conn) || !self.transport().is_open(conn);
        self.run_until(&[&done], Some(self.inner.config.connect_timeout))
            .await;

        if self.handshake_done(conn) {
            return self.client_of(conn).ok_or(Error::ConnectionFailed(address));
        }
        self.inner.dialing.borrow_mut().remove(&conn);
        if self.transport().is_open(conn) {
            warn!(%address, "handshake timed out");
            self.drop_conn(conn);
            Err(Error::Timeout)
        } else {
            Err(Error::ConnectionFailed(address))
        }
    }

    /// Start connecting without waiting; the handshake completes as the loop runs.
    pub fn connect_nowait(&self, address: &str) -> Result<(), Error> {
        let address = normalize_address(address)?;
        if self.client_at(&address).is_none() {
            self.dial(&address)?;
        }
        Ok(())
    }

    /// Forget any client known at `address` and connect again. There is no
    /// automatic reconnection; this is the only way back after a drop.
    pub async fn reconnect(&self, address: &str) -> Result<Uid, Error> {
        let normalized = normalize_address(address)?;
        if let Some(uid) = self.client_at(&normalized) {
            self.forget(uid);
        }
        self.connect(&normalized).await
    }

    /// Say goodbye to `client` and close the connection.
    pub fn forget(&self, client: Uid) {
        let Some(conn) = self.conn_of(client) else {
            return;
        };
        self.send_envelope(
            conn,
            &Envelope::GoodbyeFrom {
                address: self.address(),
            },
        );
        self.transport().close(conn);
        self.client_lost(client);
    }

    /// Goodbye to every client.
    pub fn forget_all(&self) {
        for client in self.clients() {
            self.forget(client);
        }
    }

    /// Close the connection to `client` without a goodbye, as if the network failed.
    pub fn disconnect_client(&self, client: Uid) {
        if let Some(conn) = self.conn_of(client) {
            self.transport().close(conn);
            self.client_lost(client);
        }
    }

    /// Liveness check; the PONG is logged when it arrives.
    pub fn ping(&self, client: Uid) -> Result<(), Error> {
        let conn = self.conn_of(client).ok_or(Error::NotConnected(client))?;
        let head = Envelope::Ping.encode()?;
        self.transport().send(conn, &[head])?;
        Ok(())
    }

    /// Clients with a completed hello exchange.
    pub fn clients(&self) -> Vec<Uid> {
        self.inner.clients.borrow().keys().copied().collect()
    }

    pub fn client_address(&self, client: Uid) -> Option<String> {
        self.inner
            .clients
            .borrow()
            .get(&client)
            .and_then(|r| r.address.clone())
    }

    /// Proxy for the peer's root object, available once its info arrived.
    pub fn root_proxy(&self, client: Uid) -> Option<Rc<Proxy>> {
        self.inner
            .clients
            .borrow()
            .get(&client)
            .and_then(|r| r.root.clone())
    }

    fn dial(&self, address: &str) -> Result<ConnectionId, Error> {
        let conn = self.transport().connect(address);
        self.inner
            .dialing
            .borrow_mut()
            .insert(conn, address.to_string());
        let hello = Envelope::HelloFrom {
            client: self.uid(),
            address: self.address(),
        }
        .encode()?;
        self.transport().send(conn, &[hello])?;
        Ok(conn)
    }

    fn client_at(&self, address: &str) -> Option<Uid> {
        self.inner
            .clients
            .borrow()
            .iter()
            .find(|(_, r)| {
                r.address.as_deref() == Some(address) || r.dialed.as_deref() == Some(address)
            })
            .map(|(uid, _)| *uid)
    }

    fn client_of(&self, conn: ConnectionId) -> Option<Uid> {
        self.inner.conn_clients.borrow().get(&conn).copied()
    }

    fn conn_of(&self, client: Uid) -> Option<ConnectionId> {
        self.inner.clients.borrow().get(&client).map(|r| r.conn)
    }

    fn handshake_done(&self, conn: ConnectionId) -> bool {
        self.client_of(conn)
            .is_some_and(|client| self.root_proxy(client).is_some())
    }

    fn drop_conn(&self, conn: ConnectionId) {
        self.transport().close(conn);
        self.inner.dialing.borrow_mut().remove(&conn);
        if let Some(client) = self.client_of(conn) {
            self.client_lost(client);
        }
    }

    // ---- local registry ----

    /// Share `object`, optionally under `alias`. Registering the same `Rc` twice
    /// logs a warning and returns the existing id; a taken alias is an error.
    pub fn register<O: SharedObject>(&self, object: Rc<O>, alias: Option<&str>) -> Result<Uid, Error> {
        let key = Rc::as_ptr(&object) as *const () as usize;
        let existing = self
            .inner
            .objects
            .borrow()
            .iter()
            .find(|(_, r)| r.key == key)
            .map(|(uid, _)| *uid);
        if let Some(uid) = existing {
            warn!(%uid, "object already registered");
            return Ok(uid);
        }
        if let Some(alias) = alias {
            if self.inner.aliases.borrow().contains_key(alias) {
                return Err(Error::AliasInUse(alias.to_string()));
            }
        }
        let uid = Uid::new();
        let object: Rc<dyn SharedObject> = object;
        self.insert_object(uid, object, alias);
        info!(%uid, alias, "object registered");

        let mut named = BTreeMap::new();
        named.insert(
            "name".to_string(),
            alias.map(Value::from).unwrap_or_default(),
        );
        self.emit_from_root(OBJECT_ADDED, Args::new(vec![Value::Uid(uid)], named));
        Ok(uid)
    }

    fn insert_object(&self, uid: Uid, object: Rc<dyn SharedObject>, alias: Option<&str>) {
        let key = Rc::as_ptr(&object) as *const () as usize;
        let info = ObjectInfo {
            uid,
            descriptor: object.describe(),
        };
        if let Some(alias) = alias {
            self.inner
                .aliases
                .borrow_mut()
                .insert(alias.to_string(), uid);
        }
        self.inner.objects.borrow_mut().insert(
            uid,
            Registration {
                object,
                alias: alias.map(str::to_string),
                info,
                key,
            },
        );
    }

    /// Stop sharing `uid`. Drops its signal subscriptions and tells peers.
    pub fn unregister(&self, uid: Uid) -> bool {
        if uid == self.uid() {
            warn!("refusing to unregister the root object");
            return false;
        }
        let Some(reg) = self.inner.objects.borrow_mut().remove(&uid) else {
            warn!(%uid, "trying to unregister an unknown object");
            return false;
        };
        if let Some(alias) = &reg.alias {
            self.inner.aliases.borrow_mut().remove(alias);
        }
        self.drop_subscriptions(uid);
        info!(%uid, alias = reg.alias.as_deref(), "object unregistered");
        self.emit_from_root(OBJECT_REMOVED, Args::positional(vec![Value::Uid(uid)]));
        true
    }

    /// Local id for an alias or a dashed-hex id string.
    pub fn lookup(&self, name: &str) -> Option<Uid> {
        if let Some(uid) = self.inner.aliases.borrow().get(name) {
            return Some(*uid);
        }
        let uid = name.parse::<Uid>().ok()?;
        self.inner.objects.borrow().contains_key(&uid).then_some(uid)
    }

    pub fn get_object(&self, uid: Uid) -> Option<Rc<dyn SharedObject>> {
        self.inner.objects.borrow().get(&uid).map(|r| r.object.clone())
    }

    /// Ids and aliases of every local object.
    pub fn list_objects(&self) -> Vec<Value> {
        let mut out: Vec<Value> = self
            .inner
            .objects
            .borrow()
            .keys()
            .map(|uid| Value::Uid(*uid))
            .collect();
        out.extend(
            self.inner
                .aliases
                .borrow()
                .keys()
                .map(|a| Value::from(a.as_str())),
        );
        out
    }

    pub fn get_object_info(&self, uid: Uid) -> Option<ObjectInfo> {
        self.inner.objects.borrow().get(&uid).map(|r| r.info.clone())
    }

    /// Invoke a local object directly, bypassing the network.
    pub fn call_local(&self, uid: Uid, method: &str, args: Args) -> Result<Value, RemoteError> {
        self.invoke(None, uid, method, args)
    }

    fn invoke(
        &self,
        caller: Option<Uid>,
        uid: Uid,
        method: &str,
        args: Args,
    ) -> Result<Value, RemoteError> {
        let (object, known) = {
            let objects = self.inner.objects.borrow();
            let reg = objects
                .get(&uid)
                .ok_or_else(|| RemoteError::ObjectNotFound(uid.to_string()))?;
            (
                reg.object.clone(),
                reg.info.descriptor.get_function(method).is_some(),
            )
        };
        if !known {
            return Err(RemoteError::MethodNotFound {
                object: uid.to_string(),
                method: method.to_string(),
            });
        }
        let ctx = CallContext::new(self, uid, caller);
        object.call(&ctx, method, args)
    }

    // ---- object lookup ----

    /// Find an object by alias or id string: locally, then among cached proxies,
    /// then by asking clients (those known to list it first).
    pub async fn find_object(&self, name: &str) -> Option<ObjectHandle> {
        if let Some(uid) = self.lookup(name) {
            return Some(ObjectHandle::Local(uid));
        }
        if let Some(proxy) = self.cached_proxy(name, None) {
            return Some(ObjectHandle::Remote(proxy));
        }
        let mut candidates: Vec<Uid> = Vec::new();
        {
            let lists = self.inner.client_objects.borrow();
            for (client, names) in lists.iter() {
                if names.iter().any(|v| names_object(v, name)) {
                    candidates.push(*client);
                }
            }
        }
        for client in self.clients() {
            if !candidates.contains(&client) {
                candidates.push(client);
            }
        }
        for client in candidates {
            match self.get_object_from(name, client).await {
                Ok(Some(proxy)) => return Some(ObjectHandle::Remote(proxy)),
                Ok(None) => {}
                Err(e) => warn!(%client, "lookup of {} failed: {}", name, e),
            }
        }
        None
    }

    /// Proxy for object `name` (alias or id string) at `client`, or `None` if the
    /// client does not have it.
    pub async fn get_object_from(&self, name: &str, client: Uid) -> Result<Option<Rc<Proxy>>, Error> {
        if let Some(proxy) = self.cached_proxy(name, Some(client)) {
            return Ok(Some(proxy));
        }
        let value = self
            .call(client, client, "get_object_info", vec![Value::from(name)])
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let info = ObjectInfo::from_value(&value)
            .ok_or_else(|| RemoteError::Failed("malformed object info".into()))?;
        let uid = info.uid;
        let proxy = self.proxy_for(client, uid, Some(info.descriptor));
        self.inner
            .proxy_names
            .borrow_mut()
            .insert(name.to_string(), (client, uid));
        Ok(Some(proxy))
    }

    /// Connect to `address` if needed and fetch object `name` from that peer.
    pub async fn get_object_at(&self, address: &str, name: &str) -> Result<Option<Rc<Proxy>>, Error> {
        let client = self.connect(address).await?;
        self.get_object_from(name, client).await
    }

    fn cached_proxy(&self, name: &str, client: Option<Uid>) -> Option<Rc<Proxy>> {
        let key = *self.inner.proxy_names.borrow().get(name)?;
        if client.is_some_and(|c| c != key.0) {
            return None;
        }
        self.inner.proxies.borrow().get(&key).cloned()
    }

    /// The one proxy for (`client`, `uid`), created on first use.
    fn proxy_for(
        &self,
        client: Uid,
        uid: Uid,
        descriptor: Option<ObjectDescriptor>,
    ) -> Rc<Proxy> {
        if let Some(proxy) = self.inner.proxies.borrow().get(&(client, uid)) {
            if let Some(d) = descriptor {
                if proxy.descriptor().is_none() {
                    proxy.set_descriptor(d);
                }
            }
            return proxy.clone();
        }
        let proxy = Rc::new(Proxy::new(
            uid,
            client,
            self.client_address(client),
            descriptor,
            self.downgrade(),
        ));
        self.inner
            .proxies
            .borrow_mut()
            .insert((client, uid), proxy.clone());
        debug!(%uid, %client, "proxy created");
        proxy
    }

    // ---- calls ----

    /// Call `method` on `object` at `client` and wait for the result with the
    /// default timeout.
    pub async fn call(
        &self,
        client: Uid,
        object: Uid,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        self.call_with(client, object, method, Args::positional(args), None)
            .await
    }

    /// Synchronous call. On timeout the pending record is discarded; a late
    /// return is then dropped as unknown.
    pub async fn call_with(
        &self,
        client: Uid,
        object: Uid,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let reply = self.issue(client, object, method, &args)?;
        let timeout = timeout.unwrap_or(self.inner.config.call_timeout);
        if !reply.is_valid() {
            self.run_until(&[&reply], Some(timeout)).await;
        }
        match reply.try_get() {
            Some(result) => result,
            None => {
                self.discard_pending(reply.call_id());
                warn!(call_id = reply.call_id(), %client, method, "call timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Asynchronous call: returns immediately. With a timeout the reply is failed
    /// with `Timeout` by a timer if nothing arrives in time.
    pub fn call_async(
        &self,
        client: Uid,
        object: Uid,
        method: &str,
        args: Args,
        options: CallOptions,
    ) -> Result<AsyncReply, Error> {
        let reply = self.issue(client, object, method, &args)?;
        if let Some(callback) = options.callback {
            reply.on_resolve(callback);
        }
        if let Some(timeout) = options.timeout {
            let weak = self.downgrade();
            let call_id = reply.call_id();
            let timer = self.inner.event_loop.schedule(timeout, false, move || {
                if let Some(sharer) = Sharer::upgrade(&weak) {
                    sharer.expire(call_id);
                }
                false
            });
            if let Some(pending) = self.inner.pending.borrow_mut().get_mut(&call_id) {
                pending.timer = Some(timer);
            }
        }
        Ok(reply)
    }

    fn issue(&self, client: Uid, object: Uid, method: &str, args: &Args) -> Result<AsyncReply, Error> {
        let conn = self.conn_of(client).ok_or(Error::NotConnected(client))?;
        let (wargs, wkwargs, mut parts) = codec::wrap_args(&args.positional, &args.named)?;
        let call_id = self.next_call_id();
        let head = Envelope::Call {
            call_id,
            object,
            method: method.to_string(),
            args: wargs,
            kwargs: wkwargs,
        }
        .encode()?;
        parts.insert(0, head);
        self.transport().send(conn, &parts)?;
        debug!(call_id, %client, %object, method, parts = parts.len(), "sending call");

        let reply = AsyncReply::new(call_id, client, self.downgrade());
        self.inner.pending.borrow_mut().insert(
            call_id,
            PendingCall {
                reply: reply.clone(),
                timer: None,
            },
        );
        Ok(reply)
    }

    fn next_call_id(&self) -> u64 {
        let id = self.inner.last_call_id.get() + 1;
        self.inner.last_call_id.set(id);
        id
    }

    pub fn has_pending_call(&self, call_id: u64) -> bool {
        self.inner.pending.borrow().contains_key(&call_id)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    fn discard_pending(&self, call_id: u64) -> Option<PendingCall> {
        let pending = self.inner.pending.borrow_mut().remove(&call_id)?;
        if let Some(timer) = pending.timer {
            self.inner.event_loop.cancel(timer);
        }
        Some(pending)
    }

    fn expire(&self, call_id: u64) {
        if let Some(pending) = self.discard_pending(call_id) {
            warn!(call_id, "async call timed out");
            pending.reply.resolve(Err(Error::Timeout));
        }
    }

    // ---- signals ----

    /// Subscribe to `signal` of object `uid` (local, or remote via its proxy).
    /// `extra` arguments are appended to each delivery.
    pub fn connect_signal(
        &self,
        uid: Uid,
        signal: &str,
        callback: SignalCallback,
        extra: Args,
    ) -> SignalHandle {
        let mut table = self.inner.signals.borrow_mut();
        table.last_handle += 1;
        let handle = table.last_handle;
        table.by_handle.insert(
            handle,
            Subscription {
                object: uid,
                signal: signal.to_string(),
                callback,
                extra,
            },
        );
        table
            .by_name
            .entry((uid, signal.to_string()))
            .or_default()
            .push(handle);
        SignalHandle(handle)
    }

    pub fn disconnect_signal(&self, handle: SignalHandle) -> bool {
        let mut table = self.inner.signals.borrow_mut();
        let Some(sub) = table.by_handle.remove(&handle.0) else {
            return false;
        };
        let key = (sub.object, sub.signal);
        if let Some(list) = table.by_name.get_mut(&key) {
            list.retain(|h| *h != handle.0);
            if list.is_empty() {
                table.by_name.remove(&key);
            }
        }
        true
    }

    /// Emit a signal from local object `uid`: sent to every client, then delivered
    /// to local subscribers.
    pub fn emit(&self, uid: Uid, signal: &str, args: Args) -> Result<(), Error> {
        if !self.inner.objects.borrow().contains_key(&uid) {
            return Err(Error::NotLocal(uid));
        }
        let targets: Vec<(Uid, ConnectionId)> = self
            .inner
            .clients
            .borrow()
            .iter()
            .map(|(client, r)| (*client, r.conn))
            .collect();
        if !targets.is_empty() {
            let mut positional = Vec::with_capacity(args.positional.len() + 2);
            positional.push(Value::Uid(uid));
            positional.push(Value::from(signal));
            positional.extend(args.positional.iter().cloned());
            let (wargs, mut wkwargs, parts) = codec::wrap_args(&positional, &args.named)?;
            wkwargs.insert(SIGNAL_FLAG.to_string(), WireValue::Bool(true));
            debug!(%uid, signal, clients = targets.len(), "emitting signal");
            for (client, conn) in targets {
                let head = Envelope::Call {
                    call_id: self.next_call_id(),
                    object: client,
                    method: "receive_signal".to_string(),
                    args: wargs.clone(),
                    kwargs: wkwargs.clone(),
                }
                .encode()?;
                let mut message = Vec::with_capacity(parts.len() + 1);
                message.push(head);
                message.extend(parts.iter().cloned());
                if let Err(e) = self.transport().send(conn, &message) {
                    warn!(%client, "signal {} not sent: {}", signal, e);
                }
            }
        }
        self.receive_signal(uid, signal, args);
        Ok(())
    }

    /// Remove every subscription to signals of `uid`; returns how many.
    fn drop_subscriptions(&self, uid: Uid) -> usize {
        let handles: Vec<u64> = self
            .inner
            .signals
            .borrow()
            .by_handle
            .iter()
            .filter(|(_, s)| s.object == uid)
            .map(|(h, _)| *h)
            .collect();
        for h in &handles {
            self.disconnect_signal(SignalHandle(*h));
        }
        handles.len()
    }

    /// Number of live signal subscriptions, local and remote.
    pub fn subscriptions(&self) -> usize {
        self.inner.signals.borrow().by_handle.len()
    }

    fn emit_from_root(&self, signal: &str, args: Args) {
        if let Err(e) = self.emit(self.uid(), signal, args) {
            error!("unable to emit {}: {}", signal, e);
        }
    }

    /// Run local subscribers of (`uid`, `signal`). Never re-broadcast.
    pub fn receive_signal(&self, uid: Uid, signal: &str, args: Args) {
        let deliveries: Vec<(SignalCallback, Args)> = {
            let table = self.inner.signals.borrow();
            let Some(handles) = table.by_name.get(&(uid, signal.to_string())) else {
                return;
            };
            handles
                .iter()
                .filter_map(|h| table.by_handle.get(h))
                .map(|sub| {
                    let mut call_args = args.clone();
                    call_args.positional.extend(sub.extra.positional.iter().cloned());
                    call_args
                        .named
                        .extend(sub.extra.named.iter().map(|(k, v)| (k.clone(), v.clone())));
                    (sub.callback.clone(), call_args)
                })
                .collect()
        };
        debug!(%uid, signal, subscribers = deliveries.len(), "delivering signal");
        for (callback, call_args) in deliveries {
            callback(&call_args);
        }
    }

    // ---- loop ----

    /// Run the event loop for `timeout`, or until `stop` if `None`.
    pub async fn run(&self, timeout: Option<Duration>) {
        self.inner.event_loop.run(self, timeout, &[]).await;
    }

    pub async fn run_forever(&self) {
        self.run(None).await
    }

    /// Run until every condition holds (returns true) or `timeout` passes. Inbound
    /// signals are deferred meanwhile.
    pub async fn run_until(&self, wait_for: &[&dyn WaitFor], timeout: Option<Duration>) -> bool {
        self.inner.event_loop.run(self, timeout, wait_for).await
    }

    /// Make every running `run` return.
    pub fn stop(&self) {
        self.inner.event_loop.stop();
    }

    /// Call `callback` after `delay`, repeatedly if `periodic` for as long as it
    /// returns true.
    pub fn schedule(
        &self,
        delay: Duration,
        periodic: bool,
        callback: impl FnMut() -> bool + 'static,
    ) -> TimerId {
        self.inner.event_loop.schedule(delay, periodic, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.event_loop.cancel(id)
    }

    // ---- dispatch ----

    fn send_envelope(&self, conn: ConnectionId, envelope: &Envelope) {
        let result = envelope
            .encode()
            .map_err(Error::from)
            .and_then(|head| self.transport().send(conn, &[head]).map_err(Error::from));
        if let Err(e) = result {
            warn!(%conn, kind = envelope.kind(), "unable to send: {}", e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_call(
        &self,
        conn: ConnectionId,
        sender: Option<Uid>,
        call_id: u64,
        object: Uid,
        method: String,
        args: Vec<WireValue>,
        kwargs: BTreeMap<String, WireValue>,
        mut parts: VecDeque<Bytes>,
        is_signal: bool,
    ) {
        debug!(call_id, %object, method, signal = is_signal, "processing call");
        let result = self
            .unwrap_args(sender, args, kwargs, &mut parts)
            .and_then(|args| self.invoke(sender, object, &method, args));
        if is_signal {
            if let Err(e) = result {
                warn!(%object, method, "signal delivery failed: {}", e);
            }
            return;
        }
        self.send_return(conn, call_id, result);
    }

    fn unwrap_args(
        &self,
        sender: Option<Uid>,
        args: Vec<WireValue>,
        kwargs: BTreeMap<String, WireValue>,
        parts: &mut VecDeque<Bytes>,
    ) -> Result<Args, RemoteError> {
        let resolver = Resolver {
            sharer: self,
            sender,
        };
        let fail = |e: CodecError| RemoteError::Unwrap(e.to_string());
        let positional = args
            .into_iter()
            .map(|w| codec::unwrap(w, parts, &resolver))
            .collect::<Result<Vec<_>, _>>()
            .map_err(fail)?;
        let mut named = BTreeMap::new();
        for (k, w) in kwargs {
            if k == SIGNAL_FLAG {
                continue;
            }
            named.insert(k, codec::unwrap(w, parts, &resolver).map_err(fail)?);
        }
        Ok(Args::new(positional, named))
    }

    fn send_return(&self, conn: ConnectionId, call_id: u64, result: Result<Value, RemoteError>) {
        let mut parts = Vec::new();
        let value = match result {
            Ok(value) => codec::wrap(&value, &mut parts).map_err(|e| {
                parts.clear();
                RemoteError::Encode(e.to_string())
            }),
            Err(e) => Err(e),
        };
        let head = match (Envelope::Return { call_id, value }).encode() {
            Ok(head) => head,
            Err(e) => {
                parts.clear();
                let fallback = Envelope::Return {
                    call_id,
                    value: Err(RemoteError::Encode(e.to_string())),
                };
                match fallback.encode() {
                    Ok(head) => head,
                    Err(e) => {
                        error!(call_id, "unable to encode return: {}", e);
                        return;
                    }
                }
            }
        };
        parts.insert(0, head);
        if let Err(e) = self.transport().send(conn, &parts) {
            warn!(%conn, call_id, "unable to send return: {}", e);
        }
    }

    fn handle_return(
        &self,
        sender: Option<Uid>,
        call_id: u64,
        value: Result<WireValue, RemoteError>,
        mut parts: VecDeque<Bytes>,
    ) {
        let expected = self
            .inner
            .pending
            .borrow()
            .get(&call_id)
            .map(|p| p.reply.client());
        let Some(expected) = expected else {
            warn!(call_id, "return for unknown call dropped");
            return;
        };
        if sender != Some(expected) {
            warn!(call_id, ?sender, %expected, "return from the wrong client dropped");
            return;
        }
        let Some(pending) = self.discard_pending(call_id) else {
            return;
        };
        let result = match value {
            Ok(wire) => {
                let resolver = Resolver {
                    sharer: self,
                    sender,
                };
                codec::unwrap(wire, &mut parts, &resolver).map_err(Error::from)
            }
            Err(e) => Err(Error::Remote(e)),
        };
        debug!(call_id, ok = result.is_ok(), "processing return");
        pending.reply.resolve(result);
    }

    fn handle_hello(&self, conn: ConnectionId, client: Uid, address: Option<String>, reply: bool) {
        debug!(%conn, %client, ?address, reply, "hello");
        if client == self.uid() {
            warn!(%conn, "connected to ourselves, closing");
            self.drop_conn(conn);
            return;
        }
        match self.conn_of(client) {
            Some(old) if old == conn => {
                debug!(%conn, %client, "duplicate hello ignored");
                return;
            }
            Some(old) => {
                info!(%client, "client connected again, replacing {}", old);
                self.transport().close(old);
                self.client_lost(client);
            }
            None => {}
        }
        let dialed = self.inner.dialing.borrow_mut().remove(&conn);
        self.inner.conn_clients.borrow_mut().insert(conn, client);
        self.inner.clients.borrow_mut().insert(
            client,
            ClientRecord {
                conn,
                address,
                dialed,
                root: None,
                watches: Vec::new(),
            },
        );
        if reply {
            self.send_envelope(
                conn,
                &Envelope::HelloReply {
                    client: self.uid(),
                    address: self.address(),
                },
            );
        }
        self.request_client_proxy(client);
    }

    /// Ask the peer for its root info, then its object list.
    fn request_client_proxy(&self, client: Uid) {
        let weak = self.downgrade();
        let options = CallOptions::new()
            .timeout(self.inner.config.connect_timeout)
            .callback(move |result| {
                let Some(sharer) = Sharer::upgrade(&weak) else {
                    return;
                };
                match result {
                    Ok(value) => sharer.client_root_ready(client, value),
                    Err(e) => {
                        warn!(%client, "unable to retrieve root object: {}", e);
                        sharer.disconnect_client(client);
                    }
                }
            });
        let args = Args::positional(vec![Value::from(ROOT_ALIAS)]);
        if let Err(e) = self.call_async(client, client, "get_object_info", args, options) {
            warn!(%client, "root request not sent: {}", e);
        }
    }

    fn client_root_ready(&self, client: Uid, value: &Value) {
        let Some(info) = ObjectInfo::from_value(value) else {
            warn!(%client, "malformed root info");
            self.disconnect_client(client);
            return;
        };
        if !self.inner.clients.borrow().contains_key(&client) {
            return;
        }
        let root = self.proxy_for(client, info.uid, Some(info.descriptor));

        let weak = self.downgrade();
        let added: SignalCallback = Rc::new(move |args: &Args| {
            if let Some(sharer) = Sharer::upgrade(&weak) {
                sharer.client_object_added(client, args);
            }
        });
        let weak = self.downgrade();
        let removed: SignalCallback = Rc::new(move |args: &Args| {
            if let Some(sharer) = Sharer::upgrade(&weak) {
                sharer.client_object_removed(client, args);
            }
        });
        let watches = vec![
            self.connect_signal(info.uid, OBJECT_ADDED, added, Args::default()),
            self.connect_signal(info.uid, OBJECT_REMOVED, removed, Args::default()),
        ];
        if let Some(record) = self.inner.clients.borrow_mut().get_mut(&client) {
            record.root = Some(root);
            record.watches = watches;
        }
        info!(%client, "client ready");

        let weak = self.downgrade();
        let options = CallOptions::new().callback(move |result| {
            let Some(sharer) = Sharer::upgrade(&weak) else {
                return;
            };
            match result {
                Ok(Value::List(names)) => {
                    sharer
                        .inner
                        .client_objects
                        .borrow_mut()
                        .insert(client, names.clone());
                }
                Ok(other) => warn!(%client, "unexpected object list {:?}", other),
                Err(e) => warn!(%client, "unable to list objects: {}", e),
            }
        });
        if let Err(e) = self.call_async(client, client, "list_objects", Args::default(), options) {
            warn!(%client, "object list request not sent: {}", e);
        }
    }

    fn client_object_added(&self, client: Uid, args: &Args) {
        let mut lists = self.inner.client_objects.borrow_mut();
        let list = lists.entry(client).or_default();
        if let Some(uid) = args.get(0, "uid").and_then(Value::as_uid) {
            list.push(Value::Uid(uid));
        }
        if let Some(name) = args.named.get("name").and_then(Value::as_str) {
            list.push(Value::from(name));
        }
    }

    /// Drop the peer's removed object from name caches and its signal
    /// subscriptions. The proxy stays in the table until the client goes, so it
    /// is still invalidated then; calls through it now fail remotely.
    fn client_object_removed(&self, client: Uid, args: &Args) {
        let Some(uid) = args.get(0, "uid").and_then(Value::as_uid) else {
            return;
        };
        let stale: Vec<String> = self
            .inner
            .proxy_names
            .borrow()
            .iter()
            .filter(|(_, key)| **key == (client, uid))
            .map(|(name, _)| name.clone())
            .collect();
        if let Some(list) = self.inner.client_objects.borrow_mut().get_mut(&client) {
            list.retain(|v| {
                v.as_uid() != Some(uid) && !stale.iter().any(|n| v.as_str() == Some(n.as_str()))
            });
        }
        {
            let mut names = self.inner.proxy_names.borrow_mut();
            for name in stale {
                names.remove(&name);
            }
        }
        let dropped = self.drop_subscriptions(uid);
        debug!(%client, %uid, dropped, "remote object removed");
    }

    /// Decode and dispatch one message. With `defer_signals`, signal deliveries are
    /// queued for `flush_deferred` instead.
    fn handle_message(&self, conn: ConnectionId, parts: Vec<Bytes>, defer_signals: bool) {
        let mut parts = VecDeque::from(parts);
        let Some(head) = parts.pop_front() else {
            warn!(%conn, "empty message dropped");
            return;
        };
        let envelope = match Envelope::decode(&head) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%conn, "unable to decode message: {}", e);
                return;
            }
        };
        if defer_signals && envelope.is_signal() {
            parts.push_front(head);
            self.inner
                .deferred
                .borrow_mut()
                .push_back((conn, parts.into()));
            return;
        }
        let sender = self.client_of(conn);
        let is_signal = envelope.is_signal();
        match envelope {
            Envelope::Call {
                call_id,
                object,
                method,
                args,
                kwargs,
            } => self.handle_call(conn, sender, call_id, object, method, args, kwargs, parts, is_signal),
            Envelope::Return { call_id, value } => self.handle_return(sender, call_id, value, parts),
            Envelope::HelloFrom { client, address } => self.handle_hello(conn, client, address, true),
            Envelope::HelloReply { client, address } => {
                self.handle_hello(conn, client, address, false)
            }
            Envelope::GoodbyeFrom { address } => self.handle_goodbye(conn, address),
            Envelope::Ping => {
                info!(?sender, "PING");
                self.send_envelope(conn, &Envelope::Pong);
            }
            Envelope::Pong => info!(?sender, "PONG"),
        }
    }

    fn handle_goodbye(&self, conn: ConnectionId, address: Option<String>) {
        let client = self
            .client_of(conn)
            .or_else(|| address.as_deref().and_then(|a| self.client_at(a)));
        info!(%conn, ?client, ?address, "goodbye");
        self.transport().close(conn);
        self.inner.dialing.borrow_mut().remove(&conn);
        if let Some(client) = client {
            self.client_lost(client);
        }
    }

    /// Purge `client`: fail its pending calls, invalidate its proxies.
    fn client_lost(&self, client: Uid) {
        let Some(record) = self.inner.clients.borrow_mut().remove(&client) else {
            return;
        };
        info!(%client, "client disconnected, removing from clients map");
        self.inner.conn_clients.borrow_mut().remove(&record.conn);
        self.inner.client_objects.borrow_mut().remove(&client);
        self.inner
            .proxy_names
            .borrow_mut()
            .retain(|_, (c, _)| *c != client);
        for handle in record.watches {
            self.disconnect_signal(handle);
        }

        let proxies: Vec<Rc<Proxy>> = {
            let mut table = self.inner.proxies.borrow_mut();
            let keys: Vec<(Uid, Uid)> = table.keys().filter(|(c, _)| *c == client).copied().collect();
            keys.iter().filter_map(|k| table.remove(k)).collect()
        };
        for proxy in &proxies {
            self.drop_subscriptions(proxy.uid());
        }
        let failed: Vec<u64> = self
            .inner
            .pending
            .borrow()
            .iter()
            .filter(|(_, p)| p.reply.client() == client)
            .map(|(id, _)| *id)
            .collect();
        for call_id in failed {
            if let Some(pending) = self.discard_pending(call_id) {
                pending.reply.resolve(Err(Error::Disconnected(client)));
            }
        }
        for proxy in proxies {
            proxy.client_disconnected();
        }
    }
}

impl Dispatch for Sharer {
    fn connection_opened(&self, conn: ConnectionId) {
        debug!(%conn, peer = ?self.transport().peer_addr(conn), "connection opened");
    }

    fn process_message(&self, conn: ConnectionId, parts: Vec<Bytes>, waiting: bool) {
        // A signal queues behind earlier deferred ones to keep arrival order.
        let defer = waiting || self.has_deferred();
        self.handle_message(conn, parts, defer);
    }

    fn connection_lost(&self, conn: ConnectionId) {
        if let Some(address) = self.inner.dialing.borrow_mut().remove(&conn) {
            warn!(%conn, %address, "connection failed before handshake");
        }
        self.inner
            .deferred
            .borrow_mut()
            .retain(|(c, _)| *c != conn);
        let client = self.inner.conn_clients.borrow_mut().remove(&conn);
        if let Some(client) = client {
            self.client_lost(client);
        }
    }

    fn flush_deferred(&self, max: usize) {
        for _ in 0..max {
            let next = self.inner.deferred.borrow_mut().pop_front();
            let Some((conn, parts)) = next else {
                break;
            };
            self.handle_message(conn, parts, false);
        }
    }

    fn has_deferred(&self) -> bool {
        !self.inner.deferred.borrow().is_empty()
    }
}

/// Resolves object references in messages from `sender`.
struct Resolver<'a> {
    sharer: &'a Sharer,
    sender: Option<Uid>,
}

impl ObjectResolver for Resolver<'_> {
    fn resolve(&self, uid: Uid, owner: Option<&Owner>) -> Result<ObjectHandle, CodecError> {
        let client = match owner {
            Some(owner) => owner.client,
            None => self.sender.ok_or(CodecError::UnknownOwner(uid))?,
        };
        if client == self.sharer.uid() {
            return Ok(ObjectHandle::Local(uid));
        }
        if self.sharer.conn_of(client).is_none() {
            match owner.and_then(|o| o.address.as_deref()) {
                Some(address) => {
                    info!(%uid, %client, %address, "object from unconnected client, connecting");
                    if let Err(e) = self.sharer.connect_nowait(address) {
                        warn!(%address, "cannot connect: {}", e);
                    }
                }
                None => return Err(CodecError::UnknownOwner(uid)),
            }
        }
        Ok(ObjectHandle::Remote(self.sharer.proxy_for(client, uid, None)))
    }
}

/// Whether an object-list entry names `name` (alias or id string).
fn names_object(entry: &Value, name: &str) -> bool {
    match entry {
        Value::Str(s) => s == name,
        Value::Uid(uid) => uid.to_string() == name,
        _ => false,
    }
}

/// Accepts `tcp://host:port` or `host:port`; returns `host:port`.
fn normalize_address(address: &str) -> Result<String, Error> {
    let bare = address.strip_prefix("tcp://").unwrap_or(address);
    let invalid = || Error::InvalidAddress(address.to_string());
    let (host, port) = bare.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(bare.to_string())
}
