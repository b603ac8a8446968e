//! Two sharers over loopback TCP: S serves a counter object, C uses it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use objsh_core::codec::WireValue;
use objsh_core::transport::{ConnectionId, Transport, TransportEvent};
use objsh_core::{
    Args, CallContext, CallOptions, DType, Envelope, Error, FunctionSpec, NdArray,
    ObjectDescriptor, ObjectHandle, Proxy, RemoteError, SharedObject, Sharer, SharerConfig, Uid,
    Value,
};
use rand::Rng;
use tokio::task::{JoinHandle, LocalSet};

#[derive(Default)]
struct Counter {
    arrays: RefCell<Vec<NdArray>>,
    serial_calls: Cell<u32>,
}

impl SharedObject for Counter {
    fn describe(&self) -> ObjectDescriptor {
        ObjectDescriptor::new()
            .function(FunctionSpec::new("increment").params(&["n"]))
            .function(FunctionSpec::new("take_array").params(&["data"]))
            .function(FunctionSpec::new("identity").params(&["value"]))
            .function(FunctionSpec::new("me"))
            .function(FunctionSpec::new("fail"))
            .function(FunctionSpec::new("serial").cached())
            .function(FunctionSpec::new("emit_then_reply"))
            .function(FunctionSpec::new("emit_twice_then_reply"))
            .function(FunctionSpec::new("drop_caller"))
            .property("count")
    }

    fn call(&self, ctx: &CallContext<'_>, method: &str, args: Args) -> Result<Value, RemoteError> {
        match method {
            "increment" => Ok(Value::Int(args.i64(0, "n")? + 1)),
            "take_array" => {
                let data = args.array(0, "data")?.clone();
                let len = data.len() as i64;
                self.arrays.borrow_mut().push(data);
                Ok(Value::Int(len))
            }
            "identity" => Ok(args.value(0, "value")?.clone()),
            "me" => Ok(Value::Object(ObjectHandle::Local(ctx.object()))),
            "fail" => Err(RemoteError::Failed("counter broke".into())),
            "serial" => {
                self.serial_calls.set(self.serial_calls.get() + 1);
                Ok(Value::from("SN-0001"))
            }
            "emit_then_reply" => {
                ctx.emit("tick", Args::positional(vec![Value::Int(1)]))
                    .map_err(|e| RemoteError::Failed(e.to_string()))?;
                Ok(Value::from("done"))
            }
            "emit_twice_then_reply" => {
                for n in [1, 2] {
                    ctx.emit("tick", Args::positional(vec![Value::Int(n)]))
                        .map_err(|e| RemoteError::Failed(e.to_string()))?;
                }
                Ok(Value::from("done"))
            }
            "drop_caller" => {
                if let Some(caller) = ctx.caller() {
                    ctx.sharer().disconnect_client(caller);
                }
                Ok(Value::Null)
            }
            _ => Err(RemoteError::MethodNotFound {
                object: "counter".into(),
                method: method.into(),
            }),
        }
    }
}

struct Pair {
    s: Sharer,
    c: Sharer,
    /// S's client id as seen from C.
    server: Uid,
    addr: String,
    pump: JoinHandle<()>,
    counter: Rc<Counter>,
    counter_uid: Uid,
}

/// S listening with its loop running in the background; C connected to it.
async fn setup() -> Pair {
    let s = Sharer::new(SharerConfig::default());
    let counter = Rc::new(Counter::default());
    let counter_uid = s.register(counter.clone(), Some("counter")).unwrap();
    let addr = s.listen("127.0.0.1", None).await.unwrap().to_string();
    let pump = tokio::task::spawn_local({
        let s = s.clone();
        async move { s.run_forever().await }
    });
    let c = Sharer::new(SharerConfig::default());
    let server = c.connect(&addr).await.unwrap();
    Pair {
        s,
        c,
        server,
        addr,
        pump,
        counter,
        counter_uid,
    }
}

/// Run C's loop in short slices until `done` holds. Unlike `run_until`, signals
/// are delivered while this runs.
async fn pump_until(c: &Sharer, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        c.run(Some(Duration::from_millis(20))).await;
    }
    true
}

/// Bare transport standing in for a peer: answers hellos as `uid` and records
/// every other message it receives.
struct RawPeer {
    transport: Transport,
    uid: Uid,
    addr: String,
    conn: Cell<Option<ConnectionId>>,
    received: RefCell<Vec<(Envelope, Vec<Bytes>)>>,
}

impl RawPeer {
    async fn listen() -> Self {
        let transport = Transport::new();
        let addr = transport.listen("127.0.0.1", None).await.unwrap().to_string();
        Self {
            transport,
            uid: Uid::new(),
            addr,
            conn: Cell::new(None),
            received: RefCell::new(Vec::new()),
        }
    }

    async fn pump(&self) {
        for event in self.transport.poll(Duration::from_millis(5)).await {
            let TransportEvent::Message(conn, parts) = event else {
                continue;
            };
            self.conn.set(Some(conn));
            match Envelope::decode(&parts[0]).unwrap() {
                Envelope::HelloFrom { .. } => self.send(&Envelope::HelloReply {
                    client: self.uid,
                    address: Some(self.addr.clone()),
                }),
                other => self.received.borrow_mut().push((other, parts)),
            }
        }
        self.transport.flush();
    }

    fn send(&self, envelope: &Envelope) {
        let conn = self.conn.get().unwrap();
        self.transport.send(conn, &[envelope.encode().unwrap()]).unwrap();
        self.transport.flush();
    }
}

/// Alternate C's loop and the raw peer until `done` holds or `limit` passes.
async fn drive(c: &Sharer, peer: &RawPeer, limit: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        c.run(Some(Duration::from_millis(5))).await;
        peer.pump().await;
    }
    true
}

async fn counter_proxy(c: &Sharer) -> Rc<Proxy> {
    match c.find_object("counter").await {
        Some(ObjectHandle::Remote(p)) => p,
        other => panic!("counter not found: {:?}", other),
    }
}

#[tokio::test]
async fn handshake_records_both_sides() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            assert_eq!(p.server, p.s.uid());
            assert_eq!(p.c.clients(), vec![p.server]);
            assert!(p.s.clients().contains(&p.c.uid()));
            assert_eq!(p.c.client_address(p.server).as_deref(), Some(p.addr.as_str()));

            let root = p.c.root_proxy(p.server).unwrap();
            assert_eq!(root.uid(), p.server);
            assert_eq!(
                root.call("hello_world", vec![]).await.unwrap(),
                Value::from("Hello world!")
            );
            // Connecting again to a known address reuses the client.
            assert_eq!(p.c.connect(&format!("tcp://{}", p.addr)).await.unwrap(), p.server);
            p.c.ping(p.server).unwrap();
        })
        .await;
}

#[tokio::test]
async fn sync_call_returns_result() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            assert_eq!(counter.uid(), p.counter_uid);
            assert_eq!(counter.client(), p.server);
            assert!(counter.properties().contains(&"count".to_string()));
            let v = counter.call("increment", vec![Value::Int(41)]).await.unwrap();
            assert_eq!(v, Value::Int(42));
            assert_eq!(p.c.pending_calls(), 0);
        })
        .await;
}

#[tokio::test]
async fn async_call_fires_callback_once() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            let seen = Rc::new(RefCell::new(Vec::new()));
            let s = seen.clone();
            let reply = counter
                .call_async(
                    "increment",
                    Args::positional(vec![Value::Int(41)]),
                    CallOptions::new().callback(move |r| s.borrow_mut().push(r.clone())),
                )
                .unwrap();
            assert!(!reply.is_valid());
            assert!(seen.borrow().is_empty());

            assert!(p.c.run_until(&[&reply], Some(Duration::from_secs(2))).await);
            assert!(reply.is_valid());
            let seen = seen.borrow();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].as_ref().unwrap(), &Value::Int(42));
            assert_eq!(reply.get(None).await.unwrap(), Value::Int(42));
        })
        .await;
}

#[tokio::test]
async fn signal_reaches_connected_subscriber_only() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;

            let first = Rc::new(RefCell::new(Vec::new()));
            let f = first.clone();
            counter
                .connect("tick", Rc::new(move |a: &Args| f.borrow_mut().push(a.positional.clone())))
                .unwrap();
            let second = Rc::new(Cell::new(0));
            let s2 = second.clone();
            let handle = counter
                .connect("tick", Rc::new(move |_: &Args| s2.set(s2.get() + 1)))
                .unwrap();
            assert!(counter.disconnect(handle).unwrap());

            p.s.emit(p.counter_uid, "tick", Args::positional(vec![Value::Int(7)]))
                .unwrap();
            assert!(pump_until(&p.c, || !first.borrow().is_empty()).await);
            p.c.run(Some(Duration::from_millis(100))).await;

            assert_eq!(*first.borrow(), vec![vec![Value::Int(7)]]);
            assert_eq!(second.get(), 0);
        })
        .await;
}

#[tokio::test]
async fn signals_deferred_during_sync_call() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            let hits = Rc::new(Cell::new(0));
            let h = hits.clone();
            counter
                .connect("tick", Rc::new(move |_: &Args| h.set(h.get() + 1)))
                .unwrap();

            // The signal is sent before the return, but must not run inside the call.
            let v = counter.call("emit_then_reply", vec![]).await.unwrap();
            assert_eq!(v, Value::from("done"));
            assert_eq!(hits.get(), 0);

            assert!(pump_until(&p.c, || hits.get() == 1).await);
        })
        .await;
}

#[tokio::test]
async fn deferred_signals_keep_arrival_order() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            let seen = Rc::new(RefCell::new(Vec::new()));
            let s = seen.clone();
            counter
                .connect("tick", Rc::new(move |a: &Args| s.borrow_mut().push(a.positional[0].clone())))
                .unwrap();

            counter.call("emit_twice_then_reply", vec![]).await.unwrap();
            assert!(seen.borrow().is_empty());

            // tick(3) reaches C's socket before C runs its loop again.
            p.s.emit(p.counter_uid, "tick", Args::positional(vec![Value::Int(3)]))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;

            assert!(pump_until(&p.c, || seen.borrow().len() == 3).await);
            assert_eq!(*seen.borrow(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        })
        .await;
}

#[tokio::test]
async fn received_signal_not_forwarded() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let c_addr = p.c.listen("127.0.0.1", None).await.unwrap().to_string();
            let c_pump = tokio::task::spawn_local({
                let c = p.c.clone();
                async move { c.run_forever().await }
            });
            // D knows only C, and listens for the counter's ticks by id.
            let d = Sharer::new(SharerConfig::default());
            assert_eq!(d.connect(&c_addr).await.unwrap(), p.c.uid());

            let at_c = Rc::new(Cell::new(0));
            let h = at_c.clone();
            p.c.connect_signal(
                p.counter_uid,
                "tick",
                Rc::new(move |_: &Args| h.set(h.get() + 1)),
                Args::default(),
            );
            let at_d = Rc::new(Cell::new(0));
            let h = at_d.clone();
            d.connect_signal(
                p.counter_uid,
                "tick",
                Rc::new(move |_: &Args| h.set(h.get() + 1)),
                Args::default(),
            );

            p.s.emit(p.counter_uid, "tick", Args::positional(vec![Value::Int(7)]))
                .unwrap();
            assert!(pump_until(&d, || at_c.get() == 1).await);
            d.run(Some(Duration::from_millis(150))).await;
            assert_eq!(at_c.get(), 1);
            assert_eq!(at_d.get(), 0);
            c_pump.abort();
        })
        .await;
}

#[tokio::test]
async fn buffer_call_is_envelope_plus_one_part() {
    LocalSet::new()
        .run_until(async {
            let peer = RawPeer::listen().await;
            let c = Sharer::new(SharerConfig::default());
            c.connect_nowait(&peer.addr).unwrap();
            assert!(drive(&c, &peer, Duration::from_secs(2), || c.clients().contains(&peer.uid)).await);

            let values: Vec<f64> = (0..10_000).map(|i| i as f64 * 0.5).collect();
            c.call_async(
                peer.uid,
                Uid::new(),
                "take_array",
                Args::positional(vec![NdArray::from_slice(&values).into()]),
                CallOptions::new(),
            )
            .unwrap();
            let arrived = || {
                peer.received
                    .borrow()
                    .iter()
                    .any(|(e, _)| matches!(e, Envelope::Call { method, .. } if method == "take_array"))
            };
            assert!(drive(&c, &peer, Duration::from_secs(2), arrived).await);

            let received = peer.received.borrow();
            let (_, parts) = received
                .iter()
                .find(|(e, _)| matches!(e, Envelope::Call { method, .. } if method == "take_array"))
                .unwrap();
            assert_eq!(parts.len(), 2);
            assert_eq!(parts[1].len(), 10_000 * 8);
            let array = NdArray::new(DType::F64, vec![10_000], parts[1].clone()).unwrap();
            assert_eq!(array.to_vec::<f64>().unwrap(), values);
        })
        .await;
}

#[tokio::test]
async fn return_from_other_client_ignored() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            let peer = RawPeer::listen().await;
            p.c.connect_nowait(&peer.addr).unwrap();
            assert!(
                drive(&p.c, &peer, Duration::from_secs(2), || p.c.clients().contains(&peer.uid))
                    .await
            );
            p.pump.abort();
            tokio::task::yield_now().await;

            let reply = counter
                .call_async("increment", Args::positional(vec![Value::Int(1)]), CallOptions::new())
                .unwrap();
            peer.send(&Envelope::Return {
                call_id: reply.call_id(),
                value: Ok(WireValue::Int(666)),
            });
            drive(&p.c, &peer, Duration::from_millis(150), || false).await;
            assert!(!reply.is_valid());
            assert!(p.c.has_pending_call(reply.call_id()));

            // The server's own answer still resolves it.
            let _pump = tokio::task::spawn_local({
                let s = p.s.clone();
                async move { s.run_forever().await }
            });
            assert!(p.c.run_until(&[&reply], Some(Duration::from_secs(2))).await);
            assert_eq!(reply.try_get().unwrap().unwrap(), Value::Int(2));
        })
        .await;
}

#[tokio::test]
async fn bulk_buffer_arrives_intact() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            let mut rng = rand::thread_rng();
            let values: Vec<f64> = (0..10_000).map(|_| rng.gen()).collect();
            let data = NdArray::from_slice(&values);

            let n = counter.call("take_array", vec![data.into()]).await.unwrap();
            assert_eq!(n, Value::Int(10_000));
            let arrays = p.counter.arrays.borrow();
            assert_eq!(arrays[0].shape(), &[10_000]);
            assert_eq!(arrays[0].to_vec::<f64>().unwrap(), values);
        })
        .await;
}

#[tokio::test]
async fn abrupt_close_fails_pending_call() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            let lost = Rc::new(Cell::new(false));
            let l = lost.clone();
            counter.on_disconnect(move || l.set(true));

            let start = Instant::now();
            let err = counter
                .call_with("drop_caller", Args::default(), Some(Duration::from_secs(5)))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Disconnected(u) if u == p.server), "{:?}", err);
            assert!(start.elapsed() < Duration::from_secs(5));
            assert!(lost.get());
            assert!(!counter.is_connected());
            assert!(p.c.clients().is_empty());
            assert_eq!(p.c.pending_calls(), 0);
            assert!(matches!(
                counter.call("increment", vec![Value::Int(1)]).await,
                Err(Error::Disconnected(_))
            ));
        })
        .await;
}

#[tokio::test]
async fn unresponsive_peer_times_out() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            p.pump.abort();
            tokio::task::yield_now().await;

            let timeout = Duration::from_millis(200);
            let start = Instant::now();
            let err = counter
                .call_with("increment", Args::positional(vec![Value::Int(1)]), Some(timeout))
                .await
                .unwrap_err();
            let elapsed = start.elapsed();
            assert!(matches!(err, Error::Timeout), "{:?}", err);
            assert!(elapsed >= timeout, "{:?}", elapsed);
            assert!(elapsed < timeout + Duration::from_millis(150), "{:?}", elapsed);
            assert_eq!(p.c.pending_calls(), 0);
            // Timeouts leave the connection alone.
            assert_eq!(p.c.clients(), vec![p.server]);
        })
        .await;
}

#[tokio::test]
async fn late_return_after_timeout_dropped() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            p.pump.abort();
            tokio::task::yield_now().await;

            let err = counter
                .call_with(
                    "increment",
                    Args::positional(vec![Value::Int(1)]),
                    Some(Duration::from_millis(100)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Timeout), "{:?}", err);

            // S wakes up and answers the abandoned call.
            let _pump = tokio::task::spawn_local({
                let s = p.s.clone();
                async move { s.run_forever().await }
            });
            p.c.run(Some(Duration::from_millis(200))).await;
            assert_eq!(p.c.pending_calls(), 0);
            assert_eq!(
                counter.call("increment", vec![Value::Int(5)]).await.unwrap(),
                Value::Int(6)
            );
            assert_eq!(p.c.clients(), vec![p.server]);
        })
        .await;
}

#[tokio::test]
async fn async_call_timeout_resolves_reply() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            p.pump.abort();
            tokio::task::yield_now().await;

            let reply = counter
                .call_async(
                    "increment",
                    Args::positional(vec![Value::Int(1)]),
                    CallOptions::new().timeout(Duration::from_millis(100)),
                )
                .unwrap();
            assert!(p.c.has_pending_call(reply.call_id()));
            assert!(p.c.run_until(&[&reply], Some(Duration::from_secs(2))).await);
            assert!(matches!(reply.try_get(), Some(Err(Error::Timeout))));
            assert!(!p.c.has_pending_call(reply.call_id()));
        })
        .await;
}

#[tokio::test]
async fn remote_errors_cross_the_wire() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            assert!(matches!(
                counter.call("fail", vec![]).await,
                Err(Error::Remote(RemoteError::Failed(m))) if m == "counter broke"
            ));
            assert!(matches!(
                counter.call("increment", vec![Value::from("forty-one")]).await,
                Err(Error::Remote(RemoteError::InvalidArguments(_)))
            ));
            assert!(matches!(
                counter.call("decrement", vec![]).await,
                Err(Error::NoSuchFunction(_))
            ));
            // Bypassing the proxy's descriptor check, the server reports it.
            assert!(matches!(
                p.c.call(p.server, p.counter_uid, "decrement", vec![]).await,
                Err(Error::Remote(RemoteError::MethodNotFound { .. }))
            ));
            let root = p.c.root_proxy(p.server).unwrap();
            assert!(matches!(
                root.call("hello_exception", vec![]).await,
                Err(Error::Remote(RemoteError::Failed(_)))
            ));
            // The connection survives all of the above.
            assert_eq!(
                counter.call("increment", vec![Value::Int(1)]).await.unwrap(),
                Value::Int(2)
            );
        })
        .await;
}

#[tokio::test]
async fn same_remote_object_same_proxy() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let a = counter_proxy(&p.c).await;
            let b = p.c.get_object_from("counter", p.server).await.unwrap().unwrap();
            assert!(Rc::ptr_eq(&a, &b));

            let by_id = p
                .c
                .get_object_from(&p.counter_uid.to_string(), p.server)
                .await
                .unwrap()
                .unwrap();
            assert!(Rc::ptr_eq(&a, &by_id));

            // A reference returned by the server resolves to the same proxy.
            let me = a.call("me", vec![]).await.unwrap();
            assert!(Rc::ptr_eq(me.as_proxy().unwrap(), &a));

            // Our proxy sent back is recognized by the server as its own object.
            let echoed = a.call("identity", vec![Value::from(a.clone())]).await.unwrap();
            assert!(Rc::ptr_eq(echoed.as_proxy().unwrap(), &a));
        })
        .await;
}

#[tokio::test]
async fn unregistered_object_disappears() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let temp = p.s.register(Rc::new(Counter::default()), Some("temp")).unwrap();
            p.c.run(Some(Duration::from_millis(100))).await;

            let proxy = match p.c.find_object("temp").await {
                Some(ObjectHandle::Remote(proxy)) => proxy,
                other => panic!("temp not found: {:?}", other),
            };
            assert_eq!(proxy.uid(), temp);
            let base = p.c.subscriptions();
            proxy.connect("tick", Rc::new(|_: &Args| {})).unwrap();
            assert_eq!(p.c.subscriptions(), base + 1);
            let lost = Rc::new(Cell::new(false));
            let l = lost.clone();
            proxy.on_disconnect(move || l.set(true));

            assert!(p.s.unregister(temp));
            assert!(p.s.lookup("temp").is_none());
            p.c.run(Some(Duration::from_millis(200))).await;

            assert!(p.c.find_object("temp").await.is_none());
            assert_eq!(p.c.subscriptions(), base);
            assert!(matches!(
                proxy.call("increment", vec![Value::Int(1)]).await,
                Err(Error::Remote(RemoteError::ObjectNotFound(_)))
            ));

            // Losing the client still reaches the evicted proxy, and no
            // subscription on its objects survives.
            let counter = counter_proxy(&p.c).await;
            counter.connect("tick", Rc::new(|_: &Args| {})).unwrap();
            p.c.disconnect_client(p.server);
            assert!(!proxy.is_connected());
            assert!(lost.get());
            assert!(!counter.is_connected());
            assert_eq!(p.c.subscriptions(), 0);
        })
        .await;
}

#[tokio::test]
async fn cached_result_skips_round_trip() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let counter = counter_proxy(&p.c).await;
            for _ in 0..3 {
                assert_eq!(
                    counter.call("serial", vec![]).await.unwrap(),
                    Value::from("SN-0001")
                );
            }
            assert_eq!(p.counter.serial_calls.get(), 1);
        })
        .await;
}

#[tokio::test]
async fn goodbye_and_reconnect() {
    LocalSet::new()
        .run_until(async {
            let p = setup().await;
            let old = counter_proxy(&p.c).await;
            let c_uid = p.c.uid();

            p.c.forget(p.server);
            assert!(p.c.clients().is_empty());
            assert!(!old.is_connected());
            let gone = || !p.s.clients().contains(&c_uid);
            let deadline = Instant::now() + Duration::from_secs(2);
            while !gone() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(gone());

            let again = p.c.reconnect(&p.addr).await.unwrap();
            assert_eq!(again, p.server);
            let fresh = counter_proxy(&p.c).await;
            assert!(!Rc::ptr_eq(&old, &fresh));
            assert_eq!(
                fresh.call("increment", vec![Value::Int(9)]).await.unwrap(),
                Value::Int(10)
            );
        })
        .await;
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    LocalSet::new()
        .run_until(async {
            let port = {
                let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                l.local_addr().unwrap().port()
            };
            let c = Sharer::new(SharerConfig::default());
            let err = c.connect(&format!("127.0.0.1:{}", port)).await.unwrap_err();
            assert!(matches!(err, Error::ConnectionFailed(_)), "{:?}", err);
            assert!(matches!(
                c.connect("no-port-here").await,
                Err(Error::InvalidAddress(_))
            ));
        })
        .await;
}
