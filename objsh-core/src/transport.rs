//! TCP transport: listening socket, outbound connections, per-connection write
//! queues and message reassembly.
//!
//! Socket reads happen in small tokio tasks that only reassemble frames and push
//! them into a channel. Everything else (connection table, write queues,
//! teardown) is owned by the loop thread and touched only from `&self` methods
//! that never hold a borrow across an await.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::wire::{self, FrameReader};

/// How long a second concurrent poller waits before handing control back.
const SHARED_POLL_SLICE: Duration = Duration::from_millis(5);

/// Handle for one TCP connection, unique for the life of the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What `poll` reports.
#[derive(Debug)]
pub enum TransportEvent {
    /// Outbound connect completed, or a new inbound connection was accepted.
    Connected(ConnectionId),
    /// One complete message: the envelope part followed by any buffer parts.
    Message(ConnectionId, Vec<Bytes>),
    /// The connection failed or was closed by the peer; it is already torn down.
    Closed(ConnectionId),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("cannot frame message: {0}")]
    Frame(String),
}

/// Notifications from the socket tasks.
enum IoEvent {
    Opened {
        conn: ConnectionId,
        inbound: bool,
        peer: Option<SocketAddr>,
        writer: OwnedWriteHalf,
        reader: JoinHandle<()>,
    },
    ConnectFailed {
        conn: ConnectionId,
        error: io::Error,
    },
    Data {
        conn: ConnectionId,
        parts: Vec<Bytes>,
    },
    Closed {
        conn: ConnectionId,
        reason: Option<String>,
    },
}

struct Connection {
    /// `None` until an outbound connect completes.
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    queue: VecDeque<Bytes>,
    peer: Option<SocketAddr>,
}

impl Connection {
    fn pending() -> Self {
        Self {
            writer: None,
            reader: None,
            queue: VecDeque::new(),
            peer: None,
        }
    }

    /// Write as much of the queue as the socket takes without blocking.
    fn flush(&mut self, id: ConnectionId) -> Result<(), String> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        while let Some(front) = self.queue.front_mut() {
            match writer.try_write(front) {
                Ok(0) => return Err("socket accepted zero bytes".to_string()),
                Ok(n) if n == front.len() => {
                    self.queue.pop_front();
                }
                Ok(n) => {
                    front.advance(n);
                    debug!(%id, remaining = front.len(), "sent partially");
                    break;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    break
                }
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
    }
}

pub struct Transport {
    conns: RefCell<HashMap<ConnectionId, Connection>>,
    next_id: Arc<AtomicU64>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: RefCell<Option<mpsc::UnboundedReceiver<IoEvent>>>,
    /// Events produced synchronously (write failures), reported by the next poll.
    ready: RefCell<VecDeque<TransportEvent>>,
    listener: RefCell<Option<(SocketAddr, JoinHandle<()>)>>,
}

impl Transport {
    pub fn new() -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            conns: RefCell::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            io_tx,
            io_rx: RefCell::new(Some(io_rx)),
            ready: RefCell::new(VecDeque::new()),
            listener: RefCell::new(None),
        }
    }

    /// Bind and start accepting. With `port` `None` an ephemeral port is chosen;
    /// the bound address is returned either way. `"*"` binds every interface.
    pub async fn listen(&self, host: &str, port: Option<u16>) -> io::Result<SocketAddr> {
        let host = if host == "*" || host.is_empty() {
            "0.0.0.0"
        } else {
            host
        };
        let listener = TcpListener::bind((host, port.unwrap_or(0))).await?;
        let bound = listener.local_addr()?;
        let tx = self.io_tx.clone();
        let ids = self.next_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn = ConnectionId(ids.fetch_add(1, Ordering::Relaxed));
                        debug!(%conn, %peer, "accepted connection");
                        if !start_connection(conn, stream, true, &tx) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
        if let Some((_, old)) = self.listener.borrow_mut().replace((bound, task)) {
            old.abort();
        }
        info!(%bound, "listening");
        Ok(bound)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.borrow().as_ref().map(|(addr, _)| *addr)
    }

    /// Open a connection to `addr` (`host:port`). Returns at once; completion or
    /// failure is reported by a later `poll`. Messages sent before completion are
    /// queued and go out once connected.
    pub fn connect(&self, addr: &str) -> ConnectionId {
        let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.conns.borrow_mut().insert(conn, Connection::pending());
        let tx = self.io_tx.clone();
        let target = addr.to_string();
        debug!(%conn, addr = %target, "connecting");
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    start_connection(conn, stream, false, &tx);
                }
                Err(error) => {
                    let _ = tx.send(IoEvent::ConnectFailed { conn, error });
                }
            }
        });
        conn
    }

    /// Frame `parts` and queue them. Never blocks; bytes leave during `flush`.
    pub fn send(&self, conn: ConnectionId, parts: &[Bytes]) -> Result<(), TransportError> {
        let segments =
            wire::encode_frame(parts).map_err(|e| TransportError::Frame(e.to_string()))?;
        let mut conns = self.conns.borrow_mut();
        let c = conns
            .get_mut(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        c.queue.extend(segments);
        Ok(())
    }

    /// Push queued bytes to every connected socket. A partial write leaves the rest
    /// queued for the next flush; a write error tears the connection down and is
    /// reported as `Closed` by the next poll.
    pub fn flush(&self) {
        let mut failed = Vec::new();
        for (&id, c) in self.conns.borrow_mut().iter_mut() {
            if let Err(reason) = c.flush(id) {
                failed.push((id, reason));
            }
        }
        for (id, reason) in failed {
            warn!(conn = %id, "send failed ({}), assuming client disconnected", reason);
            if self.teardown(id) {
                self.ready.borrow_mut().push_back(TransportEvent::Closed(id));
            }
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        self.conns
            .borrow()
            .values()
            .any(|c| c.writer.is_some() && !c.queue.is_empty())
    }

    /// Wait up to `timeout` for socket activity and report it.
    pub async fn poll(&self, timeout: Duration) -> Vec<TransportEvent> {
        let mut events: Vec<TransportEvent> = self.ready.borrow_mut().drain(..).collect();
        let Some(rx) = self.io_rx.borrow_mut().take() else {
            // Another poll is in flight; it will pick up whatever arrives.
            tokio::time::sleep(timeout.min(SHARED_POLL_SLICE)).await;
            return events;
        };
        let mut guard = ReceiverGuard {
            slot: &self.io_rx,
            rx: Some(rx),
        };
        let mut raw = Vec::new();
        if let Some(rx) = guard.rx.as_mut() {
            if events.is_empty() {
                if let Ok(Some(ev)) = tokio::time::timeout(timeout, rx.recv()).await {
                    raw.push(ev);
                }
            }
            while let Ok(ev) = rx.try_recv() {
                raw.push(ev);
            }
        }
        drop(guard);
        events.extend(raw.into_iter().filter_map(|ev| self.absorb(ev)));
        events
    }

    /// Close a connection after a last attempt to flush its queue. No `Closed`
    /// event is reported for a locally closed connection.
    pub fn close(&self, conn: ConnectionId) {
        if let Some(c) = self.conns.borrow_mut().get_mut(&conn) {
            if let Err(reason) = c.flush(conn) {
                debug!(%conn, "final flush failed: {}", reason);
            }
        }
        if self.teardown(conn) {
            info!(%conn, "connection closed");
        }
    }

    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.conns.borrow().contains_key(&conn)
    }

    pub fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.conns.borrow().get(&conn).and_then(|c| c.peer)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }

    fn absorb(&self, ev: IoEvent) -> Option<TransportEvent> {
        match ev {
            IoEvent::Opened {
                conn,
                inbound,
                peer,
                writer,
                reader,
            } => {
                let mut conns = self.conns.borrow_mut();
                let c = if inbound {
                    conns.entry(conn).or_insert_with(Connection::pending)
                } else if let Some(c) = conns.get_mut(&conn) {
                    c
                } else {
                    // Closed locally while the connect was in flight.
                    reader.abort();
                    return None;
                };
                c.writer = Some(writer);
                c.reader = Some(reader);
                c.peer = peer;
                info!(%conn, ?peer, inbound, "connection established");
                Some(TransportEvent::Connected(conn))
            }
            IoEvent::ConnectFailed { conn, error } => {
                warn!(%conn, "connect failed: {}", error);
                self.teardown(conn).then_some(TransportEvent::Closed(conn))
            }
            IoEvent::Data { conn, parts } => self
                .is_open(conn)
                .then_some(TransportEvent::Message(conn, parts)),
            IoEvent::Closed { conn, reason } => {
                match reason {
                    Some(reason) => warn!(%conn, "recv failed ({}), assuming client disconnected", reason),
                    None => info!(%conn, "peer closed connection"),
                }
                self.teardown(conn).then_some(TransportEvent::Closed(conn))
            }
        }
    }

    fn teardown(&self, conn: ConnectionId) -> bool {
        match self.conns.borrow_mut().remove(&conn) {
            Some(mut c) => {
                c.shutdown();
                true
            }
            None => false,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some((_, task)) = self.listener.get_mut().take() {
            task.abort();
        }
        for c in self.conns.get_mut().values_mut() {
            c.shutdown();
        }
    }
}

/// Puts the event receiver back even if the polling future is dropped mid-wait.
struct ReceiverGuard<'a> {
    slot: &'a RefCell<Option<mpsc::UnboundedReceiver<IoEvent>>>,
    rx: Option<mpsc::UnboundedReceiver<IoEvent>>,
}

impl Drop for ReceiverGuard<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.slot.borrow_mut() = Some(rx);
        }
    }
}

/// Split a fresh stream, start its reader and hand the write half to the loop.
fn start_connection(
    conn: ConnectionId,
    stream: TcpStream,
    inbound: bool,
    tx: &mpsc::UnboundedSender<IoEvent>,
) -> bool {
    let _ = stream.set_nodelay(true);
    let peer = stream.peer_addr().ok();
    let (read_half, writer) = stream.into_split();
    // The reader waits for `start` so its first message cannot overtake `Opened`.
    let (start_tx, start_rx) = oneshot::channel();
    let reader = tokio::spawn(read_loop(conn, read_half, tx.clone(), start_rx));
    if tx
        .send(IoEvent::Opened {
            conn,
            inbound,
            peer,
            writer,
            reader,
        })
        .is_err()
    {
        return false;
    }
    let _ = start_tx.send(());
    true
}

async fn read_loop(
    conn: ConnectionId,
    mut socket: OwnedReadHalf,
    tx: mpsc::UnboundedSender<IoEvent>,
    start: oneshot::Receiver<()>,
) {
    if start.await.is_err() {
        return;
    }
    let mut frames = FrameReader::new();
    let reason = loop {
        match socket.read_buf(frames.buffer_mut()).await {
            Ok(0) => break None,
            Ok(_) => {
                while let Some(next) = frames.next_message() {
                    match next {
                        Ok(parts) => {
                            if tx.send(IoEvent::Data { conn, parts }).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(%conn, "dropping data: {}", e),
                    }
                }
            }
            Err(e) => break Some(e.to_string()),
        }
    };
    let _ = tx.send(IoEvent::Closed { conn, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Poll until `pred` matches an event or two seconds pass.
    async fn poll_until(
        t: &Transport,
        mut pred: impl FnMut(&TransportEvent) -> bool,
    ) -> Option<TransportEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            t.flush();
            for ev in t.poll(Duration::from_millis(20)).await {
                if pred(&ev) {
                    return Some(ev);
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn ephemeral_port_reported() {
        let t = Transport::new();
        let addr = t.listen("127.0.0.1", None).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(t.local_addr(), Some(addr));
    }

    #[tokio::test]
    async fn message_crosses_connection() {
        let server = Transport::new();
        let addr = server.listen("127.0.0.1", None).await.unwrap();
        let client = Transport::new();
        let conn = client.connect(&addr.to_string());

        // Queued before the connect completes; must still be delivered.
        let big = Bytes::from(vec![42u8; 300_000]);
        client
            .send(conn, &[Bytes::from_static(b"hdr"), big.clone()])
            .unwrap();

        let connected = poll_until(&client, |e| matches!(e, TransportEvent::Connected(c) if *c == conn)).await;
        assert!(connected.is_some());

        let mut got = None;
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.is_none() && Instant::now() < deadline {
            client.flush();
            client.poll(Duration::from_millis(1)).await;
            for ev in server.poll(Duration::from_millis(10)).await {
                if let TransportEvent::Message(_, parts) = ev {
                    got = Some(parts);
                }
            }
        }
        let parts = got.expect("message not delivered");
        assert_eq!(parts.len(), 2);
        assert_eq!(&parts[0][..], b"hdr");
        assert_eq!(parts[1], big);
        assert!(!client.has_pending_writes());
    }

    #[tokio::test]
    async fn peer_close_reported() {
        let server = Transport::new();
        let addr = server.listen("127.0.0.1", None).await.unwrap();
        let client = Transport::new();
        let conn = client.connect(&addr.to_string());
        poll_until(&client, |e| matches!(e, TransportEvent::Connected(_)))
            .await
            .unwrap();
        let accepted = match poll_until(&server, |e| matches!(e, TransportEvent::Connected(_))).await {
            Some(TransportEvent::Connected(c)) => c,
            other => panic!("expected accept, got {:?}", other),
        };

        server.close(accepted);
        assert!(!server.is_open(accepted));
        let closed = poll_until(&client, |e| matches!(e, TransportEvent::Closed(c) if *c == conn)).await;
        assert!(closed.is_some());
        assert!(!client.is_open(conn));
    }

    #[tokio::test]
    async fn connect_refused_reported() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = Transport::new();
        let conn = client.connect(&format!("127.0.0.1:{}", port));
        let closed = poll_until(&client, |e| matches!(e, TransportEvent::Closed(c) if *c == conn)).await;
        assert!(closed.is_some());
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let t = Transport::new();
        let err = t
            .send(ConnectionId(99), &[Bytes::from_static(b"x")])
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownConnection(_)));
    }
}
