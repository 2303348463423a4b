//! Physical connections to a single Tarantool instance.
//!
//! This module provides:
//! - `Connection`: the object-safe interface the pool and streams build on
//! - `Dialer`: how the pool opens new connections
//! - `TcpConnection`: the TCP transport (greeting, auth, framing, dispatch)
//!
//! A `TcpConnection` never reconnects by itself. Once the socket fails it is
//! closed for good and reports a `Closed` event; repairing it is up to the
//! owner (see `multi::ConnectionPool`).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::auth::{scramble, Greeting, GREETING_SIZE};
use super::msgpack::{decode_uint, decode_value, uint_width};
use super::protocol::*;
use super::response::{map_entries, Response, ResponseFuture, ResponseSender};
use crate::error::{Error, Result};

/// Shared handle to a physical connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// Whether two handles refer to the same physical connection.
pub fn same_connection(a: &ConnectionRef, b: &ConnectionRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ============================================================================
// Lifecycle Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEventKind {
    Connected,
    Closed,
}

/// Connection lifecycle change, delivered through `ConnectOptions::notify`.
#[derive(Debug, Clone)]
pub struct ConnEvent {
    pub conn: ConnectionRef,
    pub kind: ConnEventKind,
    pub when: Instant,
}

/// Send `event` without blocking; a full channel drops it.
pub(crate) fn emit_event(notify: &Option<mpsc::Sender<ConnEvent>>, event: ConnEvent) {
    if let Some(notify) = notify {
        if let Err(err) = notify.try_send(event) {
            warn!("dropping connection event: {}", err);
        }
    }
}

// ============================================================================
// Watchers
// ============================================================================

/// A change of a watched key.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: String,
    /// New value, `None` when the key is unset
    pub value: Option<Value>,
}

pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Handle of a registered watcher.
pub trait Watcher: Send + Sync {
    /// Stop receiving events. Safe to call more than once.
    fn unregister(&self);
}

// ============================================================================
// Connection Interface
// ============================================================================

/// A single physical connection.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Address this connection was dialed with.
    fn addr(&self) -> &str;

    /// Established and usable at the moment.
    fn connected_now(&self) -> bool;

    /// Closed for good.
    fn closed_now(&self) -> bool;

    fn close(&self) -> Result<()>;

    /// Send a request, tagged with `stream_id` (0 for none).
    fn send(&self, request: Request, stream_id: u64) -> ResponseFuture;

    /// Per-request timeout from the connection options.
    fn configured_timeout(&self) -> Duration;

    /// Allocate a stream id unique on this connection.
    fn next_stream_id(&self) -> u64;

    fn watch(&self, key: &str, callback: WatchCallback) -> Result<Box<dyn Watcher>> {
        let _ = (key, callback);
        Err(Error::Unsupported("watchers are not supported by this connection"))
    }
}

// ============================================================================
// Connection Options
// ============================================================================

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Options used to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Per-request timeout (zero = wait forever)
    pub timeout: Duration,
    /// Bound on TCP connect, greeting and authentication
    pub connect_timeout: Duration,
    /// User name (empty = guest, no authentication)
    pub user: String,
    /// Password for `user`
    pub pass: String,
    /// Receives lifecycle events
    pub notify: Option<mpsc::Sender<ConnEvent>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user: String::new(),
            pass: String::new(),
            notify: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn credentials(mut self, user: &str, pass: &str) -> Self {
        self.user = user.to_string();
        self.pass = pass.to_string();
        self
    }

    pub fn notify(mut self, notify: mpsc::Sender<ConnEvent>) -> Self {
        self.notify = Some(notify);
        self
    }
}

// ============================================================================
// Dialer
// ============================================================================

/// Opens physical connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str, opts: &ConnectOptions) -> Result<ConnectionRef>;
}

/// Dials `TcpConnection`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, opts: &ConnectOptions) -> Result<ConnectionRef> {
        let conn: ConnectionRef = TcpConnection::connect(addr, opts.clone()).await?;
        Ok(conn)
    }
}

// ============================================================================
// TCP Connection
// ============================================================================

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// A connection to one Tarantool instance over TCP.
pub struct TcpConnection {
    addr: String,
    opts: ConnectOptions,
    greeting: Greeting,
    state: AtomicU8,
    next_sync: AtomicU64,
    next_stream: AtomicU64,
    /// Requests waiting for a response, by sync
    pending: Mutex<HashMap<u64, ResponseSender>>,
    /// Encoded frames for the writer task
    outbound: mpsc::UnboundedSender<BytesMut>,
    watchers: Mutex<HashMap<String, Vec<(u64, WatchCallback)>>>,
    next_watcher: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Connect, read the greeting and authenticate if a user is set.
    pub async fn connect(addr: &str, opts: ConnectOptions) -> Result<Arc<Self>> {
        let (stream, greeting) = with_timeout(opts.connect_timeout, handshake(addr, &opts)).await?;
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let conn = Arc::new_cyclic(|this| TcpConnection {
            addr: addr.to_string(),
            opts,
            greeting,
            state: AtomicU8::new(STATE_CONNECTING),
            next_sync: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            watchers: Mutex::new(HashMap::new()),
            next_watcher: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        });

        let reader = tokio::spawn(read_loop(Arc::downgrade(&conn), BufReader::new(read_half)));
        let writer = tokio::spawn(write_loop(
            Arc::downgrade(&conn),
            BufWriter::new(write_half),
            outbound_rx,
        ));
        conn.tasks.lock().extend([reader, writer]);

        // The reader may already have failed on an immediately closed socket.
        if conn
            .state
            .compare_exchange(STATE_CONNECTING, STATE_CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            for task in conn.tasks.lock().drain(..) {
                task.abort();
            }
            return Err(Error::ConnectionClosed(conn.addr.clone()));
        }
        debug!(addr = %conn.addr, version = %conn.greeting.version, "connected");
        conn.emit(ConnEventKind::Connected);

        Ok(conn)
    }

    /// The server greeting received on connect.
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Number of requests waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    fn emit(&self, kind: ConnEventKind) {
        if let Some(conn) = self.this.upgrade() {
            let conn: ConnectionRef = conn;
            emit_event(
                &self.opts.notify,
                ConnEvent {
                    conn,
                    kind,
                    when: Instant::now(),
                },
            );
        }
    }

    fn next_sync(&self) -> u64 {
        self.next_sync.fetch_add(1, Ordering::Relaxed)
    }

    /// Close the connection and fail everything still in flight.
    fn teardown(&self, reason: &Error) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        debug!(addr = %self.addr, reason = %reason, "connection closed");

        let pending: Vec<ResponseSender> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(Error::ConnectionClosed(self.addr.clone())));
        }
        // Dropping the socket halves with the tasks closes the socket.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.emit(ConnEventKind::Closed);
    }

    /// Route one incoming frame.
    fn dispatch(&self, header: Value, body: Option<Value>) -> Result<()> {
        let code = header
            .as_map()
            .and_then(|entries| entries.iter().find(|(k, _)| k.as_u64() == Some(KEY_CODE)))
            .and_then(|(_, v)| v.as_u64());

        if code == Some(RequestCode::Event.as_u64()) {
            return self.handle_event(body);
        }

        let resp = Response::decode(header, body)?;
        match self.pending.lock().remove(&resp.sync) {
            Some(tx) => {
                let _ = tx.send(resp.into_result());
            }
            None => trace!(addr = %self.addr, sync = resp.sync, "response for unknown request"),
        }
        Ok(())
    }

    fn handle_event(&self, body: Option<Value>) -> Result<()> {
        let mut key = None;
        let mut value = None;
        if let Some(body) = body {
            for (k, v) in map_entries(body)? {
                match k {
                    KEY_EVENT_KEY => key = v.as_str().map(str::to_string),
                    KEY_EVENT_DATA => value = Some(v),
                    _ => {}
                }
            }
        }
        let key = key.ok_or_else(|| Error::Protocol("event without key".to_string()))?;

        let callbacks: Vec<WatchCallback> = self
            .watchers
            .lock()
            .get(&key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        if callbacks.is_empty() {
            return Ok(());
        }

        for callback in &callbacks {
            let event = WatchEvent {
                key: key.clone(),
                value: value.clone(),
            };
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(addr = %self.addr, key = %key, "watch callback panicked");
            }
        }

        // Acknowledge so the server sends the next change.
        self.send_watch(RequestCode::Watch, &key)
    }

    fn send_watch(&self, code: RequestCode, key: &str) -> Result<()> {
        let body = encode_watch_body(key)?;
        let frame = encode_frame(code, self.next_sync(), 0, &body)?;
        self.outbound
            .send(frame)
            .map_err(|_| Error::ConnectionClosed(self.addr.clone()))
    }
}

impl Connection for TcpConnection {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn connected_now(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    fn closed_now(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    fn close(&self) -> Result<()> {
        if self.closed_now() {
            return Err(Error::ConnectionClosed(self.addr.clone()));
        }
        self.teardown(&Error::Protocol("closed by client".to_string()));
        Ok(())
    }

    fn send(&self, request: Request, stream_id: u64) -> ResponseFuture {
        if !self.connected_now() {
            return ResponseFuture::failed(Error::ConnectionClosed(self.addr.clone()));
        }

        let sync = self.next_sync();
        let frame = match request.encode(sync, stream_id) {
            Ok(frame) => frame,
            Err(err) => return ResponseFuture::failed(err),
        };

        let (tx, fut) = ResponseFuture::pending();
        self.pending.lock().insert(sync, tx);

        // Teardown may have drained `pending` before the insert above.
        if self.outbound.send(frame).is_err() || self.closed_now() {
            if let Some(tx) = self.pending.lock().remove(&sync) {
                let _ = tx.send(Err(Error::ConnectionClosed(self.addr.clone())));
            }
        }

        let this = self.this.clone();
        fut.with_timeout(self.opts.timeout).on_timeout(move || {
            if let Some(conn) = this.upgrade() {
                conn.pending.lock().remove(&sync);
            }
        })
    }

    fn configured_timeout(&self) -> Duration {
        self.opts.timeout
    }

    fn next_stream_id(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }

    fn watch(&self, key: &str, callback: WatchCallback) -> Result<Box<dyn Watcher>> {
        if !self.connected_now() {
            return Err(Error::ConnectionClosed(self.addr.clone()));
        }

        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut watchers = self.watchers.lock();
            let list = watchers.entry(key.to_string()).or_default();
            list.push((id, callback));
            list.len() == 1
        };
        if first {
            self.send_watch(RequestCode::Watch, key)?;
        }

        Ok(Box::new(TcpWatcher {
            key: key.to_string(),
            id,
            conn: self.this.clone(),
        }))
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("addr", &self.addr)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}

struct TcpWatcher {
    key: String,
    id: u64,
    conn: Weak<TcpConnection>,
}

impl Watcher for TcpWatcher {
    fn unregister(&self) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };

        let last = {
            let mut watchers = conn.watchers.lock();
            match watchers.get_mut(&self.key) {
                Some(list) => {
                    list.retain(|(id, _)| *id != self.id);
                    if list.is_empty() {
                        watchers.remove(&self.key);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last && conn.connected_now() {
            if let Err(err) = conn.send_watch(RequestCode::Unwatch, &self.key) {
                debug!(addr = %conn.addr, key = %self.key, "unwatch failed: {}", err);
            }
        }
    }
}

// ============================================================================
// Socket I/O
// ============================================================================

async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout)?
}

async fn handshake(addr: &str, opts: &ConnectOptions) -> Result<(TcpStream, Greeting)> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let mut raw = [0u8; GREETING_SIZE];
    stream.read_exact(&mut raw).await?;
    let greeting = Greeting::parse(&raw)?;

    if !opts.user.is_empty() {
        let scramble = scramble(&greeting.salt, &opts.pass)?;
        let body = encode_auth_body(&opts.user, &scramble)?;
        let frame = encode_frame(RequestCode::Auth, 0, 0, &body)?;
        stream.write_all(&frame).await?;

        let (header, body) = read_frame(&mut stream).await?;
        Response::decode(header, body)?.into_result()?;
        debug!(addr = %addr, user = %opts.user, "authenticated");
    }

    Ok((stream, greeting))
}

/// Frame lengths are uint32 on the wire.
pub const MAX_FRAME_SIZE: u64 = u32::MAX as u64;

/// Read one frame and split it into header and optional body.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Value, Option<Value>)> {
    let marker = reader.read_u8().await?;
    let width = uint_width(marker)
        .ok_or_else(|| Error::Protocol(format!("Invalid frame length marker {:#x}", marker)))?;
    let mut payload = [0u8; 8];
    reader.read_exact(&mut payload[..width]).await?;
    let len = decode_uint(marker, &payload[..width])
        .ok_or_else(|| Error::Protocol("Invalid frame length".to_string()))?;

    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("Frame length {} exceeds {}", len, MAX_FRAME_SIZE)));
    }

    // The prefix is untrusted; grow with the bytes received.
    let mut buf = Vec::with_capacity(len.min(64 * 1024) as usize);
    (&mut *reader).take(len).read_to_end(&mut buf).await?;
    if (buf.len() as u64) < len {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    let mut input = &buf[..];
    let header = decode_value(&mut input)?;
    let body = if input.is_empty() {
        None
    } else {
        Some(decode_value(&mut input)?)
    };
    Ok((header, body))
}

/// Tears the connection down however the reader task ends, panics included.
struct ReaderGuard(Weak<TcpConnection>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.0.upgrade() {
            conn.teardown(&Error::Protocol("reader stopped".to_string()));
        }
    }
}

async fn read_loop(conn: Weak<TcpConnection>, mut reader: BufReader<OwnedReadHalf>) {
    let _guard = ReaderGuard(conn.clone());
    let reason = loop {
        let frame = read_frame(&mut reader).await;
        // Every handle is gone: the connection is being dropped.
        let Some(this) = conn.upgrade() else {
            return;
        };
        if let Err(err) = frame.and_then(|(header, body)| this.dispatch(header, body)) {
            break err;
        }
    };
    if let Some(this) = conn.upgrade() {
        this.teardown(&reason);
    }
}

async fn write_loop(
    conn: Weak<TcpConnection>,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut outbound: mpsc::UnboundedReceiver<BytesMut>,
) {
    if let Err(err) = write_frames(&mut writer, &mut outbound).await {
        if let Some(conn) = conn.upgrade() {
            conn.teardown(&Error::Io(err));
        }
    }
}

async fn write_frames(
    writer: &mut BufWriter<OwnedWriteHalf>,
    outbound: &mut mpsc::UnboundedReceiver<BytesMut>,
) -> std::io::Result<()> {
    while let Some(frame) = outbound.recv().await {
        writer.write_all(&frame).await?;
        // Batch whatever is already queued before flushing.
        while let Ok(frame) = outbound.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}
