//! In-memory connections and dialers for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::iproto::connection::emit_event;
use crate::iproto::{
    ConnEvent, ConnEventKind, ConnectOptions, Connection, ConnectionRef, Dialer, Request,
    RequestCode, Response, ResponseFuture,
};

// ============================================================================
// Mock Connection
// ============================================================================

/// A request recorded by `MockConnection`.
#[derive(Debug, Clone)]
pub(crate) struct SentRequest {
    pub code: RequestCode,
    pub stream_id: u64,
    pub request: Request,
}

type Responder = Arc<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// A connection that records requests and answers them locally.
pub(crate) struct MockConnection {
    addr: String,
    closed: AtomicBool,
    next_stream: AtomicU64,
    close_calls: AtomicUsize,
    sent: Mutex<Vec<SentRequest>>,
    responder: Mutex<Option<Responder>>,
    notify: Option<mpsc::Sender<ConnEvent>>,
    this: Weak<MockConnection>,
}

impl MockConnection {
    pub fn connected(addr: &str) -> Arc<Self> {
        Self::with_notify(addr, None)
    }

    /// A connection reporting lifecycle events to `notify`.
    pub fn with_notify(addr: &str, notify: Option<mpsc::Sender<ConnEvent>>) -> Arc<Self> {
        Arc::new_cyclic(|this| MockConnection {
            addr: addr.to_string(),
            closed: AtomicBool::new(false),
            next_stream: AtomicU64::new(1),
            close_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            notify,
            this: this.clone(),
        })
    }

    /// Answer every request with `responder` instead of an empty response.
    pub fn respond_with(&self, responder: impl Fn(&Request) -> Result<Response> + Send + Sync + 'static) {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    /// Number of `close` calls, including failed ones.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Simulate the server dropping the connection.
    pub fn drop_link(&self) {
        self.shutdown();
    }

    /// Mark the connection closed without reporting it, as if the event was
    /// lost to a full notification channel.
    pub fn close_unreported(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Deliver another `Closed` event, as a late duplicate would arrive.
    pub fn replay_closed(&self) {
        self.emit(ConnEventKind::Closed);
    }

    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(ConnEventKind::Closed);
        true
    }

    fn emit(&self, kind: ConnEventKind) {
        if let Some(conn) = self.this.upgrade() {
            let conn: ConnectionRef = conn;
            emit_event(
                &self.notify,
                ConnEvent {
                    conn,
                    kind,
                    when: Instant::now(),
                },
            );
        }
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("addr", &self.addr)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection for MockConnection {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn connected_now(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn closed_now(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.shutdown() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed(self.addr.clone()))
        }
    }

    fn send(&self, request: Request, stream_id: u64) -> ResponseFuture {
        if self.closed_now() {
            return ResponseFuture::failed(Error::ConnectionClosed(self.addr.clone()));
        }
        self.sent.lock().push(SentRequest {
            code: request.code(),
            stream_id,
            request: request.clone(),
        });

        let responder = self.responder.lock().clone();
        match responder {
            Some(responder) => ResponseFuture::ready(responder(&request)),
            None => ResponseFuture::ready(Ok(Response::default())),
        }
    }

    fn configured_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn next_stream_id(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// Mock Dialer
// ============================================================================

/// A dialer producing `MockConnection`s.
///
/// Every connection answers call17 requests with the configured discovery
/// list, wrapped the way a stored function returning an array would be.
#[derive(Default)]
pub(crate) struct MockDialer {
    unreachable: Mutex<HashSet<String>>,
    dials: Mutex<Vec<String>>,
    conns: Mutex<Vec<Arc<MockConnection>>>,
    discovery: Arc<Mutex<Option<Vec<String>>>>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unreachable(&self, addr: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    /// Addresses returned by the discovery function.
    pub fn set_discovery(&self, addrs: &[&str]) {
        *self.discovery.lock() = Some(addrs.iter().map(|a| a.to_string()).collect());
    }

    /// Every dial attempt in order, successful or not.
    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().clone()
    }

    pub fn dial_count(&self, addr: &str) -> usize {
        self.dials.lock().iter().filter(|a| *a == addr).count()
    }

    /// All connections created for `addr`, oldest first.
    pub fn connections(&self, addr: &str) -> Vec<Arc<MockConnection>> {
        self.conns
            .lock()
            .iter()
            .filter(|c| c.addr == addr)
            .cloned()
            .collect()
    }

    pub fn latest(&self, addr: &str) -> Option<Arc<MockConnection>> {
        self.connections(addr).pop()
    }

    /// Connections that were created and are still open.
    pub fn open_connections(&self) -> Vec<Arc<MockConnection>> {
        self.conns
            .lock()
            .iter()
            .filter(|c| !c.closed_now())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, addr: &str, opts: &ConnectOptions) -> Result<ConnectionRef> {
        self.dials.lock().push(addr.to_string());
        if self.unreachable.lock().contains(addr) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} is unreachable", addr),
            )));
        }

        let conn = MockConnection::with_notify(addr, opts.notify.clone());
        let discovery = Arc::clone(&self.discovery);
        conn.respond_with(move |request| match request {
            Request::Call17 { .. } => match discovery.lock().clone() {
                Some(addrs) => Ok(Response {
                    data: vec![Value::Array(addrs.into_iter().map(Value::from).collect())],
                    ..Default::default()
                }),
                None => Err(Error::Server {
                    code: 33,
                    message: "Procedure is not defined".to_string(),
                }),
            },
            _ => Ok(Response::default()),
        });
        conn.emit(ConnEventKind::Connected);

        self.conns.lock().push(Arc::clone(&conn));
        let conn: ConnectionRef = conn;
        Ok(conn)
    }
}
