//! Failover pool over several Tarantool instances.
//!
//! The pool keeps one connection per tracked address and always serves
//! requests from the first connected one, in configured order. A background
//! task repairs the pool:
//! - redials a connection as soon as it reports `Closed`
//! - redials every address without a live connection on each health check
//! - optionally refreshes the address list from a stored function
//!
//! Selection never waits for repairs. When nothing is connected the last
//! known connection is returned and its error reaches the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rmpv::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::options::PoolOptions;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::iproto::{
    same_connection, ConnEvent, ConnEventKind, ConnectOptions, Connection, ConnectionRef, Dialer,
    Prepared, Request, ResponseFuture, Stream, TcpDialer, WatchCallback, Watcher,
};

/// Notification slots per configured address.
const EVENTS_PER_ADDR: usize = 10;

const STATE_CONNECTED: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// Lifecycle of a pool. Once closed, a pool never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Connected,
    Closed,
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Address list and the connection installed for each address.
struct PoolShared {
    addrs: Vec<String>,
    pool: HashMap<String, ConnectionRef>,
}

struct PoolInner {
    dialer: Arc<dyn Dialer>,
    /// Connection options with the pool's event channel installed
    conn_opts: ConnectOptions,
    opts: PoolOptions,
    state: AtomicU8,
    shared: RwLock<PoolShared>,
    /// Last known connection, served when nothing is connected
    fallback: Mutex<Option<ConnectionRef>>,
    shutdown: watch::Sender<bool>,
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// First connected entry in address order, else the fallback.
    fn current(&self) -> Option<ConnectionRef> {
        let shared = self.shared.read();
        let mut last = None;
        for addr in &shared.addrs {
            if let Some(conn) = shared.pool.get(addr) {
                if conn.connected_now() {
                    return Some(Arc::clone(conn));
                }
                last = Some(conn);
            }
        }

        let mut fallback = self.fallback.lock();
        if let Some(conn) = last {
            *fallback = Some(Arc::clone(conn));
        }
        fallback.clone()
    }

    /// Whether `conn` is the entry installed for its address.
    fn is_installed(&self, conn: &ConnectionRef) -> bool {
        self.shared
            .read()
            .pool
            .get(conn.addr())
            .map(|installed| same_connection(installed, conn))
            .unwrap_or(false)
    }

    /// Install a freshly dialed connection, unless the pool was closed while
    /// dialing.
    fn install(&self, addr: &str, conn: ConnectionRef) {
        let replaced = {
            let mut shared = self.shared.write();
            if self.is_closed() {
                None
            } else {
                Some(shared.pool.insert(addr.to_string(), Arc::clone(&conn)))
            }
        };

        match replaced {
            None => {
                let _ = conn.close();
            }
            Some(Some(old)) if !old.closed_now() => {
                let _ = old.close();
            }
            Some(_) => {}
        }
    }

    /// Remove the entry for `addr` if it is still `conn`.
    fn evict(&self, addr: &str, conn: &ConnectionRef) {
        let mut shared = self.shared.write();
        if shared
            .pool
            .get(addr)
            .map(|installed| same_connection(installed, conn))
            .unwrap_or(false)
        {
            shared.pool.remove(addr);
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Redial a connection that reported `Closed`.
    async fn handle_event(&self, event: ConnEvent) {
        if event.kind != ConnEventKind::Closed || !event.conn.closed_now() {
            return;
        }
        // Events for replaced or evicted connections are stale.
        if !self.is_installed(&event.conn) {
            trace!(addr = %event.conn.addr(), "ignoring close of untracked connection");
            return;
        }

        let addr = event.conn.addr().to_string();
        match self.dialer.dial(&addr, &self.conn_opts).await {
            Ok(conn) => {
                debug!(addr = %addr, "reconnected");
                self.install(&addr, conn);
            }
            Err(err) => {
                warn!(addr = %addr, error = %err, "reconnect failed, evicting");
                self.evict(&addr, &event.conn);
            }
        }
    }

    /// Dial every tracked address without a live connection.
    async fn check(&self) {
        let missing: Vec<String> = {
            let shared = self.shared.read();
            shared
                .addrs
                .iter()
                .filter(|addr| {
                    shared
                        .pool
                        .get(addr.as_str())
                        .map(|conn| conn.closed_now())
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        for addr in missing {
            if self.is_closed() {
                return;
            }
            match self.dialer.dial(&addr, &self.conn_opts).await {
                Ok(conn) => {
                    debug!(addr = %addr, "health check reconnected");
                    self.install(&addr, conn);
                }
                Err(err) => trace!(addr = %addr, error = %err, "health check dial failed"),
            }
        }
    }

    /// Refresh the address list from the discovery function.
    async fn discover(&self, function: &str) {
        match self.fetch_addrs(function).await {
            Ok(Some(addrs)) => self.apply_addrs(addrs).await,
            Ok(None) => trace!(function = %function, "discovery returned no addresses"),
            Err(err) => debug!(function = %function, error = %err, "discovery failed"),
        }
    }

    async fn fetch_addrs(&self, function: &str) -> Result<Option<Vec<String>>> {
        let conn = self.current().ok_or(Error::NoActiveConnection)?;
        let resp = conn
            .send(Request::call17(function, Value::Array(Vec::new())), 0)
            .await?;
        let nodes: Vec<Vec<String>> = resp
            .decode_typed()
            .map_err(|err| Error::Discovery(err.to_string()))?;

        let Some(found) = nodes.into_iter().next() else {
            return Ok(None);
        };
        let mut addrs: Vec<String> = Vec::with_capacity(found.len());
        for addr in found {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        Ok(if addrs.is_empty() { None } else { Some(addrs) })
    }

    async fn apply_addrs(&self, addrs: Vec<String>) {
        let tracked = self.shared.read().addrs.clone();
        if tracked == addrs {
            return;
        }

        for addr in addrs.iter().filter(|addr| !tracked.contains(addr)) {
            if self.is_closed() {
                return;
            }
            match self.dialer.dial(addr, &self.conn_opts).await {
                Ok(conn) => self.install(addr, conn),
                Err(err) => debug!(addr = %addr, error = %err, "discovered address unreachable"),
            }
        }

        for addr in tracked.iter().filter(|addr| !addrs.contains(addr)) {
            let removed = self.shared.write().pool.remove(addr);
            if let Some(conn) = removed {
                let _ = conn.close();
            }
        }

        info!(addrs = ?addrs, "address list updated");
        self.shared.write().addrs = addrs;
    }
}

enum Tick {
    Event(ConnEvent),
    Discovery,
    Check,
}

/// Background repair loop. Holds only a weak reference so that dropping the
/// pool stops it.
async fn maintain(
    pool: Weak<PoolInner>,
    mut events: mpsc::Receiver<ConnEvent>,
    mut shutdown: watch::Receiver<bool>,
    opts: PoolOptions,
) {
    let mut check = interval_at(Instant::now() + opts.check_timeout, opts.check_timeout);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut refresh = interval_at(
        Instant::now() + opts.discovery_interval,
        opts.discovery_interval,
    );
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let discovery = opts.discovery_function;

    loop {
        let tick = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => Tick::Event(event),
                None => break,
            },
            _ = refresh.tick(), if discovery.is_some() => Tick::Discovery,
            _ = check.tick() => Tick::Check,
        };

        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }
        match tick {
            Tick::Event(event) => pool.handle_event(event).await,
            Tick::Discovery => {
                if let Some(function) = discovery.as_deref() {
                    pool.discover(function).await;
                }
            }
            Tick::Check => pool.check().await,
        }
    }
    debug!("pool maintenance stopped");
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Connections to several instances with automatic failover.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Connect with a 1 s health check and no discovery.
    pub async fn connect<I, S>(addrs: I, conn_opts: ConnectOptions) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::connect_with_opts(addrs, conn_opts, PoolOptions::default()).await
    }

    pub async fn connect_with_opts<I, S>(
        addrs: I,
        conn_opts: ConnectOptions,
        opts: PoolOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::connect_with_dialer(Arc::new(TcpDialer), addrs, conn_opts, opts).await
    }

    /// Connect using `dialer` to open every connection.
    ///
    /// Dials all addresses up front and fails unless at least one of them is
    /// connected. Any `notify` sender in `conn_opts` is replaced by the
    /// pool's own.
    pub async fn connect_with_dialer<I, S>(
        dialer: Arc<dyn Dialer>,
        addrs: I,
        conn_opts: ConnectOptions,
        opts: PoolOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
        if addrs.is_empty() {
            return Err(Error::empty_addrs());
        }
        opts.validate()?;
        let opts = opts.normalized();

        let (events_tx, events_rx) = mpsc::channel(EVENTS_PER_ADDR * addrs.len());
        let conn_opts = conn_opts.notify(events_tx);

        // Warm-up
        let mut pool = HashMap::new();
        let mut fallback: Option<ConnectionRef> = None;
        let mut alive = false;
        for addr in &addrs {
            match dialer.dial(addr, &conn_opts).await {
                Ok(conn) => {
                    alive |= conn.connected_now();
                    if fallback.is_none() {
                        fallback = Some(Arc::clone(&conn));
                    }
                    pool.insert(addr.clone(), conn);
                }
                Err(err) => warn!(addr = %addr, error = %err, "initial connect failed"),
            }
        }
        if !alive {
            for conn in pool.values() {
                let _ = conn.close();
            }
            return Err(Error::NoActiveConnection);
        }
        info!(addrs = ?addrs, connected = pool.len(), "pool connected");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            dialer,
            conn_opts,
            opts: opts.clone(),
            state: AtomicU8::new(STATE_CONNECTED),
            shared: RwLock::new(PoolShared { addrs, pool }),
            fallback: Mutex::new(fallback),
            shutdown,
        });
        tokio::spawn(maintain(Arc::downgrade(&inner), events_rx, shutdown_rx, opts));

        Ok(Self { inner })
    }

    /// The connection requests are currently routed to.
    pub fn current_connection(&self) -> Result<ConnectionRef> {
        self.inner.current().ok_or(Error::NoActiveConnection)
    }

    pub fn state(&self) -> PoolState {
        if self.inner.is_closed() {
            PoolState::Closed
        } else {
            PoolState::Connected
        }
    }

    /// Snapshot of the tracked addresses.
    pub fn addrs(&self) -> Vec<String> {
        self.inner.shared.read().addrs.clone()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.opts
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addrs", &self.addrs())
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Connector for ConnectionPool {
    /// Route to the current connection. A request bound to a connection is
    /// sent on that connection, provided it is the one the pool tracks for
    /// its address.
    fn do_request(&self, request: Request) -> ResponseFuture {
        if let Some(bound) = request.bound_connection() {
            if !self.inner.is_installed(bound) {
                return ResponseFuture::failed(Error::BindingMismatch);
            }
            let bound = Arc::clone(bound);
            return bound.send(request, 0);
        }

        match self.inner.current() {
            Some(conn) => conn.send(request, 0),
            None => ResponseFuture::failed(Error::NoActiveConnection),
        }
    }

    fn connected_now(&self) -> bool {
        !self.inner.is_closed()
            && self
                .inner
                .current()
                .map(|conn| conn.connected_now())
                .unwrap_or(false)
    }

    /// Close every connection and stop maintenance for good.
    ///
    /// Returns the first error; the remaining connections are closed anyway.
    fn close(&self) -> Result<()> {
        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);

        let conns: Vec<ConnectionRef> = {
            let shared = self.inner.shared.read();
            shared.pool.values().cloned().collect()
        };
        let mut result = Ok(());
        for conn in conns {
            if let Err(err) = conn.close() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if let Some(fallback) = self.inner.fallback.lock().clone() {
            let _ = fallback.close();
        }

        info!("pool closed");
        result
    }

    fn configured_timeout(&self) -> Duration {
        self.inner
            .current()
            .map(|conn| conn.configured_timeout())
            .unwrap_or(self.inner.conn_opts.timeout)
    }

    fn new_stream(&self) -> Result<Stream> {
        Ok(Stream::new(self.current_connection()?))
    }

    /// Always fails: watchers must outlive failovers, which this pool does
    /// not track.
    fn new_watcher(&self, _key: &str, _callback: WatchCallback) -> Result<Box<dyn Watcher>> {
        Err(Error::Unsupported(
            "watchers are not supported by ConnectionPool, use a pooled connection type",
        ))
    }

    async fn new_prepared(&self, sql: &str) -> Result<Prepared> {
        let conn = self.current_connection()?;
        conn.new_prepared(sql).await
    }
}
