//! Streams and interactive transactions.
//!
//! A stream ties a sequence of requests to one physical connection and a
//! stream id. The server runs requests of a stream in order, and
//! Begin/Commit/Rollback sent over a stream delimit an interactive
//! transaction. Transaction control outside a stream is rejected by the
//! server, not locally.

use std::time::Duration;

use super::connection::{same_connection, Connection, ConnectionRef};
use super::msgpack::{encode_f64, encode_map_len, encode_uint};
use super::protocol::{timeout_seconds, Request, KEY_TIMEOUT, KEY_TXN_ISOLATION};
use super::response::{Response, ResponseFuture};
use crate::error::{Error, Result};

// ============================================================================
// Isolation Levels
// ============================================================================

/// Transaction isolation level negotiated by Begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Server default, serializable.
    #[default]
    Default = 0,
    /// Makes visible all transactions that started to commit.
    ReadCommitted = 1,
    /// Makes visible all transactions that finished the commit.
    ReadConfirmed = 2,
    /// If serializable becomes unreachable the transaction is marked as
    /// conflicted and can no longer be committed.
    BestEffort = 3,
}

impl IsolationLevel {
    pub fn as_u64(self) -> u64 {
        self as u8 as u64
    }
}

impl TryFrom<u64> for IsolationLevel {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(IsolationLevel::Default),
            1 => Ok(IsolationLevel::ReadCommitted),
            2 => Ok(IsolationLevel::ReadConfirmed),
            3 => Ok(IsolationLevel::BestEffort),
            other => Err(Error::Protocol(format!("unknown isolation level {}", other))),
        }
    }
}

// ============================================================================
// Transaction Control Bodies
// ============================================================================

/// Begin request with optional isolation level and timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeginRequest {
    pub isolation: IsolationLevel,
    /// Zero leaves the server's transaction timeout in place.
    pub timeout: Duration,
}

impl BeginRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Encode the Begin body.
///
/// Keys equal to their server-side defaults are left out, so the map holds
/// zero, one or two entries.
pub fn fill_begin(buf: &mut Vec<u8>, isolation: IsolationLevel, timeout: Duration) -> Result<()> {
    let has_timeout = !timeout.is_zero();
    let has_isolation = isolation != IsolationLevel::Default;

    let map_len = u32::from(has_timeout) + u32::from(has_isolation);
    encode_map_len(buf, map_len)?;

    if has_timeout {
        encode_uint(buf, KEY_TIMEOUT)?;
        encode_f64(buf, timeout_seconds(timeout))?;
    }

    if has_isolation {
        encode_uint(buf, KEY_TXN_ISOLATION)?;
        encode_uint(buf, isolation.as_u64())?;
    }

    Ok(())
}

/// Encode the Commit body (always empty).
pub fn fill_commit(buf: &mut Vec<u8>) -> Result<()> {
    encode_map_len(buf, 0)
}

/// Encode the Rollback body (always empty).
pub fn fill_rollback(buf: &mut Vec<u8>) -> Result<()> {
    encode_map_len(buf, 0)
}

// ============================================================================
// Stream
// ============================================================================

/// A stream bound to one physical connection.
#[derive(Debug, Clone)]
pub struct Stream {
    id: u64,
    conn: ConnectionRef,
}

impl Stream {
    /// Open a stream on `conn` with a freshly allocated id.
    pub fn new(conn: ConnectionRef) -> Self {
        let id = conn.next_stream_id();
        Self { id, conn }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection every request of this stream goes through.
    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }

    /// Send a request within the stream.
    ///
    /// A request bound to another connection fails immediately with
    /// `Error::BindingMismatch` and nothing is sent.
    pub fn do_request(&self, request: impl Into<Request>) -> ResponseFuture {
        let request = request.into();
        if let Some(bound) = request.bound_connection() {
            if !same_connection(bound, &self.conn) {
                return ResponseFuture::failed(Error::BindingMismatch);
            }
        }
        self.conn.send(request, self.id)
    }

    /// Begin a transaction with the given isolation level and timeout.
    pub async fn begin(&self, isolation: IsolationLevel, timeout: Duration) -> Result<Response> {
        self.do_request(BeginRequest::new().isolation(isolation).timeout(timeout))
            .await
    }

    pub async fn commit(&self) -> Result<Response> {
        self.do_request(Request::Commit).await
    }

    pub async fn rollback(&self) -> Result<Response> {
        self.do_request(Request::Rollback).await
    }
}
