//! Multi-node Tarantool client with failover.
//!
//! `ConnectionPool` keeps one connection per configured address, routes
//! every request to the first connected one and repairs the set in the
//! background. Interactive transactions run over a `Stream`, which stays on
//! the connection it was opened on.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tarantool_multi::{ConnectOptions, ConnectionPool, Connector, IsolationLevel, PoolOptions};
//!
//! # async fn run() -> tarantool_multi::Result<()> {
//! let opts = PoolOptions::new()
//!     .check_timeout(Duration::from_secs(1))
//!     .discovery_function("get_cluster_nodes");
//! let pool = ConnectionPool::connect_with_opts(
//!     ["10.0.0.1:3301", "10.0.0.2:3301"],
//!     ConnectOptions::new().credentials("app", "secret"),
//!     opts,
//! )
//! .await?;
//!
//! let stream = pool.new_stream()?;
//! stream.begin(IsolationLevel::ReadCommitted, Duration::from_secs(5)).await?;
//! stream.commit().await?;
//! pool.close()?;
//! # Ok(())
//! # }
//! ```

mod connector;
mod error;
pub mod iproto;
pub mod multi;

#[cfg(test)]
mod testing;

pub use connector::Connector;
pub use error::{Error, Result};
pub use iproto::{
    BeginRequest, ColumnMetaData, ConnEvent, ConnEventKind, ConnectOptions, Connection,
    ConnectionRef, Dialer, IsolationLevel, IteratorType, Prepared, Request, RequestCode, Response,
    ResponseFuture, SqlInfo, Stream, TcpConnection, TcpDialer, WatchCallback, WatchEvent, Watcher,
};
pub use multi::{ConnectionPool, PoolOptions, PoolState};
