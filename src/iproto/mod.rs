//! Tarantool binary protocol client.
//!
//! Architecture:
//! - `msgpack`: MessagePack encoding helpers and type classification
//! - `protocol`: Request codes, keys and request encoding
//! - `response`: Response decoding and `ResponseFuture`
//! - `stream`: Streams and Begin/Commit/Rollback encoding
//! - `prepared`: Server-side prepared statements
//! - `auth`: Greeting parsing and chap-sha1 scramble
//! - `connection`: The `Connection` interface and the TCP transport

pub mod msgpack;
pub mod protocol;
pub mod response;
pub mod stream;
pub mod prepared;
pub mod auth;
pub mod connection;


pub use connection::{
    same_connection, ConnEvent, ConnEventKind, ConnectOptions, Connection, ConnectionRef, Dialer,
    TcpConnection, TcpDialer, WatchCallback, WatchEvent, Watcher, DEFAULT_CONNECT_TIMEOUT,
};
pub use prepared::Prepared;
pub use protocol::{IteratorType, Request, RequestCode};
pub use response::{ColumnMetaData, Response, ResponseFuture, SqlInfo};
pub use stream::{BeginRequest, IsolationLevel, Stream};
