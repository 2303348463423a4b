//! Failover across several Tarantool instances.
//!
//! - `options`: Pool maintenance options
//! - `pool`: `ConnectionPool` and its background repair loop

pub mod options;
pub mod pool;


pub use options::{PoolOptions, DEFAULT_CHECK_TIMEOUT, DEFAULT_DISCOVERY_INTERVAL};
pub use pool::{ConnectionPool, PoolState};
