//! Error types for the multi-node Tarantool client.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pool or connection configuration.
    #[error("{0}")]
    Config(String),

    /// Warm-up could not reach any of the configured addresses.
    #[error("no active connections")]
    NoActiveConnection,

    /// A request bound to one connection was routed through another.
    #[error("the passed connected request doesn't belong to the current connection or connection pool")]
    BindingMismatch,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("request timed out")]
    Timeout,

    #[error("request was canceled before a response arrived")]
    Canceled,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error response.
    #[error("server error {code:#x}: {message}")]
    Server { code: u32, message: String },

    #[error("msgpack encode error: {0}")]
    Encode(String),

    #[error("msgpack decode error: {0}")]
    Decode(String),

    #[error("cluster discovery failed: {0}")]
    Discovery(String),

    #[error("{0}")]
    Unsupported(&'static str),
}

impl Error {
    pub(crate) fn empty_addrs() -> Self {
        Error::Config("addrs should not be empty".to_string())
    }

    pub(crate) fn wrong_check_timeout() -> Self {
        Error::Config("wrong check timeout, must be greater than 0".to_string())
    }

    /// Whether the error was raised by the transport rather than by the
    /// server or by local validation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed(_)
                | Error::Timeout
                | Error::Canceled
                | Error::Protocol(_)
        )
    }
}

impl From<rmp::encode::ValueWriteError> for Error {
    fn from(err: rmp::encode::ValueWriteError) -> Self {
        Error::Encode(err.to_string())
    }
}

impl From<rmpv::decode::Error> for Error {
    fn from(err: rmpv::decode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<rmpv::ext::Error> for Error {
    fn from(err: rmpv::ext::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
