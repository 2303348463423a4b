//! Tarantool binary protocol (IPROTO) request encoding.
//!
//! Every request travels as a frame: a msgpack uint32 length followed by a
//! header map and a body map. Reference:
//! https://www.tarantool.io/en/doc/latest/reference/internals/box_protocol/

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use rmpv::Value;

use super::connection::{same_connection, ConnectionRef};
use super::msgpack::*;
use super::prepared::Prepared;
use super::stream::{fill_begin, fill_commit, fill_rollback, BeginRequest};
use crate::error::Result;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Header keys
pub const KEY_CODE: u64 = 0x00;
pub const KEY_SYNC: u64 = 0x01;
pub const KEY_SCHEMA_ID: u64 = 0x05;
pub const KEY_STREAM_ID: u64 = 0x0a;

/// Request body keys
pub const KEY_SPACE_NO: u64 = 0x10;
pub const KEY_INDEX_NO: u64 = 0x11;
pub const KEY_LIMIT: u64 = 0x12;
pub const KEY_OFFSET: u64 = 0x13;
pub const KEY_ITERATOR: u64 = 0x14;
pub const KEY_KEY: u64 = 0x20;
pub const KEY_TUPLE: u64 = 0x21;
pub const KEY_FUNCTION_NAME: u64 = 0x22;
pub const KEY_USER_NAME: u64 = 0x23;
pub const KEY_EXPRESSION: u64 = 0x27;
pub const KEY_DEF_TUPLE: u64 = 0x28;
pub const KEY_SQL_TEXT: u64 = 0x40;
pub const KEY_SQL_BIND: u64 = 0x41;
pub const KEY_STMT_ID: u64 = 0x43;
pub const KEY_TIMEOUT: u64 = 0x56;
pub const KEY_EVENT_KEY: u64 = 0x57;
pub const KEY_EVENT_DATA: u64 = 0x58;
pub const KEY_TXN_ISOLATION: u64 = 0x59;

/// Response body keys
pub const KEY_DATA: u64 = 0x30;
pub const KEY_ERROR_24: u64 = 0x31;
pub const KEY_METADATA: u64 = 0x32;
pub const KEY_BIND_METADATA: u64 = 0x33;
pub const KEY_BIND_COUNT: u64 = 0x34;
pub const KEY_SQL_INFO: u64 = 0x42;
pub const KEY_ERROR: u64 = 0x52;

/// Bit set in the response code of an error response.
pub const ERROR_CODE_BIT: u32 = 0x8000;

/// Request type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestCode {
    Ok = 0,
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Call16 = 6,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call17 = 10,
    Execute = 11,
    Prepare = 13,
    Begin = 14,
    Commit = 15,
    Rollback = 16,
    Ping = 64,
    Watch = 74,
    Unwatch = 75,
    Event = 76,
}

impl RequestCode {
    pub fn as_u64(self) -> u64 {
        self as u32 as u64
    }
}

/// Index iterator types accepted by select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

// ============================================================================
// Requests
// ============================================================================

/// A request to the server.
///
/// Spaces and indexes are addressed by numeric id. Tuples, keys, update
/// operations and call arguments are dynamic msgpack values, normally arrays.
#[derive(Debug, Clone)]
pub enum Request {
    Ping,
    Select {
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
        key: Value,
    },
    Insert {
        space: u32,
        tuple: Value,
    },
    Replace {
        space: u32,
        tuple: Value,
    },
    Delete {
        space: u32,
        index: u32,
        key: Value,
    },
    Update {
        space: u32,
        index: u32,
        key: Value,
        ops: Value,
    },
    Upsert {
        space: u32,
        tuple: Value,
        ops: Value,
    },
    /// Legacy call: the server converts results to an array of tuples.
    Call16 {
        function: String,
        args: Value,
    },
    /// Current call: results are returned as-is.
    Call17 {
        function: String,
        args: Value,
    },
    Eval {
        expr: String,
        args: Value,
    },
    Execute {
        sql: String,
        args: Value,
    },
    Prepare {
        sql: String,
    },
    ExecutePrepared {
        statement: Prepared,
        args: Value,
    },
    Unprepare {
        statement: Prepared,
    },
    Begin(BeginRequest),
    Commit,
    Rollback,
}

impl Request {
    pub fn select(space: u32, index: u32, offset: u32, limit: u32, iterator: IteratorType, key: Value) -> Self {
        Request::Select {
            space,
            index,
            offset,
            limit,
            iterator,
            key,
        }
    }

    pub fn insert(space: u32, tuple: Value) -> Self {
        Request::Insert { space, tuple }
    }

    pub fn replace(space: u32, tuple: Value) -> Self {
        Request::Replace { space, tuple }
    }

    pub fn delete(space: u32, index: u32, key: Value) -> Self {
        Request::Delete { space, index, key }
    }

    pub fn update(space: u32, index: u32, key: Value, ops: Value) -> Self {
        Request::Update {
            space,
            index,
            key,
            ops,
        }
    }

    pub fn upsert(space: u32, tuple: Value, ops: Value) -> Self {
        Request::Upsert { space, tuple, ops }
    }

    pub fn call16(function: &str, args: Value) -> Self {
        Request::Call16 {
            function: function.to_string(),
            args,
        }
    }

    pub fn call17(function: &str, args: Value) -> Self {
        Request::Call17 {
            function: function.to_string(),
            args,
        }
    }

    pub fn eval(expr: &str, args: Value) -> Self {
        Request::Eval {
            expr: expr.to_string(),
            args,
        }
    }

    pub fn execute(sql: &str, args: Value) -> Self {
        Request::Execute {
            sql: sql.to_string(),
            args,
        }
    }

    pub fn prepare(sql: &str) -> Self {
        Request::Prepare {
            sql: sql.to_string(),
        }
    }

    pub fn begin() -> BeginRequest {
        BeginRequest::new()
    }

    /// Request type code written into the header.
    pub fn code(&self) -> RequestCode {
        match self {
            Request::Ping => RequestCode::Ping,
            Request::Select { .. } => RequestCode::Select,
            Request::Insert { .. } => RequestCode::Insert,
            Request::Replace { .. } => RequestCode::Replace,
            Request::Delete { .. } => RequestCode::Delete,
            Request::Update { .. } => RequestCode::Update,
            Request::Upsert { .. } => RequestCode::Upsert,
            Request::Call16 { .. } => RequestCode::Call16,
            Request::Call17 { .. } => RequestCode::Call17,
            Request::Eval { .. } => RequestCode::Eval,
            Request::Execute { .. } | Request::ExecutePrepared { .. } => RequestCode::Execute,
            Request::Prepare { .. } | Request::Unprepare { .. } => RequestCode::Prepare,
            Request::Begin(_) => RequestCode::Begin,
            Request::Commit => RequestCode::Commit,
            Request::Rollback => RequestCode::Rollback,
        }
    }

    /// Connection this request must be executed on, if any.
    pub fn bound_connection(&self) -> Option<&ConnectionRef> {
        match self {
            Request::ExecutePrepared { statement, .. } | Request::Unprepare { statement } => {
                Some(statement.connection())
            }
            _ => None,
        }
    }

    /// Whether this request is bound to exactly `conn`.
    pub fn is_bound_to(&self, conn: &ConnectionRef) -> bool {
        self.bound_connection()
            .map(|bound| same_connection(bound, conn))
            .unwrap_or(false)
    }

    /// Encode the request body map into `buf`.
    pub fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Request::Ping => encode_map_len(buf, 0),
            Request::Select {
                space,
                index,
                offset,
                limit,
                iterator,
                key,
            } => {
                encode_map_len(buf, 6)?;
                put_uint_entry(buf, KEY_SPACE_NO, u64::from(*space))?;
                put_uint_entry(buf, KEY_INDEX_NO, u64::from(*index))?;
                put_uint_entry(buf, KEY_OFFSET, u64::from(*offset))?;
                put_uint_entry(buf, KEY_LIMIT, u64::from(*limit))?;
                put_uint_entry(buf, KEY_ITERATOR, *iterator as u64)?;
                put_value_entry(buf, KEY_KEY, key)
            }
            Request::Insert { space, tuple } | Request::Replace { space, tuple } => {
                encode_map_len(buf, 2)?;
                put_uint_entry(buf, KEY_SPACE_NO, u64::from(*space))?;
                put_value_entry(buf, KEY_TUPLE, tuple)
            }
            Request::Delete { space, index, key } => {
                encode_map_len(buf, 3)?;
                put_uint_entry(buf, KEY_SPACE_NO, u64::from(*space))?;
                put_uint_entry(buf, KEY_INDEX_NO, u64::from(*index))?;
                put_value_entry(buf, KEY_KEY, key)
            }
            Request::Update {
                space,
                index,
                key,
                ops,
            } => {
                encode_map_len(buf, 4)?;
                put_uint_entry(buf, KEY_SPACE_NO, u64::from(*space))?;
                put_uint_entry(buf, KEY_INDEX_NO, u64::from(*index))?;
                put_value_entry(buf, KEY_KEY, key)?;
                // Update operations travel under the tuple key.
                put_value_entry(buf, KEY_TUPLE, ops)
            }
            Request::Upsert { space, tuple, ops } => {
                encode_map_len(buf, 3)?;
                put_uint_entry(buf, KEY_SPACE_NO, u64::from(*space))?;
                put_value_entry(buf, KEY_TUPLE, tuple)?;
                put_value_entry(buf, KEY_DEF_TUPLE, ops)
            }
            Request::Call16 { function, args } | Request::Call17 { function, args } => {
                encode_map_len(buf, 2)?;
                put_str_entry(buf, KEY_FUNCTION_NAME, function)?;
                put_value_entry(buf, KEY_TUPLE, args)
            }
            Request::Eval { expr, args } => {
                encode_map_len(buf, 2)?;
                put_str_entry(buf, KEY_EXPRESSION, expr)?;
                put_value_entry(buf, KEY_TUPLE, args)
            }
            Request::Execute { sql, args } => {
                encode_map_len(buf, 2)?;
                put_str_entry(buf, KEY_SQL_TEXT, sql)?;
                put_value_entry(buf, KEY_SQL_BIND, args)
            }
            Request::Prepare { sql } => {
                encode_map_len(buf, 1)?;
                put_str_entry(buf, KEY_SQL_TEXT, sql)
            }
            Request::ExecutePrepared { statement, args } => {
                encode_map_len(buf, 2)?;
                put_uint_entry(buf, KEY_STMT_ID, statement.statement_id)?;
                put_value_entry(buf, KEY_SQL_BIND, args)
            }
            Request::Unprepare { statement } => {
                encode_map_len(buf, 1)?;
                put_uint_entry(buf, KEY_STMT_ID, statement.statement_id)
            }
            Request::Begin(begin) => fill_begin(buf, begin.isolation, begin.timeout),
            Request::Commit => fill_commit(buf),
            Request::Rollback => fill_rollback(buf),
        }
    }

    /// Encode the complete frame: length prefix, header and body.
    pub fn encode(&self, sync: u64, stream_id: u64) -> Result<BytesMut> {
        let mut body = Vec::new();
        self.encode_body(&mut body)?;
        encode_frame(self.code(), sync, stream_id, &body)
    }
}

impl From<BeginRequest> for Request {
    fn from(begin: BeginRequest) -> Self {
        Request::Begin(begin)
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Encode a frame around an already encoded body.
pub fn encode_frame(code: RequestCode, sync: u64, stream_id: u64, body: &[u8]) -> Result<BytesMut> {
    let mut header = Vec::with_capacity(16);
    encode_map_len(&mut header, if stream_id != 0 { 3 } else { 2 })?;
    put_uint_entry(&mut header, KEY_CODE, code.as_u64())?;
    put_uint_entry(&mut header, KEY_SYNC, sync)?;
    if stream_id != 0 {
        put_uint_entry(&mut header, KEY_STREAM_ID, stream_id)?;
    }

    let len = header.len() + body.len();
    let mut buf = BytesMut::with_capacity(5 + len);
    // Always the fixed-width uint32 form so the prefix can be written up front.
    buf.put_u8(0xce);
    buf.put_u32(len as u32);
    buf.put_slice(&header);
    buf.put_slice(body);

    Ok(buf)
}

/// Encode the IPROTO_WATCH / IPROTO_UNWATCH body.
pub fn encode_watch_body(key: &str) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    encode_map_len(&mut body, 1)?;
    put_str_entry(&mut body, KEY_EVENT_KEY, key)?;
    Ok(body)
}

/// Encode the chap-sha1 IPROTO_AUTH body.
pub fn encode_auth_body(user: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    encode_map_len(&mut body, 2)?;
    put_str_entry(&mut body, KEY_USER_NAME, user)?;
    encode_uint(&mut body, KEY_TUPLE)?;
    encode_array_len(&mut body, 2)?;
    encode_str(&mut body, "chap-sha1")?;
    encode_bin(&mut body, scramble)?;
    Ok(body)
}

pub(crate) fn put_uint_entry(buf: &mut Vec<u8>, key: u64, value: u64) -> Result<()> {
    encode_uint(buf, key)?;
    encode_uint(buf, value)
}

pub(crate) fn put_str_entry(buf: &mut Vec<u8>, key: u64, value: &str) -> Result<()> {
    encode_uint(buf, key)?;
    encode_str(buf, value)
}

pub(crate) fn put_value_entry(buf: &mut Vec<u8>, key: u64, value: &Value) -> Result<()> {
    encode_uint(buf, key)?;
    encode_value(buf, value)
}

/// Convert a timeout into the seconds float used on the wire.
pub(crate) fn timeout_seconds(timeout: Duration) -> f64 {
    timeout.as_secs_f64()
}
