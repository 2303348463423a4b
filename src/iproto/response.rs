//! Responses and the futures that deliver them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use super::protocol::*;
use crate::error::{Error, Result};

// ============================================================================
// Response
// ============================================================================

/// SQL execution summary returned by execute requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlInfo {
    /// Rows changed by the statement
    pub affected_count: u64,
    /// Primary keys generated by autoincrement
    pub autoincrement_ids: Vec<u64>,
}

/// Result column description returned by execute and prepare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMetaData {
    pub field_name: String,
    pub field_type: String,
}

/// A decoded server response.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Response code from the header (0 for success)
    pub code: u32,
    /// Request id this response answers
    pub sync: u64,
    /// Tuples or call results
    pub data: Vec<Value>,
    /// Error message when `code` carries the error bit
    pub error: Option<String>,
    pub metadata: Vec<ColumnMetaData>,
    pub sql_info: SqlInfo,
    /// Statement id of a prepare response
    pub stmt_id: Option<u64>,
    /// Number of bind parameters of a prepared statement
    pub bind_count: Option<u64>,
}

impl Response {
    /// Decode a response from its header and body maps.
    pub fn decode(header: Value, body: Option<Value>) -> Result<Self> {
        let mut resp = Response::default();

        for (key, value) in map_entries(header)? {
            match key {
                KEY_CODE => {
                    let code = as_u64(&value)?;
                    resp.code = u32::try_from(code)
                        .map_err(|_| Error::Protocol(format!("response code {} out of range", code)))?;
                }
                KEY_SYNC => resp.sync = as_u64(&value)?,
                _ => {}
            }
        }

        if let Some(body) = body {
            for (key, value) in map_entries(body)? {
                match key {
                    KEY_DATA => resp.data = as_array(value)?,
                    KEY_ERROR_24 => {
                        if resp.error.is_none() {
                            resp.error = value.as_str().map(str::to_string);
                        }
                    }
                    KEY_ERROR => {
                        if let Some(message) = extended_error_message(&value) {
                            resp.error = Some(message);
                        }
                    }
                    KEY_METADATA => resp.metadata = decode_metadata(value)?,
                    KEY_SQL_INFO => resp.sql_info = decode_sql_info(value)?,
                    KEY_STMT_ID => resp.stmt_id = Some(as_u64(&value)?),
                    KEY_BIND_COUNT => resp.bind_count = Some(as_u64(&value)?),
                    _ => {}
                }
            }
        }

        Ok(resp)
    }

    /// Whether the server reported an error.
    pub fn is_error(&self) -> bool {
        self.code & ERROR_CODE_BIT != 0
    }

    /// Turn an error response into `Error::Server`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_error() {
            return Err(Error::Server {
                code: self.code & !ERROR_CODE_BIT,
                message: self.error.unwrap_or_default(),
            });
        }
        Ok(self)
    }

    /// Deserialize `data` into a typed value.
    pub fn decode_typed<T: DeserializeOwned>(self) -> Result<T> {
        Ok(rmpv::ext::from_value(Value::Array(self.data))?)
    }
}

pub(crate) fn map_entries(value: Value) -> Result<Vec<(u64, Value)>> {
    match value {
        Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| Ok((as_u64(&k)?, v)))
            .collect(),
        other => Err(Error::Protocol(format!("expected map, got {}", other))),
    }
}

fn as_u64(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| Error::Protocol(format!("expected unsigned integer, got {}", value)))
}

fn as_array(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::Protocol(format!("expected array, got {}", other))),
    }
}

/// Pull the message of the top frame out of an extended error (MP_ERROR).
fn extended_error_message(value: &Value) -> Option<String> {
    // {0x00: [ {0x03: message, ...}, ... ]}
    let stack = value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(0x00))?
        .1
        .as_array()?;
    stack
        .first()?
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(0x03))?
        .1
        .as_str()
        .map(str::to_string)
}

fn decode_metadata(value: Value) -> Result<Vec<ColumnMetaData>> {
    as_array(value)?
        .into_iter()
        .map(|column| {
            let mut meta = ColumnMetaData::default();
            for (key, value) in map_entries(column)? {
                match key {
                    0x00 => meta.field_name = value.as_str().unwrap_or_default().to_string(),
                    0x01 => meta.field_type = value.as_str().unwrap_or_default().to_string(),
                    _ => {}
                }
            }
            Ok(meta)
        })
        .collect()
}

fn decode_sql_info(value: Value) -> Result<SqlInfo> {
    let mut info = SqlInfo::default();
    for (key, value) in map_entries(value)? {
        match key {
            0x00 => info.affected_count = as_u64(&value)?,
            0x01 => {
                info.autoincrement_ids = as_array(value)?
                    .iter()
                    .map(as_u64)
                    .collect::<Result<_>>()?
            }
            _ => {}
        }
    }
    Ok(info)
}

// ============================================================================
// Response Future
// ============================================================================

pub(crate) type ResponseSender = oneshot::Sender<Result<Response>>;

type TimeoutHook = Box<dyn FnOnce() + Send + Sync>;

enum FutureState {
    Ready(Option<Result<Response>>),
    Pending(oneshot::Receiver<Result<Response>>),
}

/// A response that will arrive later.
///
/// Local failures (binding mismatches, closed connections, encode errors)
/// resolve immediately without touching the network.
pub struct ResponseFuture {
    state: FutureState,
    deadline: Option<Pin<Box<Sleep>>>,
    on_timeout: Option<TimeoutHook>,
}

impl ResponseFuture {
    /// A future that is already resolved.
    pub fn ready(result: Result<Response>) -> Self {
        Self {
            state: FutureState::Ready(Some(result)),
            deadline: None,
            on_timeout: None,
        }
    }

    /// A future that is already failed.
    pub fn failed(err: Error) -> Self {
        Self::ready(Err(err))
    }

    /// A pending future and the sender that completes it.
    pub(crate) fn pending() -> (ResponseSender, Self) {
        let (tx, rx) = oneshot::channel();
        let fut = Self {
            state: FutureState::Pending(rx),
            deadline: None,
            on_timeout: None,
        };
        (tx, fut)
    }

    /// Fail with `Error::Timeout` if no response arrives within `timeout`.
    ///
    /// A zero timeout means no deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() && matches!(self.state, FutureState::Pending(_)) {
            self.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
        }
        self
    }

    /// Run `hook` once if the deadline fires before the response arrives.
    pub(crate) fn on_timeout(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        if self.deadline.is_some() {
            self.on_timeout = Some(Box::new(hook));
        }
        self
    }

    /// Wait for the response and deserialize its data.
    pub async fn get_typed<T: DeserializeOwned>(self) -> Result<T> {
        self.await?.decode_typed()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match &mut this.state {
            FutureState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(Error::Canceled))),
            FutureState::Pending(rx) => {
                if let Poll::Ready(result) = Pin::new(rx).poll(cx) {
                    return Poll::Ready(result.unwrap_or(Err(Error::Canceled)));
                }
                if let Some(deadline) = this.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        if let Some(hook) = this.on_timeout.take() {
                            hook();
                        }
                        return Poll::Ready(Err(Error::Timeout));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            FutureState::Ready(_) => "ready",
            FutureState::Pending(_) => "pending",
        };
        f.debug_struct("ResponseFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(u64, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
    }

    #[test]
    fn test_decode_data_response() {
        let header = map(vec![(KEY_CODE, Value::from(0)), (KEY_SYNC, Value::from(7))]);
        let body = map(vec![(
            KEY_DATA,
            Value::Array(vec![Value::Array(vec![Value::from(1), Value::from("a")])]),
        )]);

        let resp = Response::decode(header, Some(body)).unwrap();
        assert_eq!(resp.sync, 7);
        assert!(!resp.is_error());

        let rows: Vec<(u64, String)> = resp.decode_typed().unwrap();
        assert_eq!(rows, vec![(1, "a".to_string())]);
    }

    #[test]
    fn test_decode_error_response() {
        let header = map(vec![
            (KEY_CODE, Value::from(ERROR_CODE_BIT | 0x24)),
            (KEY_SYNC, Value::from(1)),
        ]);
        let body = map(vec![(KEY_ERROR_24, Value::from("Space 'x' does not exist"))]);

        let resp = Response::decode(header, Some(body)).unwrap();
        assert!(resp.is_error());
        match resp.into_result() {
            Err(Error::Server { code, message }) => {
                assert_eq!(code, 0x24);
                assert_eq!(message, "Space 'x' does not exist");
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_sql_response() {
        let header = map(vec![(KEY_CODE, Value::from(0)), (KEY_SYNC, Value::from(2))]);
        let body = map(vec![
            (
                KEY_SQL_INFO,
                map(vec![
                    (0x00, Value::from(2)),
                    (0x01, Value::Array(vec![Value::from(10), Value::from(11)])),
                ]),
            ),
            (
                KEY_METADATA,
                Value::Array(vec![map(vec![
                    (0x00, Value::from("ID")),
                    (0x01, Value::from("integer")),
                ])]),
            ),
        ]);

        let resp = Response::decode(header, Some(body)).unwrap();
        assert_eq!(resp.sql_info.affected_count, 2);
        assert_eq!(resp.sql_info.autoincrement_ids, vec![10, 11]);
        assert_eq!(resp.metadata[0].field_name, "ID");
        assert_eq!(resp.metadata[0].field_type, "integer");
    }

    #[tokio::test]
    async fn test_future_resolves_from_sender() {
        let (tx, fut) = ResponseFuture::pending();
        tx.send(Ok(Response {
            sync: 3,
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(fut.await.unwrap().sync, 3);
    }

    #[tokio::test]
    async fn test_future_reports_dropped_sender_and_timeout() {
        let (tx, fut) = ResponseFuture::pending();
        drop(tx);
        assert!(matches!(fut.await, Err(Error::Canceled)));

        let (_tx, fut) = ResponseFuture::pending();
        let fut = fut.with_timeout(Duration::from_millis(10));
        assert!(matches!(fut.await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_timeout_hook_runs_only_on_deadline() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicUsize::new(0));

        let (_tx, fut) = ResponseFuture::pending();
        let counter = Arc::clone(&fired);
        let fut = fut
            .with_timeout(Duration::from_millis(10))
            .on_timeout(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        assert!(matches!(fut.await, Err(Error::Timeout)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let (tx, fut) = ResponseFuture::pending();
        let counter = Arc::clone(&fired);
        let fut = fut
            .with_timeout(Duration::from_secs(5))
            .on_timeout(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        tx.send(Ok(Response::default())).unwrap();
        assert!(fut.await.is_ok());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_response_code_is_rejected() {
        let header = map(vec![
            (KEY_CODE, Value::from(u64::from(u32::MAX) + 1)),
            (KEY_SYNC, Value::from(1)),
        ]);

        let result = Response::decode(header, None);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
