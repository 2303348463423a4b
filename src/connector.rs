//! The database operation surface shared by single connections and pools.
//!
//! Implementors only provide request routing (`do_request`) and a few
//! lifecycle hooks; every operation below is built on top of them. Each
//! operation comes in three forms:
//! - `op_async`: returns a `ResponseFuture` right away
//! - `op`: waits for the raw `Response`
//! - `op_typed`: waits and deserializes the response data into `T`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::iproto::{
    same_connection, ColumnMetaData, Connection, ConnectionRef, IteratorType, Prepared, Request, Response,
    ResponseFuture, SqlInfo, Stream, WatchCallback, Watcher,
};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Route a request and return its future.
    fn do_request(&self, request: Request) -> ResponseFuture;

    /// Whether requests can be served right now.
    fn connected_now(&self) -> bool;

    fn close(&self) -> Result<()>;

    /// Per-request timeout from the connection options.
    fn configured_timeout(&self) -> Duration;

    /// Open a stream for interactive transactions.
    fn new_stream(&self) -> Result<Stream>;

    /// Subscribe to changes of a server-side key.
    fn new_watcher(&self, key: &str, callback: WatchCallback) -> Result<Box<dyn Watcher>>;

    /// Prepare an SQL statement on the server.
    async fn new_prepared(&self, sql: &str) -> Result<Prepared>;

    // ========================================================================
    // Ping
    // ========================================================================

    async fn ping(&self) -> Result<Response> {
        self.do_request(Request::Ping).await
    }

    // ========================================================================
    // Select
    // ========================================================================

    fn select_async(
        &self,
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
        key: Value,
    ) -> ResponseFuture {
        self.do_request(Request::select(space, index, offset, limit, iterator, key))
    }

    async fn select(
        &self,
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
        key: Value,
    ) -> Result<Response> {
        self.select_async(space, index, offset, limit, iterator, key).await
    }

    async fn select_typed<T: DeserializeOwned + Send>(
        &self,
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
        key: Value,
    ) -> Result<T> {
        self.select_async(space, index, offset, limit, iterator, key)
            .get_typed()
            .await
    }

    /// Point lookup: select with offset 0, limit 1 and the `Eq` iterator.
    async fn get_typed<T: DeserializeOwned + Send>(&self, space: u32, index: u32, key: Value) -> Result<T> {
        self.select_async(space, index, 0, 1, IteratorType::Eq, key)
            .get_typed()
            .await
    }

    // ========================================================================
    // Insert / Replace
    // ========================================================================

    fn insert_async(&self, space: u32, tuple: Value) -> ResponseFuture {
        self.do_request(Request::insert(space, tuple))
    }

    /// Rejected by the server when a tuple with the same primary key exists.
    async fn insert(&self, space: u32, tuple: Value) -> Result<Response> {
        self.insert_async(space, tuple).await
    }

    async fn insert_typed<T: DeserializeOwned + Send>(&self, space: u32, tuple: Value) -> Result<T> {
        self.insert_async(space, tuple).get_typed().await
    }

    fn replace_async(&self, space: u32, tuple: Value) -> ResponseFuture {
        self.do_request(Request::replace(space, tuple))
    }

    /// Insert, or replace the tuple with the same primary key.
    async fn replace(&self, space: u32, tuple: Value) -> Result<Response> {
        self.replace_async(space, tuple).await
    }

    async fn replace_typed<T: DeserializeOwned + Send>(&self, space: u32, tuple: Value) -> Result<T> {
        self.replace_async(space, tuple).get_typed().await
    }

    // ========================================================================
    // Delete / Update / Upsert
    // ========================================================================

    fn delete_async(&self, space: u32, index: u32, key: Value) -> ResponseFuture {
        self.do_request(Request::delete(space, index, key))
    }

    /// Response data holds the deleted tuple.
    async fn delete(&self, space: u32, index: u32, key: Value) -> Result<Response> {
        self.delete_async(space, index, key).await
    }

    async fn delete_typed<T: DeserializeOwned + Send>(&self, space: u32, index: u32, key: Value) -> Result<T> {
        self.delete_async(space, index, key).get_typed().await
    }

    fn update_async(&self, space: u32, index: u32, key: Value, ops: Value) -> ResponseFuture {
        self.do_request(Request::update(space, index, key, ops))
    }

    /// Response data holds the updated tuple.
    async fn update(&self, space: u32, index: u32, key: Value, ops: Value) -> Result<Response> {
        self.update_async(space, index, key, ops).await
    }

    async fn update_typed<T: DeserializeOwned + Send>(
        &self,
        space: u32,
        index: u32,
        key: Value,
        ops: Value,
    ) -> Result<T> {
        self.update_async(space, index, key, ops).get_typed().await
    }

    fn upsert_async(&self, space: u32, tuple: Value, ops: Value) -> ResponseFuture {
        self.do_request(Request::upsert(space, tuple, ops))
    }

    /// Update the tuple if it exists, insert it otherwise. Returns no tuple.
    async fn upsert(&self, space: u32, tuple: Value, ops: Value) -> Result<Response> {
        self.upsert_async(space, tuple, ops).await
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a stored function with the current call convention.
    fn call_async(&self, function: &str, args: Value) -> ResponseFuture {
        self.call17_async(function, args)
    }

    async fn call(&self, function: &str, args: Value) -> Result<Response> {
        self.call_async(function, args).await
    }

    async fn call_typed<T: DeserializeOwned + Send>(&self, function: &str, args: Value) -> Result<T> {
        self.call_async(function, args).get_typed().await
    }

    /// Legacy call: the result is converted to an array of tuples.
    fn call16_async(&self, function: &str, args: Value) -> ResponseFuture {
        self.do_request(Request::call16(function, args))
    }

    async fn call16(&self, function: &str, args: Value) -> Result<Response> {
        self.call16_async(function, args).await
    }

    async fn call16_typed<T: DeserializeOwned + Send>(&self, function: &str, args: Value) -> Result<T> {
        self.call16_async(function, args).get_typed().await
    }

    /// Results are returned as-is (always wrapped in an array).
    fn call17_async(&self, function: &str, args: Value) -> ResponseFuture {
        self.do_request(Request::call17(function, args))
    }

    async fn call17(&self, function: &str, args: Value) -> Result<Response> {
        self.call17_async(function, args).await
    }

    async fn call17_typed<T: DeserializeOwned + Send>(&self, function: &str, args: Value) -> Result<T> {
        self.call17_async(function, args).get_typed().await
    }

    // ========================================================================
    // Eval / SQL
    // ========================================================================

    fn eval_async(&self, expr: &str, args: Value) -> ResponseFuture {
        self.do_request(Request::eval(expr, args))
    }

    async fn eval(&self, expr: &str, args: Value) -> Result<Response> {
        self.eval_async(expr, args).await
    }

    async fn eval_typed<T: DeserializeOwned + Send>(&self, expr: &str, args: Value) -> Result<T> {
        self.eval_async(expr, args).get_typed().await
    }

    fn execute_async(&self, sql: &str, args: Value) -> ResponseFuture {
        self.do_request(Request::execute(sql, args))
    }

    async fn execute(&self, sql: &str, args: Value) -> Result<Response> {
        self.execute_async(sql, args).await
    }

    async fn execute_typed<T: DeserializeOwned + Send>(
        &self,
        sql: &str,
        args: Value,
    ) -> Result<(SqlInfo, Vec<ColumnMetaData>, T)> {
        let mut resp = self.execute_async(sql, args).await?;
        let info = std::mem::take(&mut resp.sql_info);
        let metadata = std::mem::take(&mut resp.metadata);
        Ok((info, metadata, resp.decode_typed()?))
    }
}

// ============================================================================
// Single connection
// ============================================================================

#[async_trait]
impl Connector for ConnectionRef {
    /// Send on this connection. Requests bound to another connection are
    /// rejected locally.
    fn do_request(&self, request: Request) -> ResponseFuture {
        if let Some(bound) = request.bound_connection() {
            if !same_connection(bound, self) {
                return ResponseFuture::failed(Error::BindingMismatch);
            }
        }
        (**self).send(request, 0)
    }

    fn connected_now(&self) -> bool {
        (**self).connected_now()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn configured_timeout(&self) -> Duration {
        (**self).configured_timeout()
    }

    fn new_stream(&self) -> Result<Stream> {
        Ok(Stream::new(Arc::clone(self)))
    }

    fn new_watcher(&self, key: &str, callback: WatchCallback) -> Result<Box<dyn Watcher>> {
        (**self).watch(key, callback)
    }

    async fn new_prepared(&self, sql: &str) -> Result<Prepared> {
        let resp = self.do_request(Request::prepare(sql)).await?;
        Prepared::from_response(Arc::clone(self), resp)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::iproto::{RequestCode, WatchEvent};
    use crate::testing::MockConnection;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: u64,
        name: String,
    }

    #[tokio::test]
    async fn test_operations_send_matching_request_codes() {
        let mock = MockConnection::connected("node-a:3301");
        let conn: ConnectionRef = mock.clone();

        conn.ping().await.unwrap();
        conn.select(512, 0, 0, 10, IteratorType::All, Value::Array(vec![]))
            .await
            .unwrap();
        conn.insert(512, Value::Array(vec![Value::from(1)])).await.unwrap();
        conn.replace(512, Value::Array(vec![Value::from(1)])).await.unwrap();
        conn.delete(512, 0, Value::Array(vec![Value::from(1)])).await.unwrap();
        conn.update(512, 0, Value::Array(vec![]), Value::Array(vec![]))
            .await
            .unwrap();
        conn.upsert(512, Value::Array(vec![]), Value::Array(vec![]))
            .await
            .unwrap();
        conn.call("f", Value::Array(vec![])).await.unwrap();
        conn.call16("f", Value::Array(vec![])).await.unwrap();
        conn.eval("return 1", Value::Array(vec![])).await.unwrap();
        conn.execute("SELECT 1", Value::Array(vec![])).await.unwrap();

        let codes: Vec<RequestCode> = mock.sent().iter().map(|s| s.code).collect();
        assert_eq!(
            codes,
            vec![
                RequestCode::Ping,
                RequestCode::Select,
                RequestCode::Insert,
                RequestCode::Replace,
                RequestCode::Delete,
                RequestCode::Update,
                RequestCode::Upsert,
                RequestCode::Call17,
                RequestCode::Call16,
                RequestCode::Eval,
                RequestCode::Execute,
            ]
        );
        assert!(mock.sent().iter().all(|s| s.stream_id == 0));
    }

    #[tokio::test]
    async fn test_typed_results_are_deserialized() {
        let mock = MockConnection::connected("node-a:3301");
        mock.respond_with(|_| {
            Ok(Response {
                data: vec![Value::Array(vec![Value::from(7), Value::from("alice")])],
                ..Default::default()
            })
        });
        let conn: ConnectionRef = mock.clone();

        let users: Vec<User> = conn
            .get_typed(512, 0, Value::Array(vec![Value::from(7)]))
            .await
            .unwrap();
        assert_eq!(
            users,
            vec![User {
                id: 7,
                name: "alice".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_execute_typed_splits_sql_info_and_metadata() {
        let mock = MockConnection::connected("node-a:3301");
        mock.respond_with(|_| {
            Ok(Response {
                data: vec![Value::Array(vec![Value::from(1)])],
                sql_info: SqlInfo {
                    affected_count: 1,
                    autoincrement_ids: vec![],
                },
                metadata: vec![ColumnMetaData {
                    field_name: "ID".to_string(),
                    field_type: "integer".to_string(),
                }],
                ..Default::default()
            })
        });
        let conn: ConnectionRef = mock.clone();

        let (info, meta, rows): (_, _, Vec<(u64,)>) = conn
            .execute_typed("SELECT id FROM t", Value::Array(vec![]))
            .await
            .unwrap();
        assert_eq!(info.affected_count, 1);
        assert_eq!(meta[0].field_name, "ID");
        assert_eq!(rows, vec![(1,)]);
    }

    #[tokio::test]
    async fn test_prepared_statement_round_trip() {
        let mock = MockConnection::connected("node-a:3301");
        mock.respond_with(|request| {
            Ok(match request {
                Request::Prepare { .. } => Response {
                    stmt_id: Some(17),
                    bind_count: Some(1),
                    ..Default::default()
                },
                _ => Response::default(),
            })
        });
        let conn: ConnectionRef = mock.clone();

        let statement = conn.new_prepared("SELECT ?").await.unwrap();
        assert_eq!(statement.statement_id, 17);

        conn.do_request(statement.execute_request(Value::Array(vec![Value::from(1)])))
            .await
            .unwrap();
        assert_eq!(mock.sent().len(), 2);

        let other: ConnectionRef = MockConnection::connected("node-b:3301");
        let result = other.do_request(statement.unprepare_request()).await;
        assert!(matches!(result, Err(Error::BindingMismatch)));
    }

    #[test]
    fn test_mock_connection_has_no_watchers() {
        let conn: ConnectionRef = MockConnection::connected("node-a:3301");
        let result = conn.new_watcher("box.status", Arc::new(|_: WatchEvent| {}));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
