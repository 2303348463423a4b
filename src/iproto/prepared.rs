//! Server-side prepared SQL statements.
//!
//! A prepared statement lives on the connection that prepared it, so the
//! requests built from it are bound to that connection.

use rmpv::Value;

use super::connection::ConnectionRef;
use super::protocol::Request;
use super::response::{ColumnMetaData, Response};
use crate::error::{Error, Result};

/// A statement prepared on one connection.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Server-side statement id
    pub statement_id: u64,
    /// Number of bind parameters
    pub param_count: u64,
    /// Result columns
    pub metadata: Vec<ColumnMetaData>,
    conn: ConnectionRef,
}

impl Prepared {
    pub fn new(conn: ConnectionRef, statement_id: u64, param_count: u64, metadata: Vec<ColumnMetaData>) -> Self {
        Self {
            statement_id,
            param_count,
            metadata,
            conn,
        }
    }

    /// Build a statement from the response to a prepare request.
    pub fn from_response(conn: ConnectionRef, resp: Response) -> Result<Self> {
        let statement_id = resp
            .stmt_id
            .ok_or_else(|| Error::Protocol("prepare response without statement id".to_string()))?;
        Ok(Self::new(
            conn,
            statement_id,
            resp.bind_count.unwrap_or(0),
            resp.metadata,
        ))
    }

    /// The connection this statement belongs to.
    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }

    /// Request executing the statement with `args` bound.
    pub fn execute_request(&self, args: Value) -> Request {
        Request::ExecutePrepared {
            statement: self.clone(),
            args,
        }
    }

    /// Request releasing the statement on the server.
    pub fn unprepare_request(&self) -> Request {
        Request::Unprepare {
            statement: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iproto::connection::same_connection;
    use crate::testing::MockConnection;

    #[test]
    fn test_from_response_requires_statement_id() {
        let conn = MockConnection::connected("node-a:3301");
        let err = Prepared::from_response(conn, Response::default()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_requests_are_bound_to_preparing_connection() {
        let conn: ConnectionRef = MockConnection::connected("node-a:3301");
        let other: ConnectionRef = MockConnection::connected("node-a:3301");
        let resp = Response {
            stmt_id: Some(42),
            bind_count: Some(1),
            ..Default::default()
        };
        let statement = Prepared::from_response(conn.clone(), resp).unwrap();
        assert_eq!(statement.statement_id, 42);
        assert_eq!(statement.param_count, 1);

        let request = statement.execute_request(Value::Array(vec![Value::from(1)]));
        assert!(request.is_bound_to(&conn));
        // Same address, different connection.
        assert!(!request.is_bound_to(&other));
        assert!(same_connection(statement.connection(), &conn));
    }
}
