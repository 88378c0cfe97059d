//! Session and connector capabilities consumed from the backing store.
//!
//! The pool never speaks a SQL dialect itself. It only needs a way to open
//! a [`Session`] for a [`ConnectionKey`], run statements on it, and end
//! transactions with commit or rollback.

use std::fmt;

use crate::error::BackendError;
use crate::key::ConnectionKey;

/// A single SQL parameter or result column.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// A live session with the backing store.
///
/// Sessions are owned by the pool and only ever used by one thread at a
/// time. `rollback` must leave the session reusable: the pool calls it on
/// every release and treats a failure as a corrupted session.
pub trait Session: Send + fmt::Debug {
    /// Run a statement, returning the number of rows affected.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError>;

    /// Run a query, returning every result row.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError>;

    fn commit(&mut self) -> Result<(), BackendError>;

    fn rollback(&mut self) -> Result<(), BackendError>;

    /// Close the underlying transport. Called at most once by the pool.
    fn close(&mut self);

    /// Liveness probe used before handing out an idle session.
    fn ping(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Whether the session may be handed to a different caller after release.
    fn poolable(&self) -> bool {
        true
    }
}

/// Factory for new sessions, injected into the pool.
pub trait Connector: Send + Sync {
    fn open(&self, key: &ConnectionKey) -> Result<Box<dyn Session>, BackendError>;
}

impl<F> Connector for F
where
    F: Fn(&ConnectionKey) -> Result<Box<dyn Session>, BackendError> + Send + Sync,
{
    fn open(&self, key: &ConnectionKey) -> Result<Box<dyn Session>, BackendError> {
        self(key)
    }
}
