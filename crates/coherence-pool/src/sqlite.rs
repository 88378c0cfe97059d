//! SQLite connector backed by rusqlite.

use std::path::PathBuf;
use std::time::Duration;

use coherence_core::{Backend, BackendError, ConnectionKey, Connector, Row, Session, Value};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use tracing::debug;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const MEMORY_DATABASE: &str = ":memory:";

/// Opens `sqlite:` keys.
///
/// Mutating statements run inside a transaction that is started lazily
/// (`BEGIN IMMEDIATE`) and ended by the pool's commit or release rollback.
#[derive(Clone, Debug)]
pub struct SqliteConnector {
    busy_timeout: Duration,
    poolable: bool,
}

impl Default for SqliteConnector {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            poolable: true,
        }
    }
}

impl SqliteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: how long a statement waits on a locked database.
    pub fn with_busy_timeout(self, busy_timeout: Duration) -> Self {
        Self {
            busy_timeout,
            ..self
        }
    }

    /// Builder method: whether sessions may be reused after release.
    pub fn with_poolable(self, poolable: bool) -> Self {
        Self { poolable, ..self }
    }
}

impl Connector for SqliteConnector {
    fn open(&self, key: &ConnectionKey) -> Result<Box<dyn Session>, BackendError> {
        if key.backend() != Backend::Sqlite {
            return Err(BackendError::new(format!(
                "sqlite connector cannot open {} connections",
                key.backend()
            )));
        }
        let path = &key.params().database;
        let opened = if path == MEMORY_DATABASE {
            Connection::open_in_memory()
        } else {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
        };
        let conn = opened
            .map_err(|err| backend_error(&format!("failed to open sqlite database {path}"), err))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|err| backend_error("failed to set busy timeout", err))?;

        debug!(path = %path, "opened sqlite session");
        Ok(Box::new(SqliteSession {
            conn: Some(conn),
            path: PathBuf::from(path),
            poolable: self.poolable,
        }))
    }
}

#[derive(Debug)]
pub struct SqliteSession {
    conn: Option<Connection>,
    path: PathBuf,
    poolable: bool,
}

impl SqliteSession {
    fn conn(&self) -> Result<&Connection, BackendError> {
        self.conn
            .as_ref()
            .ok_or_else(|| BackendError::new("sqlite session is closed"))
    }

    fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| !conn.is_autocommit())
    }
}

impl Session for SqliteSession {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError> {
        let conn = self.conn()?;
        begin_if_writing(conn, sql)?;
        let changed = conn
            .execute(sql, params_from_iter(params.iter().map(to_sql)))
            .map_err(|err| backend_error(&format!("statement failed: {sql}"), err))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError> {
        let conn = self.conn()?;
        begin_if_writing(conn, sql)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|err| backend_error(&format!("failed to prepare query: {sql}"), err))?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter().map(to_sql)), |row| {
                (0..columns)
                    .map(|idx| row.get::<_, SqlValue>(idx).map(from_sql))
                    .collect::<Result<Row, _>>()
            })
            .map_err(|err| backend_error(&format!("query failed: {sql}"), err))?
            .collect::<Result<Vec<Row>, _>>()
            .map_err(|err| backend_error(&format!("failed to read row: {sql}"), err))?;
        Ok(rows)
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.conn()?
            .execute_batch("COMMIT")
            .map_err(|err| backend_error("commit failed", err))
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.conn()?
            .execute_batch("ROLLBACK")
            .map_err(|err| backend_error("rollback failed", err))
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                debug!(path = %self.path.display(), error = %err, "sqlite close reported an error");
            }
        }
    }

    fn ping(&mut self) -> Result<(), BackendError> {
        self.conn()?
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|err| backend_error("ping failed", err))
    }

    fn poolable(&self) -> bool {
        self.poolable
    }
}

fn backend_error(context: &str, err: rusqlite::Error) -> BackendError {
    BackendError::with_source(format!("{context}: {err}"), err)
}

/// Statement keywords that make a `WITH` query a write.
const MUTATING_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE"];

/// Open the session's transaction before the first write, whichever of
/// `execute` or `query` (`... RETURNING`) carries it.
fn begin_if_writing(conn: &Connection, sql: &str) -> Result<(), BackendError> {
    if starts_transaction(sql) && conn.is_autocommit() {
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|err| backend_error("failed to begin transaction", err))?;
    }
    Ok(())
}

/// Whether `sql` writes and should run inside the session's transaction.
fn starts_transaction(sql: &str) -> bool {
    let mut words = sql
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase);
    match words.next().as_deref() {
        None => false,
        Some("WITH") => words.any(|word| MUTATING_KEYWORDS.contains(&word.as_str())),
        Some(
            "SELECT" | "VALUES" | "EXPLAIN" | "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT"
            | "RELEASE" | "PRAGMA",
        ) => false,
        Some(_) => true,
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(v),
        SqlValue::Real(v) => Value::Real(v),
        SqlValue::Text(v) => Value::Text(v),
        SqlValue::Blob(v) => Value::Blob(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_session() -> Box<dyn Session> {
        let key = ConnectionKey::parse("sqlite::memory:").unwrap();
        SqliteConnector::new().open(&key).unwrap()
    }

    #[test]
    fn rejects_non_sqlite_keys() {
        let key = ConnectionKey::parse("postgres://trac@db.local/trac").unwrap();
        let err = SqliteConnector::new().open(&key).unwrap_err();
        assert!(err.message().contains("postgres"));
    }

    #[test]
    fn statement_classification() {
        assert!(starts_transaction("INSERT INTO cache VALUES ('x', 1)"));
        assert!(starts_transaction("create table t (x integer)"));
        assert!(starts_transaction("INSERT INTO t VALUES (1) RETURNING x"));
        assert!(starts_transaction(
            "WITH old AS (SELECT x FROM t) DELETE FROM t WHERE x IN old"
        ));
        assert!(!starts_transaction("SELECT 1"));
        assert!(!starts_transaction("(SELECT 1) UNION (SELECT 2)"));
        assert!(!starts_transaction("WITH r AS (SELECT 1) SELECT * FROM r"));
        assert!(!starts_transaction("  commit"));
        assert!(!starts_transaction(""));
    }

    #[test]
    fn execute_and_query_round_trip_values() {
        let mut session = memory_session();
        session
            .execute("CREATE TABLE t (id TEXT, n INTEGER, r REAL, b BLOB)", &[])
            .unwrap();
        session
            .execute(
                "INSERT INTO t VALUES (?1, ?2, ?3, ?4)",
                &["a".into(), 7_i64.into(), 1.5_f64.into(), vec![1_u8, 2].into()],
            )
            .unwrap();
        session.commit().unwrap();

        let rows = session.query("SELECT id, n, r, b FROM t", &[]).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                Value::Text("a".to_string()),
                Value::Integer(7),
                Value::Real(1.5),
                Value::Blob(vec![1, 2]),
            ]]
        );
    }

    #[test]
    fn rollback_discards_uncommitted_writes() {
        let mut session = memory_session();
        session.execute("CREATE TABLE t (x INTEGER)", &[]).unwrap();
        session.commit().unwrap();

        session.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        session.rollback().unwrap();
        let rows = session.query("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(rows[0][0], Value::Integer(0));
    }

    #[test]
    fn returning_write_through_query_is_rolled_back() {
        let mut session = memory_session();
        session.execute("CREATE TABLE t (x INTEGER)", &[]).unwrap();
        session.commit().unwrap();

        let rows = session.query("INSERT INTO t VALUES (1) RETURNING x", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(1)]]);
        session.rollback().unwrap();
        let rows = session.query("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(rows[0][0], Value::Integer(0));
    }

    #[test]
    fn rollback_without_transaction_is_a_noop() {
        let mut session = memory_session();
        assert!(session.rollback().is_ok());
        assert!(session.commit().is_ok());
    }

    #[test]
    fn closed_session_fails_ping() {
        let mut session = memory_session();
        assert!(session.ping().is_ok());
        session.close();
        assert!(session.ping().is_err());
        assert!(session.query("SELECT 1", &[]).is_err());
    }
}
