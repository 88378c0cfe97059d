//! The authoritative `(id, generation)` table in the backing store.
//!
//! An absent row means generation 0. The first invalidation of an id creates
//! its row at generation 1; after that the counter only ever grows.

use std::collections::HashMap;

use coherence_core::{Row, Value};
use coherence_pool::PooledConnection;
use tracing::debug;

use crate::error::{CacheError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationTable {
    table: String,
}

impl GenerationTable {
    /// Bind to `table`, which must be a plain SQL identifier.
    pub fn new(table: &str) -> Result<Self> {
        if !is_identifier(table) {
            return Err(CacheError::InvalidTable(table.to_string()));
        }
        Ok(Self {
            table: table.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.table
    }

    pub fn ensure_schema(&self, conn: &mut PooledConnection) -> Result<()> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, generation INTEGER NOT NULL)",
                self.table
            ),
            &[],
        )?;
        Ok(())
    }

    /// Every `(id, generation)` row.
    pub fn read_all(&self, conn: &mut PooledConnection) -> Result<HashMap<String, i64>> {
        let rows = conn.query(&format!("SELECT id, generation FROM {}", self.table), &[])?;
        rows.iter().map(parse_row).collect()
    }

    /// The generation of one id, 0 when it was never invalidated.
    pub fn read_one(&self, conn: &mut PooledConnection, id: &str) -> Result<i64> {
        let rows = conn.query(
            &format!("SELECT generation FROM {} WHERE id = ?1", self.table),
            &[Value::from(id)],
        )?;
        match rows.first().and_then(|row| row.first()) {
            None => Ok(0),
            Some(value) => value
                .as_i64()
                .ok_or_else(|| CacheError::MalformedRow(format!("{id}: {value:?}"))),
        }
    }

    /// Advance the generation of `id`, returning the new value.
    ///
    /// Update-then-insert keeps this portable across backends without a
    /// common upsert syntax; concurrent first invalidations are serialized by
    /// the store's own write transaction.
    pub fn bump(&self, conn: &mut PooledConnection, id: &str) -> Result<i64> {
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET generation = generation + 1 WHERE id = ?1",
                self.table
            ),
            &[Value::from(id)],
        )?;
        if updated == 0 {
            conn.execute(
                &format!("INSERT INTO {} (id, generation) VALUES (?1, 1)", self.table),
                &[Value::from(id)],
            )?;
            debug!(cache_id = id, generation = 1, "created generation row");
            return Ok(1);
        }
        let generation = self.read_one(conn, id)?;
        debug!(cache_id = id, generation, "bumped generation");
        Ok(generation)
    }
}

fn parse_row(row: &Row) -> Result<(String, i64)> {
    match row.as_slice() {
        [Value::Text(id), Value::Integer(generation)] => Ok((id.clone(), *generation)),
        other => Err(CacheError::MalformedRow(format!("{other:?}"))),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
