use std::path::{Path, PathBuf};

use rusqlite::types::{ToSql, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CsdmError;

/// Record class holding one row per footprint.
pub const TABLE_2D: &str = "footprint_2d";
/// Record class holding one row per footprint and vertical bin.
pub const TABLE_3D: &str = "footprint_3d";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    /// Numeric values of one column; non-numeric cells become `None`.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let index = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).and_then(Value::as_f64))
                .collect(),
        )
    }
}

/// Relational storage target of one job.
///
/// The Parse Dispatcher's decoder is its only writer; everything in this type
/// runs on the job's processing thread, so there is never a second writer.
#[derive(Debug, Clone)]
pub struct SwathStore {
    path: PathBuf,
}

impl SwathStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open(&self, read_only: bool) -> Result<Connection, CsdmError> {
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        Ok(Connection::open_with_flags(&self.path, flags)?)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, CsdmError> {
        if !self.exists() {
            return Ok(false);
        }
        let conn = self.open(true)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Dataset, CsdmError> {
        let conn = self.open(true)?;
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let width = columns.len();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(json_value(row.get_ref(index)?));
            }
            out.push(values);
        }
        Ok(Dataset { columns, rows: out })
    }

    /// Replaces `table` with the rows selected by `select_sql` in one transaction.
    pub fn replace_table(
        &self,
        table: &str,
        select_sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<usize, CsdmError> {
        let mut conn = self.open(false)?;
        let staging = format!("{table}__filtered");
        let tx = conn.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS {staging}"), [])?;
        tx.execute(&format!("CREATE TABLE {staging} AS {select_sql}"), params)?;
        let kept: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {staging}"), [], |row| {
            row.get(0)
        })?;
        tx.execute(&format!("DROP TABLE {table}"), [])?;
        tx.execute(&format!("ALTER TABLE {staging} RENAME TO {table}"), [])?;
        tx.commit()?;
        Ok(kept as usize)
    }

    pub fn row_count(&self, table: &str) -> Result<usize, CsdmError> {
        let conn = self.open(true)?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(format!("<{} bytes>", blob.len())),
    }
}
