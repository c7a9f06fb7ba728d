use super::SqlExecutor;
use crate::errors::ExecutionError;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{ffi, Batch, Connection};

/// Runs scripts against a fresh in-memory SQLite database per call.
#[derive(Debug, Clone, Default)]
pub struct SqliteExecutor;

impl SqliteExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core, also used directly by tests.
    pub fn run_blocking(script: &str) -> Result<Vec<String>, ExecutionError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(map_sqlite_error)?;

        let mut rows_out = Vec::new();
        let mut batch = Batch::new(&conn, script);
        while let Some(mut stmt) = batch.next().map_err(map_sqlite_error)? {
            let columns = stmt.column_count();
            let mut rows = stmt.raw_query();
            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                for i in 0..columns {
                    if let Some(text) = value_text(row.get_ref(i).map_err(map_sqlite_error)?) {
                        rows_out.push(text);
                    }
                }
            }
        }
        Ok(rows_out)
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, script: &str) -> Result<Vec<String>, ExecutionError> {
        let script = script.to_string();
        tokio::task::spawn_blocking(move || Self::run_blocking(&script))
            .await
            .map_err(|e| ExecutionError::new(format!("sqlite worker failed: {}", e)))?
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

// SQLite reports most schema problems as a generic SQLITE_ERROR; the message
// prefix is the only signal.
const MESSAGE_CODES: &[(&str, &str)] = &[
    ("no such table", "42P01"),
    ("no such column", "42703"),
    ("already exists", "42P07"),
    ("duplicate column name", "42701"),
    ("no such function", "42883"),
    ("ambiguous column name", "42702"),
    ("syntax error", "42601"),
    ("incomplete input", "42601"),
];

pub fn sqlstate_for(extended_code: i32, message: &str) -> Option<&'static str> {
    match extended_code {
        ffi::SQLITE_CONSTRAINT_NOTNULL => return Some("23502"),
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return Some("23503"),
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => return Some("23505"),
        ffi::SQLITE_CONSTRAINT_CHECK => return Some("23514"),
        _ => {}
    }
    let lower = message.to_lowercase();
    MESSAGE_CODES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, code)| *code)
}

fn map_sqlite_error(err: rusqlite::Error) -> ExecutionError {
    let (message, extended_code) = match &err {
        rusqlite::Error::SqliteFailure(e, msg) => (
            msg.clone().unwrap_or_else(|| e.to_string()),
            e.extended_code,
        ),
        other => (other.to_string(), 0),
    };
    let code = sqlstate_for(extended_code, &message);
    let out = ExecutionError::new(message);
    match code {
        Some(code) => out.with_code(code),
        None => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DDL: &str = "\
CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);
CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    customer_id INTEGER NOT NULL REFERENCES customers(id),
    total INTEGER CHECK (total >= 0)
);";

    fn run(body: &str) -> Result<Vec<String>, ExecutionError> {
        SqliteExecutor::run_blocking(&format!("{}\nBEGIN;\n{}\nROLLBACK;", DDL, body))
    }

    #[test]
    fn collects_text_rows_from_every_statement() {
        let rows = run("INSERT INTO customers (id, email) VALUES (1, 'a@x');\n\
             SELECT 'ok 1 - inserted';\n\
             SELECT count(*) FROM customers;")
        .unwrap();
        assert_eq!(rows, vec!["ok 1 - inserted".to_string(), "1".to_string()]);
    }

    #[test]
    fn constraint_failures_carry_sqlstate() {
        let err = run("INSERT INTO orders (id, customer_id, total) VALUES (1, NULL, 1);").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23502"));

        let err = run("INSERT INTO orders (id, customer_id, total) VALUES (1, 99, 1);").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23503"));

        let err = run("INSERT INTO customers VALUES (1, 'a'); INSERT INTO customers VALUES (2, 'a');")
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23505"));

        let err = run("INSERT INTO customers VALUES (1, 'a'); INSERT INTO orders VALUES (1, 1, -5);")
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23514"));
    }

    #[test]
    fn missing_objects_map_to_undefined_codes() {
        let err = run("SELECT * FROM invoices;").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("42P01"));
        assert!(err.display_with_code().ends_with("(42P01)"));

        let err = run("SELECT nickname FROM customers;").unwrap_err();
        assert_eq!(err.code.as_deref(), Some("42703"));
    }

    #[test]
    fn rollback_leaves_no_state_between_runs() {
        run("INSERT INTO customers VALUES (1, 'a');").unwrap();
        let rows = run("SELECT count(*) FROM customers;").unwrap();
        assert_eq!(rows, vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn async_execute_runs_on_blocking_pool() {
        let rows = SqliteExecutor::new()
            .execute("SELECT 'ok 1 - a'; SELECT NULL;")
            .await
            .unwrap();
        assert_eq!(rows, vec!["ok 1 - a".to_string()]);
    }
}
