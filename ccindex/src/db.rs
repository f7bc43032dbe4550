//! DuckDB session helpers.
//!
//! Every worker opens its own connection; connections are never shared
//! across threads. Readers open databases read-only; only the pipeline
//! opens them read-write.

use std::path::Path;
use std::thread;
use std::time::Duration;

use duckdb::{AccessMode, Connection};

use crate::Result;

/// Open an in-memory session configured for pipeline work.
pub fn memory_session(
    threads: usize,
    memory_limit_gb: Option<f64>,
    temp_dir: Option<&Path>,
) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_session(&conn, threads, memory_limit_gb, temp_dir)?;
    Ok(conn)
}

/// Apply thread, memory-limit and spill settings to a session.
pub fn configure_session(
    conn: &Connection,
    threads: usize,
    memory_limit_gb: Option<f64>,
    temp_dir: Option<&Path>,
) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA threads={};", threads.max(1)))?;
    if let Some(gb) = memory_limit_gb {
        if gb > 0.0 {
            conn.execute_batch(&format!("SET memory_limit='{:.3}GB';", gb))?;
        }
    }
    if let Some(dir) = temp_dir {
        std::fs::create_dir_all(dir)?;
        conn.execute_batch(&format!("SET temp_directory='{}';", sql_quote_str(dir)))?;
    }
    Ok(())
}

/// Retry schedule for opening a locked database: up to 8 attempts with a
/// linearly growing, jittered pause (~25ms, ~50ms, ... plus 0-24ms), so a
/// writer waits at most around a second for a lock holder to finish.
const OPEN_RETRY_LIMIT: u32 = 8;
const OPEN_BACKOFF_STEP_MS: u64 = 25;

/// DuckDB reports lock conflicts only through the error message text.
fn is_lock_contention(e: &duckdb::Error) -> bool {
    e.to_string().to_ascii_lowercase().contains("lock")
}

/// Open a database file read-write, creating parent directories.
///
/// DuckDB holds a file lock per writer; pipeline stages and background jobs
/// can briefly overlap on the same index, so lock conflicts are waited out
/// on the retry schedule above rather than failed immediately.
pub fn open_rw(path: &Path, threads: usize, memory_limit_gb: Option<f64>) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut attempt: u32 = 0;
    loop {
        match Connection::open(path) {
            Ok(conn) => {
                configure_session(&conn, threads, memory_limit_gb, None)?;
                return Ok(conn);
            }
            Err(e) if is_lock_contention(&e) && attempt < OPEN_RETRY_LIMIT => {
                attempt += 1;
                let jitter = rand::random::<u64>() % OPEN_BACKOFF_STEP_MS;
                thread::sleep(Duration::from_millis(
                    OPEN_BACKOFF_STEP_MS * attempt as u64 + jitter,
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open a database file read-only.
pub fn open_readonly(path: &Path) -> Result<Connection> {
    let config = duckdb::Config::default().access_mode(AccessMode::ReadOnly)?;
    Ok(Connection::open_with_flags(path, config)?)
}

/// Check whether a table exists in the connected database.
pub fn table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT count(*) > 0 FROM duckdb_tables() WHERE database_name = current_database() AND table_name = ?",
        [table],
        |row| row.get(0),
    )
    .unwrap_or(false)
}

/// Check whether a table exists in an attached catalog.
pub fn attached_table_exists(conn: &Connection, catalog: &str, table: &str) -> bool {
    conn.query_row(
        "SELECT count(*) > 0 FROM duckdb_tables() WHERE database_name = ? AND table_name = ?",
        [catalog, table],
        |row| row.get(0),
    )
    .unwrap_or(false)
}

/// Escape a string for embedding in a single-quoted SQL literal.
pub fn sql_quote(s: &str) -> String {
    s.replace('\'', "''")
}

/// Escape a path for embedding in a single-quoted SQL literal.
pub fn sql_quote_str(path: &Path) -> String {
    sql_quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_session_settings_apply() {
        let tmp = TempDir::new().unwrap();
        let conn = memory_session(2, Some(1.0), Some(tmp.path())).unwrap();
        let threads: i64 = conn
            .query_row("SELECT current_setting('threads')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(threads, 2);
    }

    #[test]
    fn test_table_exists() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!table_exists(&conn, "cc_domain_shards"));
        conn.execute_batch(crate::schema::DDL_CC_DOMAIN_SHARDS).unwrap();
        assert!(table_exists(&conn, "cc_domain_shards"));
    }

    #[test]
    fn test_open_rw_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/test.duckdb");
        let conn = open_rw(&path, 1, None).unwrap();
        conn.execute_batch("CREATE TABLE t(x INTEGER);").unwrap();
        drop(conn);
        assert!(path.exists());
    }

    #[test]
    fn test_sql_quote() {
        assert_eq!(sql_quote("it's"), "it''s");
        assert_eq!(sql_quote("plain"), "plain");
    }
}
