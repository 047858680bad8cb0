use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Result of running one statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// First row rendered as a tuple, plus the row count
    Rows { first: String, count: usize },
    Empty,
    /// Execution error or timeout
    Failed(String),
}

impl QueryOutcome {
    /// Value written on one side of an `ANSWER:` line
    pub fn render(&self) -> String {
        match self {
            QueryOutcome::Rows { first, count } => format!("{first} ({count} rows)"),
            QueryOutcome::Empty => "[]".to_string(),
            QueryOutcome::Failed(_) => "None".to_string(),
        }
    }
}

/// `ANSWER:` value for a model result next to the ground-truth result
pub fn render_answer(result: &QueryOutcome, truth: &QueryOutcome) -> String {
    format!("{} {}", result.render(), truth.render())
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "None".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => format!("{f:?}"),
        ValueRef::Text(text) => format!("'{}'", String::from_utf8_lossy(text)),
        ValueRef::Blob(blob) => format!("<blob {} bytes>", blob.len()),
    }
}

fn render_row(values: &[String]) -> String {
    match values {
        [single] => format!("({single},)"),
        _ => format!("({})", values.join(", ")),
    }
}

/// Read-only SQLite store. Every query opens its own connection so calls can
/// run in parallel on blocking threads.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::connect(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn connect(path: &Path) -> rusqlite::Result<Connection> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Run a single statement; the connection is interrupted once `timeout`
    /// elapses. Errors and timeouts both end up as `Failed`.
    pub fn execute(&self, sql: &str, timeout: Duration) -> QueryOutcome {
        let conn = match Self::connect(&self.path) {
            Ok(conn) => conn,
            Err(e) => return QueryOutcome::Failed(e.to_string()),
        };

        let handle = conn.get_interrupt_handle();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let watchdog = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                handle.interrupt();
            }
        });

        let outcome = match Self::fetch(&conn, sql) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "query failed");
                QueryOutcome::Failed(e.to_string())
            }
        };

        let _ = done_tx.send(());
        let _ = watchdog.join();
        outcome
    }

    fn fetch(conn: &Connection, sql: &str) -> rusqlite::Result<QueryOutcome> {
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;

        let mut first = None;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            if first.is_none() {
                let values = (0..columns)
                    .map(|i| row.get_ref(i).map(render_value))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                first = Some(render_row(&values));
            }
            count += 1;
        }

        Ok(match first {
            Some(first) => QueryOutcome::Rows { first, count },
            None => QueryOutcome::Empty,
        })
    }
}
