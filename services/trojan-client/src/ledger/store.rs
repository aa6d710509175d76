//! SQLite-based account ledger.
//!
//! The ledger is the durable record of which accounts should exist and how
//! much traffic each one has moved. It survives proxy restarts; the
//! reconciliation engine uses it to rebuild the proxy's in-memory table.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, ErrorCode};
use thiserror::Error;
use tracing::debug;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("password hash is already used by another account")]
    DuplicatePassword,

    #[error("ledger connection poisoned")]
    Poisoned,

    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Account id, assigned by the manager.
    pub id: i64,
    /// Credential hash presented to the proxy.
    pub password: String,
}

/// One archived traffic observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub account_id: i64,
    /// Upload plus download bytes.
    pub flow: i64,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// Summed traffic for one account over a time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountFlow {
    pub account_id: i64,
    pub flow: i64,
}

/// Half-open time range `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRange {
    pub start: i64,
    pub end: i64,
}

/// SQLite ledger. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open or create a ledger at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory ledger (for testing).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| LedgerError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// List all accounts ordered by id.
    pub async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT id, password FROM accounts ORDER BY id")?;
            let accounts = stmt
                .query_map([], |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        password: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(accounts)
        })
        .await
    }

    /// Create the account unless one with this id already exists.
    ///
    /// An existing account keeps its current password. Returns true if a row
    /// was created.
    pub async fn find_or_create(&self, id: i64, password: &str) -> Result<bool, LedgerError> {
        let password = password.to_string();
        self.call(move |conn| {
            let now = chrono::Utc::now().timestamp_millis();
            let tx = conn.transaction()?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if exists {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO accounts (id, password, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![id, password, now],
            )
            .map_err(map_unique)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Delete an account. Returns true if it existed.
    pub async fn remove_account(&self, id: i64) -> Result<bool, LedgerError> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    /// Replace an account's password as one transaction.
    pub async fn change_password(&self, id: i64, password: &str) -> Result<(), LedgerError> {
        let password = password.to_string();
        self.call(move |conn| {
            let now = chrono::Utc::now().timestamp_millis();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
            tx.execute(
                "INSERT INTO accounts (id, password, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![id, password, now],
            )
            .map_err(map_unique)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Append flow records in a single transaction.
    pub async fn insert_flows(&self, records: Vec<FlowRecord>) -> Result<usize, LedgerError> {
        if records.is_empty() {
            return Ok(0);
        }

        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO flows (account_id, flow, created_at) VALUES (?1, ?2, ?3)",
                )?;
                for record in &records {
                    stmt.execute(params![record.account_id, record.flow, record.created_at])?;
                }
            }
            tx.commit()?;
            debug!(count = records.len(), "Flow records appended");
            Ok(records.len())
        })
        .await
    }

    /// Sum traffic per existing account over a range.
    ///
    /// Accounts without records in the range are omitted.
    pub async fn flow_summary(&self, range: FlowRange) -> Result<Vec<AccountFlow>, LedgerError> {
        self.call(move |conn| summarize_flows(conn, range)).await
    }

    /// Summarize a range and delete its records in one transaction.
    ///
    /// Records written concurrently land either in the returned sums or
    /// after the delete, never in neither.
    pub async fn take_flows(&self, range: FlowRange) -> Result<Vec<AccountFlow>, LedgerError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let flows = summarize_flows(&tx, range)?;
            let deleted = tx.execute(
                "DELETE FROM flows WHERE created_at >= ?1 AND created_at < ?2",
                params![range.start, range.end],
            )?;
            tx.commit()?;

            debug!(deleted, start = range.start, end = range.end, "Flow records taken");
            Ok(flows)
        })
        .await
    }

    /// List all flow records in insertion order.
    pub async fn list_flows(&self) -> Result<Vec<FlowRecord>, LedgerError> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT account_id, flow, created_at FROM flows ORDER BY id")?;
            let records = stmt
                .query_map([], |row| {
                    Ok(FlowRecord {
                        account_id: row.get(0)?,
                        flow: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}

/// Initialize database schema.
fn summarize_flows(conn: &Connection, range: FlowRange) -> Result<Vec<AccountFlow>, LedgerError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT a.id, SUM(f.flow)
        FROM accounts a
        JOIN flows f ON f.account_id = a.id
        WHERE f.created_at >= ?1 AND f.created_at < ?2
        GROUP BY a.id
        ORDER BY a.id
        "#,
    )?;
    let flows = stmt
        .query_map(params![range.start, range.end], |row| {
            Ok(AccountFlow {
                account_id: row.get(0)?,
                flow: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(flows)
}

fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            password TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            flow INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_flows_created_at ON flows(created_at);
        "#,
    )?;

    debug!("Ledger schema initialized");
    Ok(())
}

fn map_unique(err: rusqlite::Error) -> LedgerError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => LedgerError::DuplicatePassword,
        _ => LedgerError::Sqlite(err),
    }
}
