//! Analytical store connection pool and error type
//!
//! The pool is the only shared mutable resource between query handlers and
//! materializers. Connections are opened lazily, tuned with the shared
//! PRAGMAs, and returned to the idle list when the guard drops.

use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Open(rusqlite::Error),
    Begin(rusqlite::Error),
    Commit(rusqlite::Error),
    Query(rusqlite::Error),
    /// Transaction failed and was rolled back, but the rollback also failed
    RolledBack {
        cause: Box<StoreError>,
        rollback: rusqlite::Error,
    },
    Cancelled,
    Conversion(String),
    Task(String),
}

impl StoreError {
    /// True when the failure originates from caller cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            StoreError::Cancelled => true,
            StoreError::RolledBack { cause, .. } => cause.is_cancelled(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Query(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Open(e) => write!(f, "open connection: {}", e),
            StoreError::Begin(e) => write!(f, "begin transaction: {}", e),
            StoreError::Commit(e) => write!(f, "commit transaction: {}", e),
            StoreError::Query(e) => write!(f, "query error: {}", e),
            StoreError::RolledBack { cause, rollback } => {
                write!(f, "{}; rollback failed: {}", cause, rollback)
            }
            StoreError::Cancelled => write!(f, "operation cancelled"),
            StoreError::Conversion(msg) => write!(f, "conversion error: {}", msg),
            StoreError::Task(msg) => write!(f, "blocking task failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Open(e)
            | StoreError::Begin(e)
            | StoreError::Commit(e)
            | StoreError::Query(e) => Some(e),
            StoreError::RolledBack { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Pool of SQLite connections to the analytical store
pub struct ConnectionPool {
    db_path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl ConnectionPool {
    /// Open a pool over `db_path`, creating the parent directory if needed
    ///
    /// One connection is opened eagerly so a bad path fails at startup rather
    /// than on the first query.
    pub fn open(db_path: impl AsRef<Path>, max_idle: usize) -> Result<Arc<Self>, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }

        let first = open_connection(&db_path)?;
        log::info!("✅ Store pool ready: {} (max idle: {})", db_path.display(), max_idle);

        Ok(Arc::new(Self {
            db_path,
            idle: Mutex::new(vec![first]),
            max_idle: max_idle.max(1),
        }))
    }

    /// Check out a connection, opening a new one when none is idle
    pub fn get(self: &Arc<Self>) -> Result<PooledConnection, StoreError> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let conn = match reused {
            Some(conn) => conn,
            None => open_connection(&self.db_path)?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn release(&self, conn: Connection) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(StoreError::Open)?;
    apply_optimized_pragmas(&conn).map_err(StoreError::Open)?;
    Ok(conn)
}

/// Connection checked out of a `ConnectionPool`; returned on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
