//! Shared SQLite connection tuning
//!
//! Every connection opened by the log, the store pool and the tests goes
//! through `apply_optimized_pragmas` so readers and writers agree on journal
//! mode and checkpoint behaviour.

use rusqlite::Connection;
use std::time::Duration;

/// How long a connection waits on a locked database before failing
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL, NORMAL sync, in-memory temp store, cache and autocheckpoint
///
/// - `journal_mode = WAL` lets materializers append while queries read
/// - `synchronous = NORMAL` is durable across application crashes in WAL mode
/// - `wal_autocheckpoint = 1000` pages keeps the WAL file bounded
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16_000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    Ok(())
}
