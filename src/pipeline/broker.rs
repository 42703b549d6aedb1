//! Embedded durable log
//!
//! Append-only, partitioned topics stored in their own SQLite file, with
//! consumer-group offsets tracked per partition. Producers append through
//! `EventSink`; staging relations read through `fetch` and acknowledge with
//! `commit`. Offsets are committed separately from fact-table writes, which
//! gives at-least-once delivery into the analytical store.

use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const BROKER_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS topics (
        name               TEXT PRIMARY KEY,
        partitions         INTEGER NOT NULL,
        replication_factor INTEGER NOT NULL,
        created_at         INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS records (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        topic         TEXT NOT NULL,
        partition_id  INTEGER NOT NULL,
        record_offset INTEGER NOT NULL,
        payload       BLOB NOT NULL,
        appended_at   INTEGER NOT NULL,
        UNIQUE (topic, partition_id, record_offset)
    );
    CREATE TABLE IF NOT EXISTS consumer_offsets (
        consumer_group TEXT NOT NULL,
        topic          TEXT NOT NULL,
        partition_id   INTEGER NOT NULL,
        next_offset    INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL,
        PRIMARY KEY (consumer_group, topic, partition_id)
    );
";

#[derive(Debug)]
pub enum LogError {
    Io(std::io::Error),
    Database(rusqlite::Error),
    UnknownTopic(String),
    Poisoned,
    Task(String),
}

impl From<rusqlite::Error> for LogError {
    fn from(err: rusqlite::Error) -> Self {
        LogError::Database(err)
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io(e) => write!(f, "IO error: {}", e),
            LogError::Database(e) => write!(f, "Database error: {}", e),
            LogError::UnknownTopic(t) => write!(f, "Unknown topic: {}", t),
            LogError::Poisoned => write!(f, "Log connection lock poisoned"),
            LogError::Task(e) => write!(f, "Log task failed: {}", e),
        }
    }
}

impl std::error::Error for LogError {}

/// Topic definition as provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u32,
}

/// Where an appended record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: i64,
}

/// Committed record pulled from a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// SQLite-backed durable log
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// Open (or create) the log database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(LogError::Io)?;
            }
        }

        let conn = Connection::open(path)?;
        apply_optimized_pragmas(&conn)?;
        conn.execute_batch(BROKER_SCHEMA)?;

        log::info!("📬 Durable log opened: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LogError> {
        self.conn.lock().map_err(|_| LogError::Poisoned)
    }

    /// Create a topic if absent
    ///
    /// Returns `true` when the topic was created by this call. An existing
    /// topic keeps its partition count even if `spec` differs.
    pub fn create_topic(&self, spec: &TopicSpec) -> Result<bool, LogError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO topics (name, partitions, replication_factor, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                spec.name,
                spec.partitions,
                spec.replication_factor,
                chrono::Utc::now().timestamp()
            ],
        )?;

        if inserted == 0 {
            let existing: u32 = conn.query_row(
                "SELECT partitions FROM topics WHERE name = ?1",
                [&spec.name],
                |row| row.get(0),
            )?;
            if existing != spec.partitions {
                log::warn!(
                    "⚠️  Topic {} already has {} partitions, ignoring requested {}",
                    spec.name,
                    existing,
                    spec.partitions
                );
            }
        }

        Ok(inserted > 0)
    }

    pub fn topic(&self, name: &str) -> Result<Option<TopicSpec>, LogError> {
        let conn = self.lock()?;
        let spec = conn
            .query_row(
                "SELECT name, partitions, replication_factor FROM topics WHERE name = ?1",
                [name],
                |row| {
                    Ok(TopicSpec {
                        name: row.get(0)?,
                        partitions: row.get(1)?,
                        replication_factor: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(spec)
    }

    pub fn list_topics(&self) -> Result<Vec<TopicSpec>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, partitions, replication_factor FROM topics ORDER BY name",
        )?;
        let topics = stmt
            .query_map([], |row| {
                Ok(TopicSpec {
                    name: row.get(0)?,
                    partitions: row.get(1)?,
                    replication_factor: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(topics)
    }

    /// Append one record, choosing the partition by payload hash
    pub fn append(&self, topic: &str, payload: &[u8]) -> Result<RecordPosition, LogError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let partitions: u32 = tx
            .query_row("SELECT partitions FROM topics WHERE name = ?1", [topic], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;

        let partition = adler32(payload) % partitions.max(1);
        let offset: i64 = tx.query_row(
            "SELECT COALESCE(MAX(record_offset) + 1, 0) FROM records
             WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO records (topic, partition_id, record_offset, payload, appended_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![topic, partition, offset, payload, chrono::Utc::now().timestamp()],
        )?;
        tx.commit()?;

        Ok(RecordPosition { partition, offset })
    }

    /// Records past the group's committed offsets, oldest first
    ///
    /// Within each partition the returned records form a contiguous prefix
    /// of the uncommitted tail, so committing the highest offset seen per
    /// partition never skips a record.
    pub fn fetch(&self, group: &str, topic: &str, max: usize) -> Result<Vec<LogRecord>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT r.partition_id, r.record_offset, r.payload
             FROM records r
             LEFT JOIN consumer_offsets c
               ON c.consumer_group = ?1 AND c.topic = r.topic AND c.partition_id = r.partition_id
             WHERE r.topic = ?2 AND r.record_offset >= COALESCE(c.next_offset, 0)
             ORDER BY r.seq ASC
             LIMIT ?3",
        )?;

        let records = stmt
            .query_map(params![group, topic, max as i64], |row| {
                Ok(LogRecord {
                    partition: row.get(0)?,
                    offset: row.get(1)?,
                    payload: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record that `group` has consumed everything before `next_offset`
    pub fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> Result<(), LogError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO consumer_offsets (consumer_group, topic, partition_id, next_offset, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(consumer_group, topic, partition_id) DO UPDATE SET
                next_offset = MAX(next_offset, excluded.next_offset),
                updated_at = excluded.updated_at",
            params![group, topic, partition, next_offset, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Number of records the group has not yet committed
    pub fn lag(&self, group: &str, topic: &str) -> Result<i64, LogError> {
        let conn = self.lock()?;
        let lag = conn.query_row(
            "SELECT COUNT(*)
             FROM records r
             LEFT JOIN consumer_offsets c
               ON c.consumer_group = ?1 AND c.topic = r.topic AND c.partition_id = r.partition_id
             WHERE r.topic = ?2 AND r.record_offset >= COALESCE(c.next_offset, 0)",
            params![group, topic],
            |row| row.get(0),
        )?;
        Ok(lag)
    }
}

/// Adler-32 checksum, used as the partitioning hash
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
