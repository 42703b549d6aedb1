//! Continuous transform from a staging relation into its fact table
//!
//! Each cycle:
//! 1. Polls the staging relation for uncommitted records
//! 2. Appends the parsed rows to the fact table in one store transaction
//! 3. Commits the consumer offsets for every record in the batch
//!
//! A crash between 2 and 3 redelivers the batch, so the fact table sees every
//! record at least once. Full batches are drained back to back; otherwise the
//! task idles for the poll interval.

use super::broker::SqliteEventLog;
use super::config::IngestConfig;
use super::db::{ConnectionPool, StoreError};
use super::error_handler::ExponentialBackoff;
use super::staging::{BridgeError, StagingRelation};
use super::types::{EventKind, StagingRow};
use rusqlite::params;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum MaterializeError {
    Bridge(BridgeError),
    Store(StoreError),
    Task(String),
}

impl From<BridgeError> for MaterializeError {
    fn from(err: BridgeError) -> Self {
        MaterializeError::Bridge(err)
    }
}

impl From<StoreError> for MaterializeError {
    fn from(err: StoreError) -> Self {
        MaterializeError::Store(err)
    }
}

impl std::fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterializeError::Bridge(e) => write!(f, "Bridge error: {}", e),
            MaterializeError::Store(e) => write!(f, "Store error: {}", e),
            MaterializeError::Task(e) => write!(f, "Task error: {}", e),
        }
    }
}

impl std::error::Error for MaterializeError {}

pub struct Materializer {
    name: String,
    kind: EventKind,
    relation: StagingRelation,
    log: Arc<SqliteEventLog>,
    pool: Arc<ConnectionPool>,
    batch_size: usize,
    poll_interval: Duration,
}

impl Materializer {
    pub fn new(
        kind: EventKind,
        relation: StagingRelation,
        log: Arc<SqliteEventLog>,
        pool: Arc<ConnectionPool>,
        ingest: &IngestConfig,
    ) -> Self {
        Self {
            name: kind.materializer_name().to_string(),
            kind,
            relation,
            log,
            pool,
            batch_size: ingest.batch_size.max(1),
            poll_interval: ingest.poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn relation(&self) -> &StagingRelation {
        &self.relation
    }

    /// Records still waiting in the topic for this materializer
    pub fn lag(&self) -> Result<i64, MaterializeError> {
        self.log
            .lag(&self.relation.consumer_group, &self.relation.topic)
            .map_err(|e| MaterializeError::Bridge(BridgeError::Log(e)))
    }

    /// Run one poll/append/acknowledge cycle; returns log records consumed
    pub fn step(&self) -> Result<usize, MaterializeError> {
        let batch = self.relation.poll(&self.log, self.batch_size)?;
        if batch.consumed() == 0 {
            return Ok(0);
        }

        self.append(&batch.rows)?;
        self.relation.acknowledge(&self.log, &batch)?;

        log::debug!(
            "✅ {}: appended {} rows to {} ({} dropped)",
            self.name,
            batch.rows.len(),
            self.kind.fact_table().name,
            batch.dropped
        );

        Ok(batch.consumed())
    }

    fn append(&self, rows: &[StagingRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction().map_err(StoreError::Begin)?;
        {
            let mut stmt = tx.prepare_cached(self.kind.fact_table().insert_sql)?;
            for row in rows {
                stmt.execute(params![row.time.timestamp(), row.user_id, row.post_id, row.month()])?;
            }
        }
        tx.commit().map_err(StoreError::Commit)?;
        Ok(())
    }

    /// Drive the transform until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        log::info!(
            "🚀 {} materializing {} → {}",
            self.name,
            self.relation.name,
            self.kind.fact_table().name
        );

        let mut backoff = ExponentialBackoff::new(
            self.poll_interval.max(Duration::from_millis(100)),
            Duration::from_secs(30),
            8,
        );
        let mut consumed_since_log = 0usize;
        let mut last_log_time = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let this = Arc::clone(&self);
            let outcome = tokio::task::spawn_blocking(move || this.step())
                .await
                .unwrap_or_else(|e| Err(MaterializeError::Task(e.to_string())));

            match outcome {
                Ok(consumed) => {
                    backoff.reset();
                    consumed_since_log += consumed;

                    if last_log_time.elapsed().as_secs() >= 10 && consumed_since_log > 0 {
                        log::info!("📊 {}: {} records materialized", self.name, consumed_since_log);
                        consumed_since_log = 0;
                        last_log_time = Instant::now();
                    }

                    if consumed >= self.batch_size {
                        continue;
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    log::error!("❌ {} cycle failed: {}", self.name, e);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        retry = backoff.sleep_capped() => {
                            if let Err(exhausted) = retry {
                                log::error!(
                                    "❌ {}: {}, retrying every {}s",
                                    self.name,
                                    exhausted,
                                    backoff.max_delay().as_secs()
                                );
                            }
                        }
                    }
                }
            }
        }

        log::info!("✅ {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::broker::TopicSpec;
    use crate::pipeline::schema::METADATA_SQL;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn setup(kind: EventKind, batch_size: usize) -> (tempfile::TempDir, Arc<Materializer>) {
        let dir = tempdir().unwrap();
        let log = Arc::new(SqliteEventLog::open(dir.path().join("broker.db")).unwrap());
        log.create_topic(&TopicSpec {
            name: kind.topic().to_string(),
            partitions: 1,
            replication_factor: 1,
        })
        .unwrap();

        let pool = ConnectionPool::open(dir.path().join("store.db"), 2).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch(METADATA_SQL).unwrap();
            conn.execute_batch(kind.fact_table().create_sql).unwrap();
        }

        let ingest = IngestConfig {
            poll_interval: Duration::from_millis(10),
            batch_size,
            skip_broken_messages: 1,
        };
        let materializer = Materializer::new(
            kind,
            StagingRelation::for_kind(kind, ingest.skip_broken_messages),
            log,
            pool,
            &ingest,
        );
        (dir, Arc::new(materializer))
    }

    fn append_like(m: &Materializer, post_id: i32, day: u32) {
        let event = crate::pipeline::types::Event::new(
            post_id,
            1,
            Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
        );
        m.log
            .append(m.kind.topic(), &serde_json::to_vec(&event).unwrap())
            .unwrap();
    }

    fn fact_count(m: &Materializer) -> i64 {
        let conn = m.pool.get().unwrap();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", m.kind.fact_table().name),
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_step_appends_and_commits() {
        let (_dir, m) = setup(EventKind::Like, 100);
        append_like(&m, 7, 1);
        append_like(&m, 7, 2);

        assert_eq!(m.lag().unwrap(), 2);
        assert_eq!(m.step().unwrap(), 2);
        assert_eq!(fact_count(&m), 2);
        assert_eq!(m.lag().unwrap(), 0);

        // Nothing new: no-op
        assert_eq!(m.step().unwrap(), 0);
        assert_eq!(fact_count(&m), 2);
    }

    #[test]
    fn test_step_writes_month_partition_key() {
        let (_dir, m) = setup(EventKind::Like, 100);
        append_like(&m, 7, 15);
        m.step().unwrap();

        let conn = m.pool.get().unwrap();
        let (time, month): (i64, i32) = conn
            .query_row("SELECT time, month FROM likes", [], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        assert_eq!(month, 202401);
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap().timestamp());
    }

    #[test]
    fn test_step_respects_batch_size() {
        let (_dir, m) = setup(EventKind::View, 2);
        for day in 1..=5 {
            append_like(&m, 1, day);
        }

        assert_eq!(m.step().unwrap(), 2);
        assert_eq!(m.step().unwrap(), 2);
        assert_eq!(m.step().unwrap(), 1);
        assert_eq!(fact_count(&m), 5);
    }

    #[test]
    fn test_step_counts_valid_records_behind_malformed_ones() {
        let (_dir, m) = setup(EventKind::View, 100);
        m.log
            .append(m.kind.topic(), br#"{"UserId":3,"Time":"2024-01-01T10:00:00Z"}"#)
            .unwrap();
        m.log
            .append(m.kind.topic(), br#"{"UserId":4,"Time":"2024-01-01T10:30:00Z"}"#)
            .unwrap();
        append_like(&m, 11, 1);

        assert_eq!(m.step().unwrap(), 3);
        assert_eq!(fact_count(&m), 1);
        assert_eq!(m.lag().unwrap(), 0);
        assert_eq!(m.step().unwrap(), 0);
    }

    #[test]
    fn test_failed_store_write_keeps_offsets() {
        let (_dir, m) = setup(EventKind::Comment, 100);
        append_like(&m, 1, 1);

        m.pool.get().unwrap().execute_batch("DROP TABLE comments").unwrap();
        assert!(matches!(m.step(), Err(MaterializeError::Store(_))));
        assert_eq!(m.lag().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (_dir, m) = setup(EventKind::Like, 100);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&m).run(shutdown.clone()));

        append_like(&m, 3, 1);
        append_like(&m, 3, 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while fact_count(&m) < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fact_count(&m), 2);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
