//! Ingestion bridge: staging relations over log topics
//!
//! A staging relation pulls committed records for its topic under a
//! dedicated consumer group and exposes them as `StagingRow`s. Records that
//! fail to parse are dropped and logged; their offsets are committed with the
//! rest of the batch, so a bad payload never blocks the records behind it.
//! More than `skip_broken_messages` drops in one batch is logged at `error`.
//! Offsets are only committed through `acknowledge`, after the rows have been
//! stored downstream.

use super::broker::{LogError, LogRecord, SqliteEventLog};
use super::types::{EventKind, StagingRow};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug)]
pub enum BridgeError {
    Log(LogError),
}

impl From<LogError> for BridgeError {
    fn from(err: LogError) -> Self {
        BridgeError::Log(err)
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Log(e) => write!(f, "Log error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Why a record was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord(pub String);

impl std::fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound JSON before timestamp normalization
#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "PostId")]
    post_id: i32,
    #[serde(rename = "UserId")]
    user_id: i32,
    #[serde(rename = "Time")]
    time: serde_json::Value,
}

/// Parse one log payload into a staging row
pub fn parse_record(payload: &[u8]) -> Result<StagingRow, MalformedRecord> {
    let raw: RawEvent =
        serde_json::from_slice(payload).map_err(|e| MalformedRecord(e.to_string()))?;
    let time = parse_time(&raw.time)
        .ok_or_else(|| MalformedRecord(format!("unparseable Time: {}", raw.time)))?;

    Ok(StagingRow {
        time,
        user_id: raw.user_id,
        post_id: raw.post_id,
    })
}

/// Best-effort timestamp: RFC3339, `YYYY-MM-DD HH:MM:SS` (UTC) or unix seconds
fn parse_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        }
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

/// Rows pulled in one poll, plus the offsets to commit once they are stored
#[derive(Debug, Default)]
pub struct StagedBatch {
    pub rows: Vec<StagingRow>,
    pub dropped: usize,
    /// partition → next offset to consume
    pub commits: BTreeMap<u32, i64>,
}

impl StagedBatch {
    /// Number of log records covered by this batch (kept and dropped)
    pub fn consumed(&self) -> usize {
        self.rows.len() + self.dropped
    }
}

/// Staging relation bound to one topic
#[derive(Debug, Clone)]
pub struct StagingRelation {
    pub name: String,
    pub topic: String,
    pub consumer_group: String,
    pub skip_broken_messages: usize,
}

impl StagingRelation {
    pub fn for_kind(kind: EventKind, skip_broken_messages: usize) -> Self {
        Self {
            name: kind.staging_name().to_string(),
            topic: kind.topic().to_string(),
            consumer_group: kind.consumer_group(),
            skip_broken_messages,
        }
    }

    /// Pull up to `max` uncommitted records and parse them
    pub fn poll(&self, log: &SqliteEventLog, max: usize) -> Result<StagedBatch, BridgeError> {
        let records = log.fetch(&self.consumer_group, &self.topic, max)?;
        self.stage(records)
    }

    fn stage(&self, records: Vec<LogRecord>) -> Result<StagedBatch, BridgeError> {
        let mut batch = StagedBatch::default();

        for record in records {
            match parse_record(&record.payload) {
                Ok(row) => batch.rows.push(row),
                Err(reason) => {
                    batch.dropped += 1;
                    log::warn!(
                        "⚠️  {}: dropping malformed record (partition {}, offset {}): {}",
                        self.name,
                        record.partition,
                        record.offset,
                        reason
                    );
                }
            }
            let next = batch.commits.entry(record.partition).or_insert(0);
            *next = (*next).max(record.offset + 1);
        }

        if batch.dropped > self.skip_broken_messages {
            log::error!(
                "❌ {}: {} malformed records in one batch (tolerance {}), skipped past them",
                self.name,
                batch.dropped,
                self.skip_broken_messages
            );
        }

        Ok(batch)
    }

    /// Commit the batch's offsets so its records are not redelivered
    pub fn acknowledge(&self, log: &SqliteEventLog, batch: &StagedBatch) -> Result<(), BridgeError> {
        for (&partition, &next_offset) in &batch.commits {
            log.commit(&self.consumer_group, &self.topic, partition, next_offset)?;
        }
        Ok(())
    }
}
