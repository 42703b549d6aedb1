//! Emit one engagement event into the durable log
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin postflow_emit -- <like|view|comment> <post_id> <user_id> [rfc3339]
//! ```
//!
//! The event time defaults to now. The topic is created with the configured
//! partition count if it does not exist yet.
//!
//! ## Environment Variables
//!
//! - `POSTFLOW_BROKER_PATH` - Durable log path (default: data/broker.db)
//! - `TOPIC_PARTITIONS` - Partitions for a newly created topic (default: 1)
//! - `RUST_LOG` - Log level (default: info)

use chrono::{DateTime, Utc};
use dotenv::dotenv;
use log::info;
use postflow::pipeline::{
    Event, EventKind, EventProducer, LoggedSink, PipelineConfig, SqliteEventLog, TopicSpec,
};
use std::sync::Arc;

const USAGE: &str = "Usage: postflow_emit <like|view|comment> <post_id> <user_id> [rfc3339]";

struct EmitArgs {
    kind: EventKind,
    event: Event,
}

impl EmitArgs {
    fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.len() < 3 || args.len() > 4 {
            return Err(USAGE.into());
        }

        let kind: EventKind = serde_json::from_value(serde_json::Value::String(args[0].to_lowercase()))
            .map_err(|_| format!("Unknown event kind: {}. {}", args[0], USAGE))?;
        let post_id: i32 = args[1]
            .parse()
            .map_err(|_| format!("Invalid post_id: {}", args[1]))?;
        let user_id: i32 = args[2]
            .parse()
            .map_err(|_| format!("Invalid user_id: {}", args[2]))?;
        let time = match args.get(3) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| format!("Invalid time {}: {}", raw, e))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };

        Ok(Self {
            kind,
            event: Event::new(post_id, user_id, time),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = EmitArgs::from_args()?;
    let config = PipelineConfig::from_env()?;

    let log = Arc::new(SqliteEventLog::open(&config.provisioning.broker_path)?);
    log.create_topic(&TopicSpec {
        name: args.kind.topic().to_string(),
        partitions: config.provisioning.partitions,
        replication_factor: config.provisioning.replication_factor,
    })?;

    let producer = EventProducer::new(LoggedSink::new(log));
    let position = producer.send_event(args.kind, &args.event).await?;

    info!(
        "✅ {} event for post {} by user {} at {} → {} (partition {}, offset {})",
        args.kind,
        args.event.post_id,
        args.event.user_id,
        args.event.time.to_rfc3339(),
        args.kind.topic(),
        position.partition,
        position.offset
    );

    Ok(())
}
