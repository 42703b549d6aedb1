//! # Engagement statistics pipeline
//!
//! Likes, views and comments flow from producers into a durable log, are
//! staged and materialized into per-kind fact tables, and are served back as
//! counts, daily series and top-10 rankings.
//!
//! ## Write path
//!
//! ```text
//! EventProducer ──► SqliteEventLog (<kind>-topic)
//!                       │
//!                       ▼
//!                StagingRelation (<kind>kafka) ──► Materializer (<kind>mw) ──► fact table (<kind>)
//! ```
//!
//! ## Read path
//!
//! ```text
//! QueryService ──► AggregationEngine ──► Transactor ──► StatisticsRepository ──► fact tables
//! ```
//!
//! `Provisioner::bootstrap` creates every object on the write path before the
//! query service starts, and is safe to run repeatedly.
//!
//! ## Module Organization
//!
//! - `types` - Events, kinds and query result shapes
//! - `config` - Environment-driven runtime configuration
//! - `schema` - Fact table DDL and compile-time query sets
//! - `db` - Store connection pool and `StoreError`
//! - `broker` - SQLite-backed durable log with consumer offsets
//! - `producer` - Event emission into the log
//! - `staging` - Ingestion bridge with malformed-record tolerance
//! - `materializer` - Continuous staging → fact table transform
//! - `error_handler` - Retry backoff for background tasks
//! - `bootstrap` - Idempotent topology provisioning
//! - `transactor` - Scoped transactions with cancellation
//! - `repository` - Single-statement fact table reads
//! - `engine` - Composite read operations
//! - `service` - JSON-lines RPC surface

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod db;
pub mod engine;
pub mod error_handler;
pub mod materializer;
pub mod producer;
pub mod repository;
pub mod schema;
pub mod service;
pub mod staging;
pub mod transactor;
pub mod types;

// Re-export commonly used types
pub use bootstrap::{ProvisionError, Provisioner, TopicState, Topology};
pub use broker::{LogError, SqliteEventLog, TopicSpec};
pub use config::{ConfigError, PipelineConfig};
pub use db::{ConnectionPool, StoreError};
pub use engine::AggregationEngine;
pub use materializer::Materializer;
pub use producer::{EventProducer, EventSink, LoggedSink, ProducerError};
pub use repository::StatisticsRepository;
pub use service::{serve, QueryService, StatisticsRequest, StatisticsResponse};
pub use transactor::{QueryContext, Transactor, TxBeginner, TxScope};
pub use types::{Dynamic, EngagementSummary, Event, EventKind, TopDimension};
