//! # postflow
//!
//! Engagement analytics for posts: likes, views and comments are appended to a
//! durable log, materialized continuously into per-kind fact tables, and read
//! back as counts, daily dynamics and top-10 rankings.
//!
//! ```text
//! EventProducer → SqliteEventLog (likes-topic, views-topic, comments-topic)
//!     ↓
//! StagingRelation (<kind>kafka, consumer group per topic)
//!     ↓
//! Materializer (<kind>mw)
//!     ↓
//! Fact tables (likes, views, comments)
//!     ↓
//! StatisticsRepository ← TxBeginner (scoped transactions)
//!     ↓
//! AggregationEngine → QueryService (JSON lines over TCP)
//! ```

pub mod pipeline;
pub mod sqlite_pragma;
