//! Core data structures shared across the pipeline

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of engagement event; selects topic, staging relation and fact table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[serde(alias = "likes")]
    Like,
    #[serde(alias = "views")]
    View,
    #[serde(alias = "comments")]
    Comment,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Like, EventKind::View, EventKind::Comment];

    /// Plural base name used by every provisioned object (`likes`, `views`, `comments`)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Like => "likes",
            EventKind::View => "views",
            EventKind::Comment => "comments",
        }
    }

    /// Durable log topic carrying this kind
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::Like => "likes-topic",
            EventKind::View => "views-topic",
            EventKind::Comment => "comments-topic",
        }
    }

    /// Staging relation bound to the topic
    pub fn staging_name(&self) -> &'static str {
        match self {
            EventKind::Like => "likeskafka",
            EventKind::View => "viewskafka",
            EventKind::Comment => "commentskafka",
        }
    }

    /// Continuous transform copying staging rows into the fact table
    pub fn materializer_name(&self) -> &'static str {
        match self {
            EventKind::Like => "likesmw",
            EventKind::View => "viewsmw",
            EventKind::Comment => "commentsmw",
        }
    }

    /// Consumer group the staging relation reads under
    pub fn consumer_group(&self) -> String {
        format!("postflow_{}_consumer", self.topic())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranking dimension for top-N queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopDimension {
    Post,
    User,
}

/// A single user action on a post
///
/// Serialized field names match the inbound wire schema:
/// `{"PostId": 7, "UserId": 3, "Time": "2024-01-01T10:00:00Z"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "PostId")]
    pub post_id: i32,
    #[serde(rename = "UserId")]
    pub user_id: i32,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl Event {
    pub fn new(post_id: i32, user_id: i32, time: DateTime<Utc>) -> Self {
        Self { post_id, user_id, time }
    }
}

/// Row exposed by a staging relation, ready to be appended to a fact table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRow {
    pub time: DateTime<Utc>,
    pub user_id: i32,
    pub post_id: i32,
}

impl StagingRow {
    /// Month partition key (`YYYYMM`)
    pub fn month(&self) -> i32 {
        self.time.year() * 100 + self.time.month() as i32
    }
}

impl From<Event> for StagingRow {
    fn from(event: Event) -> Self {
        Self {
            time: event.time,
            user_id: event.user_id,
            post_id: event.post_id,
        }
    }
}

/// Daily bucketed count for one post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dynamic {
    pub date: NaiveDate,
    pub count: i32,
}

/// Likes, views and comments for one post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub likes: i32,
    pub views: i32,
    pub comments: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_naming_convention() {
        assert_eq!(EventKind::Like.topic(), "likes-topic");
        assert_eq!(EventKind::View.staging_name(), "viewskafka");
        assert_eq!(EventKind::Comment.materializer_name(), "commentsmw");
        assert_eq!(EventKind::Comment.as_str(), "comments");
        assert_eq!(EventKind::Like.consumer_group(), "postflow_likes-topic_consumer");
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event::new(7, 3, Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["PostId"], 7);
        assert_eq!(json["UserId"], 3);
        assert_eq!(json["Time"], "2024-01-01T10:00:00Z");
    }

    #[test]
    fn test_kind_accepts_table_names() {
        let kind: EventKind = serde_json::from_str("\"views\"").unwrap();
        assert_eq!(kind, EventKind::View);
        let kind: EventKind = serde_json::from_str("\"comment\"").unwrap();
        assert_eq!(kind, EventKind::Comment);
    }

    #[test]
    fn test_month_partition_key() {
        let row = StagingRow {
            time: Utc.with_ymd_and_hms(2024, 11, 30, 23, 59, 59).unwrap(),
            user_id: 1,
            post_id: 2,
        };
        assert_eq!(row.month(), 202411);
    }
}
