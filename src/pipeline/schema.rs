//! Fact table descriptors and provisioning metadata DDL
//!
//! Each event kind owns one fact table. Every query the pipeline runs against
//! a fact table is assembled at compile time by `fact_table!`, so the table
//! name is never a bind parameter and no SQL is formatted at runtime.
//!
//! Fact table layout:
//!
//! | column    | type    | notes                          |
//! |-----------|---------|--------------------------------|
//! | `time`    | INTEGER | unix seconds, UTC              |
//! | `user_id` | INTEGER |                                |
//! | `post_id` | INTEGER |                                |
//! | `month`   | INTEGER | `YYYYMM` partition key         |
//!
//! Indexes on `(month, time)` prune by month range and keep rows in time
//! order; `(post_id, time)` serves the per-post count and dynamic reads.

use super::types::{EventKind, TopDimension};

/// Compile-time query set for one fact table
#[derive(Debug)]
pub struct FactTable {
    pub name: &'static str,
    pub create_sql: &'static str,
    pub insert_sql: &'static str,
    pub count_sql: &'static str,
    pub dynamic_sql: &'static str,
    pub top_posts_sql: &'static str,
    pub top_users_sql: &'static str,
}

impl FactTable {
    pub fn top_sql(&self, dimension: TopDimension) -> &'static str {
        match dimension {
            TopDimension::Post => self.top_posts_sql,
            TopDimension::User => self.top_users_sql,
        }
    }
}

macro_rules! fact_table {
    ($name:literal) => {
        FactTable {
            name: $name,
            create_sql: concat!(
                "CREATE TABLE IF NOT EXISTS ", $name, " (
                    time    INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    post_id INTEGER NOT NULL,
                    month   INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_", $name, "_month_time ON ", $name, " (month, time);
                CREATE INDEX IF NOT EXISTS idx_", $name, "_post_time ON ", $name, " (post_id, time);"
            ),
            insert_sql: concat!(
                "INSERT INTO ", $name, " (time, user_id, post_id, month) VALUES (?1, ?2, ?3, ?4)"
            ),
            count_sql: concat!("SELECT COUNT(*) FROM ", $name, " WHERE post_id = ?1"),
            dynamic_sql: concat!(
                "SELECT date(time, 'unixepoch') AS day, COUNT(*) AS total
                 FROM ", $name, "
                 WHERE post_id = ?1
                 GROUP BY day
                 ORDER BY day ASC"
            ),
            top_posts_sql: concat!(
                "SELECT post_id, COUNT(*) AS total
                 FROM ", $name, "
                 GROUP BY post_id
                 ORDER BY total DESC, post_id ASC
                 LIMIT 10"
            ),
            top_users_sql: concat!(
                "SELECT user_id, COUNT(*) AS total
                 FROM ", $name, "
                 GROUP BY user_id
                 ORDER BY total DESC, user_id ASC
                 LIMIT 10"
            ),
        }
    };
}

pub static LIKES: FactTable = fact_table!("likes");
pub static VIEWS: FactTable = fact_table!("views");
pub static COMMENTS: FactTable = fact_table!("comments");

impl EventKind {
    pub fn fact_table(&self) -> &'static FactTable {
        match self {
            EventKind::Like => &LIKES,
            EventKind::View => &VIEWS,
            EventKind::Comment => &COMMENTS,
        }
    }
}

/// Provisioning metadata kept alongside the fact tables
pub const METADATA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS staging_relations (
        name                 TEXT PRIMARY KEY,
        topic                TEXT NOT NULL,
        consumer_group       TEXT NOT NULL,
        format               TEXT NOT NULL,
        skip_broken_messages INTEGER NOT NULL,
        created_at           INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS materializers (
        name       TEXT PRIMARY KEY,
        source     TEXT NOT NULL,
        target     TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
";

pub const REGISTER_STAGING_SQL: &str = "
    INSERT OR IGNORE INTO staging_relations
        (name, topic, consumer_group, format, skip_broken_messages, created_at)
    VALUES (?1, ?2, ?3, 'JSONEachRow', ?4, ?5)";

pub const REGISTER_MATERIALIZER_SQL: &str = "
    INSERT OR IGNORE INTO materializers (name, source, target, created_at)
    VALUES (?1, ?2, ?3, ?4)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_selects_table() {
        assert_eq!(EventKind::Like.fact_table().name, "likes");
        assert_eq!(EventKind::View.fact_table().name, "views");
        assert_eq!(EventKind::Comment.fact_table().name, "comments");
    }

    #[test]
    fn test_queries_target_own_table() {
        for kind in EventKind::ALL {
            let table = kind.fact_table();
            let from = format!("FROM {}", table.name);
            assert!(table.count_sql.contains(&from));
            assert!(table.dynamic_sql.contains(&from));
            assert!(table.top_sql(TopDimension::Post).contains("GROUP BY post_id"));
            assert!(table.top_sql(TopDimension::User).contains("GROUP BY user_id"));
            assert!(table.insert_sql.starts_with(&format!("INSERT INTO {} ", table.name)));
        }
    }
}
