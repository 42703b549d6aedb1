//! Read queries over the fact tables
//!
//! Every read takes an optional `TxScope`. With a scope the query runs on the
//! caller's transaction; without one it checks a connection out of the pool.
//! Each read is exactly one statement against the fact table `kind` selects.

use super::db::{ConnectionPool, StoreError};
use super::transactor::TxScope;
use super::types::{Dynamic, EventKind, TopDimension};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::sync::Arc;

pub struct StatisticsRepository {
    pool: Arc<ConnectionPool>,
}

impl StatisticsRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Events of `kind` recorded for `post_id`; 0 when there are none
    pub fn count(&self, scope: Option<&TxScope<'_>>, kind: EventKind, post_id: i32) -> Result<i32, StoreError> {
        self.with_connection(scope, |conn| {
            let total: i64 = conn
                .prepare_cached(kind.fact_table().count_sql)?
                .query_row(params![post_id], |row| row.get(0))?;
            to_i32(total)
        })
    }

    /// Daily counts for `post_id`, ascending by date
    pub fn dynamic(
        &self,
        scope: Option<&TxScope<'_>>,
        kind: EventKind,
        post_id: i32,
    ) -> Result<Vec<Dynamic>, StoreError> {
        self.with_connection(scope, |conn| {
            let mut stmt = conn.prepare_cached(kind.fact_table().dynamic_sql)?;
            let rows = stmt
                .query_map(params![post_id], |row| {
                    Ok((row.get::<_, NaiveDate>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(date, count)| Ok(Dynamic { date, count: to_i32(count)? }))
                .collect()
        })
    }

    /// Up to 10 post or user ids with the most events, highest first.
    /// Equal counts are ordered by ascending id.
    pub fn top(
        &self,
        scope: Option<&TxScope<'_>>,
        kind: EventKind,
        dimension: TopDimension,
    ) -> Result<Vec<i32>, StoreError> {
        self.with_connection(scope, |conn| {
            let mut stmt = conn.prepare_cached(kind.fact_table().top_sql(dimension))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i32>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn with_connection<T, F>(&self, scope: Option<&TxScope<'_>>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        match scope {
            Some(scope) => f(scope.connection()),
            None => {
                let conn = self.pool.get()?;
                f(&*conn)
            }
        }
    }
}

fn to_i32(value: i64) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Conversion(format!("count {} exceeds i32", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::transactor::{QueryContext, Transactor, TxBeginner};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<ConnectionPool>, StatisticsRepository) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("store.db"), 2).unwrap();
        {
            let conn = pool.get().unwrap();
            for kind in EventKind::ALL {
                conn.execute_batch(kind.fact_table().create_sql).unwrap();
            }
        }
        let repo = StatisticsRepository::new(Arc::clone(&pool));
        (dir, pool, repo)
    }

    fn insert(pool: &Arc<ConnectionPool>, kind: EventKind, post_id: i32, user_id: i32, day: u32, hour: u32) {
        let time = Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap();
        pool.get()
            .unwrap()
            .execute(
                kind.fact_table().insert_sql,
                params![time.timestamp(), user_id, post_id, 202403],
            )
            .unwrap();
    }

    #[test]
    fn test_empty_results_are_not_errors() {
        let (_dir, _pool, repo) = setup();
        for kind in EventKind::ALL {
            assert_eq!(repo.count(None, kind, 42).unwrap(), 0);
            assert!(repo.dynamic(None, kind, 42).unwrap().is_empty());
            assert!(repo.top(None, kind, TopDimension::Post).unwrap().is_empty());
        }
    }

    #[test]
    fn test_count_is_scoped_to_kind_and_post() {
        let (_dir, pool, repo) = setup();
        insert(&pool, EventKind::Like, 1, 10, 1, 9);
        insert(&pool, EventKind::Like, 1, 11, 1, 10);
        insert(&pool, EventKind::Like, 2, 10, 1, 11);
        insert(&pool, EventKind::View, 1, 10, 1, 12);

        assert_eq!(repo.count(None, EventKind::Like, 1).unwrap(), 2);
        assert_eq!(repo.count(None, EventKind::Like, 2).unwrap(), 1);
        assert_eq!(repo.count(None, EventKind::View, 1).unwrap(), 1);
        assert_eq!(repo.count(None, EventKind::Comment, 1).unwrap(), 0);
    }

    #[test]
    fn test_dynamic_buckets_by_day_ascending() {
        let (_dir, pool, repo) = setup();
        // 6 events over 3 days, inserted out of order
        for (day, hour) in [(5, 8), (2, 23), (5, 9), (2, 0), (9, 12), (5, 10)] {
            insert(&pool, EventKind::View, 3, 1, day, hour);
        }

        let series = repo.dynamic(None, EventKind::View, 3).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.iter().map(|d| d.count).sum::<i32>(), 6);
        assert!(series.windows(2).all(|w| w[0].date < w[1].date));
        assert_eq!(series[0].date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(series[1].count, 3);
    }

    #[test]
    fn test_top_limits_and_orders() {
        let (_dir, pool, repo) = setup();
        // post p gets p events, for p in 1..=12
        for post_id in 1..=12 {
            for hour in 0..post_id {
                insert(&pool, EventKind::Comment, post_id, 100 + hour as i32, 1, hour as u32);
            }
        }

        let top = repo.top(None, EventKind::Comment, TopDimension::Post).unwrap();
        assert_eq!(top.len(), 10);
        assert_eq!(top, vec![12, 11, 10, 9, 8, 7, 6, 5, 4, 3]);

        // user 100 commented on all 12 posts
        let users = repo.top(None, EventKind::Comment, TopDimension::User).unwrap();
        assert_eq!(users[0], 100);
    }

    #[test]
    fn test_top_ties_break_by_ascending_id() {
        let (_dir, pool, repo) = setup();
        for post_id in [30, 10, 20] {
            insert(&pool, EventKind::Like, post_id, 1, 1, 0);
        }
        insert(&pool, EventKind::Like, 40, 1, 1, 0);
        insert(&pool, EventKind::Like, 40, 2, 1, 1);

        let top = repo.top(None, EventKind::Like, TopDimension::Post).unwrap();
        assert_eq!(top, vec![40, 10, 20, 30]);
    }

    #[test]
    fn test_missing_table_propagates_error() {
        let (_dir, pool, repo) = setup();
        pool.get().unwrap().execute_batch("DROP TABLE views").unwrap();
        assert!(matches!(
            repo.count(None, EventKind::View, 1),
            Err(StoreError::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_use_supplied_transaction() {
        let (_dir, pool, repo) = setup();
        let repo = Arc::new(repo);
        let transactor = TxBeginner::new(Arc::clone(&pool));
        let ctx = QueryContext::background();

        let reader = Arc::clone(&repo);
        let seen = transactor
            .with_transaction_value(&ctx, move |scope| {
                // Uncommitted write is only visible on the same transaction
                scope.connection().execute(
                    EventKind::Like.fact_table().insert_sql,
                    params![0, 1, 5, 197001],
                )?;
                reader.count(Some(scope), EventKind::Like, 5)
            })
            .await
            .unwrap();

        assert_eq!(seen, 1);
    }
}
