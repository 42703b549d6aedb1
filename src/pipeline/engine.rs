//! Aggregation engine
//!
//! Composes repository reads into the operations the query service exposes.
//! Each repository read runs as its own coordinated read through the
//! `Transactor`; a composite operation fails as a whole if any of its reads
//! fails, and never returns a partial result.

use super::db::StoreError;
use super::repository::StatisticsRepository;
use super::transactor::{QueryContext, Transactor};
use super::types::{Dynamic, EngagementSummary, EventKind, TopDimension};
use std::sync::Arc;

pub struct AggregationEngine<T: Transactor> {
    transactor: T,
    repository: Arc<StatisticsRepository>,
}

impl<T: Transactor> AggregationEngine<T> {
    pub fn new(transactor: T, repository: Arc<StatisticsRepository>) -> Self {
        Self { transactor, repository }
    }

    /// Likes, views and comments for `post_id`
    pub async fn engagement_summary(
        &self,
        ctx: &QueryContext,
        post_id: i32,
    ) -> Result<EngagementSummary, StoreError> {
        let likes = self.count(ctx, EventKind::Like, post_id).await?;
        let views = self.count(ctx, EventKind::View, post_id).await?;
        let comments = self.count(ctx, EventKind::Comment, post_id).await?;

        Ok(EngagementSummary { likes, views, comments })
    }

    pub async fn dynamic(
        &self,
        ctx: &QueryContext,
        kind: EventKind,
        post_id: i32,
    ) -> Result<Vec<Dynamic>, StoreError> {
        let repository = Arc::clone(&self.repository);
        self.transactor
            .with_transaction_value(ctx, move |scope| repository.dynamic(Some(scope), kind, post_id))
            .await
    }

    pub async fn top_posts(&self, ctx: &QueryContext, kind: EventKind) -> Result<Vec<i32>, StoreError> {
        self.top(ctx, kind, TopDimension::Post).await
    }

    pub async fn top_users(&self, ctx: &QueryContext, kind: EventKind) -> Result<Vec<i32>, StoreError> {
        self.top(ctx, kind, TopDimension::User).await
    }

    pub async fn top(
        &self,
        ctx: &QueryContext,
        kind: EventKind,
        dimension: TopDimension,
    ) -> Result<Vec<i32>, StoreError> {
        let repository = Arc::clone(&self.repository);
        self.transactor
            .with_transaction_value(ctx, move |scope| repository.top(Some(scope), kind, dimension))
            .await
    }

    async fn count(&self, ctx: &QueryContext, kind: EventKind, post_id: i32) -> Result<i32, StoreError> {
        let repository = Arc::clone(&self.repository);
        self.transactor
            .with_transaction_value(ctx, move |scope| repository.count(Some(scope), kind, post_id))
            .await
    }
}
