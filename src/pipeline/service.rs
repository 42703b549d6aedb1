//! Query service: JSON-lines RPC over TCP
//!
//! One request per line, one response per line.
//!
//! ```text
//! > {"method":"GetEngagementSummary","params":{"post_id":7}}
//! < {"ok":{"likes":2,"views":0,"comments":0}}
//! > {"method":"GetDynamic","params":{"kind":"like","post_id":7}}
//! < {"ok":[{"date":"2024-01-01","count":1},{"date":"2024-01-02","count":1}]}
//! > {"method":"GetTop","params":{"kind":"like","dimension":"post"}}
//! < {"ok":[7]}
//! > {"method":"GetTop"}
//! < {"error":{"code":"invalid_argument","message":"..."}}
//! ```
//!
//! A response carries either a payload or an error status, never both. A
//! client that disconnects mid-request has that request cancelled.

use super::db::StoreError;
use super::engine::AggregationEngine;
use super::transactor::{QueryContext, Transactor};
use super::types::{Dynamic, EngagementSummary, EventKind, TopDimension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum StatisticsRequest {
    GetEngagementSummary { post_id: i32 },
    GetDynamic { kind: EventKind, post_id: i32 },
    GetTop { kind: EventKind, dimension: TopDimension },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Summary(EngagementSummary),
    Dynamic(Vec<Dynamic>),
    Ids(Vec<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Cancelled,
    Internal,
    InvalidArgument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        let code = if err.is_cancelled() {
            StatusCode::Cancelled
        } else {
            StatusCode::Internal
        };
        Status {
            code,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticsResponse {
    Ok(Payload),
    Error(Status),
}

impl<P: Into<Payload>> From<Result<P, StoreError>> for StatisticsResponse {
    fn from(result: Result<P, StoreError>) -> Self {
        match result {
            Ok(payload) => StatisticsResponse::Ok(payload.into()),
            Err(e) => StatisticsResponse::Error(e.into()),
        }
    }
}

impl From<EngagementSummary> for Payload {
    fn from(summary: EngagementSummary) -> Self {
        Payload::Summary(summary)
    }
}

impl From<Vec<Dynamic>> for Payload {
    fn from(series: Vec<Dynamic>) -> Self {
        Payload::Dynamic(series)
    }
}

impl From<Vec<i32>> for Payload {
    fn from(ids: Vec<i32>) -> Self {
        Payload::Ids(ids)
    }
}

pub struct QueryService<T: Transactor> {
    engine: AggregationEngine<T>,
}

impl<T: Transactor> QueryService<T> {
    pub fn new(engine: AggregationEngine<T>) -> Self {
        Self { engine }
    }

    pub async fn handle(&self, ctx: &QueryContext, request: StatisticsRequest) -> StatisticsResponse {
        match request {
            StatisticsRequest::GetEngagementSummary { post_id } => {
                self.engine.engagement_summary(ctx, post_id).await.into()
            }
            StatisticsRequest::GetDynamic { kind, post_id } => self.engine.dynamic(ctx, kind, post_id).await.into(),
            StatisticsRequest::GetTop { kind, dimension } => self.engine.top(ctx, kind, dimension).await.into(),
        }
    }

    /// Decode one request line and answer it
    pub async fn handle_line(&self, ctx: &QueryContext, line: &str) -> StatisticsResponse {
        match serde_json::from_str::<StatisticsRequest>(line) {
            Ok(request) => {
                log::debug!("📥 {:?}", request);
                self.handle(ctx, request).await
            }
            Err(e) => StatisticsResponse::Error(Status {
                code: StatusCode::InvalidArgument,
                message: e.to_string(),
            }),
        }
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: CancellationToken) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = reader.read_line(&mut line) => read?,
            };
            if read == 0 {
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let ctx = QueryContext::with_cancellation(shutdown.child_token());
            let handling = self.handle_line(&ctx, trimmed);
            tokio::pin!(handling);

            let response = tokio::select! {
                response = &mut handling => response,
                _ = peer_closed(&mut reader) => {
                    ctx.token().cancel();
                    let _ = handling.await;
                    log::debug!("🔌 Client went away, in-flight request cancelled");
                    break;
                }
            };
            if let StatisticsResponse::Error(status) = &response {
                log::warn!("⚠️  Request failed ({:?}): {}", status.code, status.message);
            }

            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
        }

        Ok(())
    }
}

/// Resolves once the peer has closed its side; pends while it has more to say
async fn peer_closed<R: AsyncBufRead + Unpin>(reader: &mut R) {
    match reader.fill_buf().await {
        Ok(buf) if !buf.is_empty() => std::future::pending().await,
        _ => {}
    }
}

/// Accept connections until `shutdown` is cancelled
pub async fn serve<T>(
    listener: TcpListener,
    service: Arc<QueryService<T>>,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    T: Transactor + 'static,
{
    log::info!("🌐 Query service listening on {}", listener.local_addr()?);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                log::debug!("🔌 Connection from {}", peer);
                let service = Arc::clone(&service);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.handle_connection(stream, shutdown).await {
                        log::warn!("⚠️  Connection {} closed with error: {}", peer, e);
                    }
                });
            }
            Err(e) => log::error!("❌ Failed to accept connection: {}", e),
        }
    }

    log::info!("✅ Query service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::ConnectionPool;
    use crate::pipeline::repository::StatisticsRepository;
    use crate::pipeline::transactor::{TxBeginner, TxScope};
    use async_trait::async_trait;
    use rusqlite::params;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Holds every read open until its context is cancelled
    struct BlockingTransactor {
        cancelled: CancellationToken,
    }

    #[async_trait]
    impl Transactor for BlockingTransactor {
        async fn with_transaction_value<T, F>(&self, ctx: &QueryContext, _f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&TxScope<'_>) -> Result<T, StoreError> + Send + 'static,
        {
            ctx.token().cancelled().await;
            self.cancelled.cancel();
            Err(StoreError::Cancelled)
        }
    }

    fn service() -> (tempfile::TempDir, Arc<ConnectionPool>, QueryService<TxBeginner>) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("store.db"), 2).unwrap();
        {
            let conn = pool.get().unwrap();
            for kind in EventKind::ALL {
                conn.execute_batch(kind.fact_table().create_sql).unwrap();
            }
            conn.execute(
                EventKind::Like.fact_table().insert_sql,
                params![1_704_103_200i64, 3, 7, 202401],
            )
            .unwrap();
        }
        let engine = AggregationEngine::new(
            TxBeginner::new(Arc::clone(&pool)),
            Arc::new(StatisticsRepository::new(Arc::clone(&pool))),
        );
        (dir, pool, QueryService::new(engine))
    }

    fn encode(response: &StatisticsResponse) -> Value {
        serde_json::to_value(response).unwrap()
    }

    #[test]
    fn test_request_decoding() {
        let request: StatisticsRequest =
            serde_json::from_str(r#"{"method":"GetTop","params":{"kind":"views","dimension":"user"}}"#).unwrap();
        assert_eq!(
            request,
            StatisticsRequest::GetTop {
                kind: EventKind::View,
                dimension: TopDimension::User
            }
        );
    }

    #[tokio::test]
    async fn test_handle_line_answers_each_method() {
        let (_dir, _pool, service) = service();
        let ctx = QueryContext::background();

        let summary = service
            .handle_line(&ctx, r#"{"method":"GetEngagementSummary","params":{"post_id":7}}"#)
            .await;
        assert_eq!(encode(&summary), json!({"ok": {"likes": 1, "views": 0, "comments": 0}}));

        let dynamic = service
            .handle_line(&ctx, r#"{"method":"GetDynamic","params":{"kind":"like","post_id":7}}"#)
            .await;
        assert_eq!(encode(&dynamic), json!({"ok": [{"date": "2024-01-01", "count": 1}]}));

        let top = service
            .handle_line(&ctx, r#"{"method":"GetTop","params":{"kind":"like","dimension":"post"}}"#)
            .await;
        assert_eq!(encode(&top), json!({"ok": [7]}));
    }

    #[tokio::test]
    async fn test_invalid_request_is_invalid_argument() {
        let (_dir, _pool, service) = service();
        let ctx = QueryContext::background();

        for line in ["not json", r#"{"method":"GetTop"}"#, r#"{"method":"GetDynamic","params":{"kind":"shares","post_id":1}}"#] {
            let response = service.handle_line(&ctx, line).await;
            let value = encode(&response);
            assert_eq!(value["error"]["code"], "invalid_argument", "line: {}", line);
            assert!(value.get("ok").is_none());
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_internal_without_payload() {
        let (_dir, pool, service) = service();
        pool.get().unwrap().execute_batch("DROP TABLE comments").unwrap();

        let response = service
            .handle(
                &QueryContext::background(),
                StatisticsRequest::GetEngagementSummary { post_id: 7 },
            )
            .await;
        let value = encode(&response);
        assert_eq!(value["error"]["code"], "internal");
        assert!(value.get("ok").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_is_cancelled_status() {
        let (_dir, _pool, service) = service();
        let token = CancellationToken::new();
        token.cancel();

        let response = service
            .handle(
                &QueryContext::with_cancellation(token),
                StatisticsRequest::GetTop {
                    kind: EventKind::Like,
                    dimension: TopDimension::Post,
                },
            )
            .await;
        assert!(matches!(
            response,
            StatisticsResponse::Error(Status {
                code: StatusCode::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let (_dir, _pool, service) = service();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::new(service), shutdown.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"method\":\"GetEngagementSummary\",\"params\":{\"post_id\":7}}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["ok"]["likes"], 1);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_in_flight_request() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("store.db"), 1).unwrap();
        let cancelled = CancellationToken::new();
        let engine = AggregationEngine::new(
            BlockingTransactor {
                cancelled: cancelled.clone(),
            },
            Arc::new(StatisticsRepository::new(pool)),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::new(QueryService::new(engine)), shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"method\":\"GetTop\",\"params\":{\"kind\":\"like\",\"dimension\":\"post\"}}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cancelled.is_cancelled());

        drop(stream);
        tokio::time::timeout(Duration::from_secs(2), cancelled.cancelled())
            .await
            .expect("request was not cancelled after disconnect");
        assert!(!shutdown.is_cancelled());

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
