//! Statistics runtime
//!
//! Provisions the ingestion topology, runs one materializer per event kind,
//! and serves the query service until CTRL+C.
//!
//! Usage:
//!   cargo run --release --bin postflow_runtime
//!
//! Environment variables:
//!   POSTFLOW_DB_PATH - Analytical store path (default: data/statistics.db)
//!   POSTFLOW_BROKER_PATH - Durable log path (default: data/broker.db)
//!   POSTFLOW_SERVER_ADDR - Query service address (default: 0.0.0.0:50052)
//!   INGEST_POLL_INTERVAL_MS - Materializer idle poll (default: 500)

use dotenv::dotenv;
use log::{error, info};
use postflow::pipeline::{
    serve, AggregationEngine, ConnectionPool, PipelineConfig, Provisioner, QueryService, SqliteEventLog,
    StatisticsRepository, TxBeginner,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Postflow statistics runtime");

    let config = PipelineConfig::from_env()?;
    info!("   ├─ Store: {} (pool {})", config.store.db_path, config.store.pool_size);
    info!("   ├─ Log: {}", config.provisioning.broker_path);
    info!(
        "   ├─ Topics: {} partition(s), replication {}",
        config.provisioning.partitions, config.provisioning.replication_factor
    );
    info!(
        "   ├─ Ingest: batch {}, poll {}ms, skip {} broken",
        config.ingest.batch_size,
        config.ingest.poll_interval.as_millis(),
        config.ingest.skip_broken_messages
    );
    info!("   └─ Query service: {}", config.server_addr);

    let log = Arc::new(SqliteEventLog::open(&config.provisioning.broker_path)?);
    let pool = ConnectionPool::open(&config.store.db_path, config.store.pool_size)?;

    let provisioner = Provisioner::new(
        Arc::clone(&log),
        Arc::clone(&pool),
        config.provisioning.clone(),
        config.ingest.clone(),
    );
    let topology = match provisioner.bootstrap() {
        Ok(topology) => topology,
        Err(e) => {
            error!("❌ Provisioning failed: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let mut handles = topology.spawn(&shutdown);
    info!("✅ {} materializers running", handles.len());

    let engine = AggregationEngine::new(
        TxBeginner::new(Arc::clone(&pool)),
        Arc::new(StatisticsRepository::new(Arc::clone(&pool))),
    );
    let service = Arc::new(QueryService::new(engine));
    let listener = TcpListener::bind(&config.server_addr).await?;
    let server_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = serve(listener, service, server_shutdown).await {
            error!("❌ Query service failed: {}", e);
        }
    }));

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("❌ Task ended abnormally: {}", e);
        }
    }

    info!("✅ Postflow runtime stopped");
    Ok(())
}
