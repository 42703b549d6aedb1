//! Topology provisioning
//!
//! Runs once at process start. For every event kind, in order:
//! 1. Create the log topic if absent
//! 2. Register the staging relation bound to it (`<kind>kafka`)
//! 3. Create the fact table if absent (`<kind>`)
//! 4. Install the materializer wiring staging → fact (`<kind>mw`)
//!
//! Every step is idempotent, so re-running bootstrap against a provisioned
//! system is a no-op. The first failure aborts startup and names the object
//! that could not be provisioned.

use super::broker::{LogError, SqliteEventLog, TopicSpec};
use super::config::{IngestConfig, ProvisioningConfig};
use super::db::{ConnectionPool, StoreError};
use super::materializer::Materializer;
use super::schema::{METADATA_SQL, REGISTER_MATERIALIZER_SQL, REGISTER_STAGING_SQL};
use super::staging::StagingRelation;
use super::types::EventKind;
use rusqlite::params;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum ProvisionError {
    Metadata(StoreError),
    Topic { topic: String, source: LogError },
    Staging { relation: String, source: StoreError },
    FactTable { table: String, source: StoreError },
    Materializer { name: String, source: StoreError },
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::Metadata(e) => write!(f, "provisioning metadata: {}", e),
            ProvisionError::Topic { topic, source } => write!(f, "topic {}: {}", topic, source),
            ProvisionError::Staging { relation, source } => {
                write!(f, "staging relation {}: {}", relation, source)
            }
            ProvisionError::FactTable { table, source } => write!(f, "fact table {}: {}", table, source),
            ProvisionError::Materializer { name, source } => {
                write!(f, "materializer {}: {}", name, source)
            }
        }
    }
}

impl std::error::Error for ProvisionError {}

/// Provisioning state of one topic's ingestion path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TopicState {
    Unprovisioned,
    Staged,
    Materializing,
}

/// One kind's provisioned ingestion path
pub struct TopicPipeline {
    pub kind: EventKind,
    pub state: TopicState,
    pub materializer: Arc<Materializer>,
}

/// Result of a successful bootstrap
pub struct Topology {
    pub pipelines: Vec<TopicPipeline>,
}

impl Topology {
    pub fn state(&self, kind: EventKind) -> TopicState {
        self.pipelines
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.state)
            .unwrap_or(TopicState::Unprovisioned)
    }

    /// Spawn one materializer task per topic
    pub fn spawn(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.pipelines
            .iter()
            .map(|p| tokio::spawn(Arc::clone(&p.materializer).run(shutdown.clone())))
            .collect()
    }
}

pub struct Provisioner {
    log: Arc<SqliteEventLog>,
    pool: Arc<ConnectionPool>,
    provisioning: ProvisioningConfig,
    ingest: IngestConfig,
}

impl Provisioner {
    pub fn new(
        log: Arc<SqliteEventLog>,
        pool: Arc<ConnectionPool>,
        provisioning: ProvisioningConfig,
        ingest: IngestConfig,
    ) -> Self {
        Self {
            log,
            pool,
            provisioning,
            ingest,
        }
    }

    /// Provision every kind; fails on the first object that cannot be created
    pub fn bootstrap(&self) -> Result<Topology, ProvisionError> {
        log::info!("🔧 Provisioning ingestion topology...");

        let conn = self.pool.get().map_err(ProvisionError::Metadata)?;
        conn.execute_batch(METADATA_SQL)
            .map_err(|e| ProvisionError::Metadata(StoreError::Query(e)))?;
        drop(conn);

        let mut pipelines = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            pipelines.push(self.provision_kind(kind)?);
        }

        log::info!("✅ Topology provisioned ({} topics)", pipelines.len());
        Ok(Topology { pipelines })
    }

    fn provision_kind(&self, kind: EventKind) -> Result<TopicPipeline, ProvisionError> {
        let now = chrono::Utc::now().timestamp();
        let table = kind.fact_table();

        let topic = TopicSpec {
            name: kind.topic().to_string(),
            partitions: self.provisioning.partitions,
            replication_factor: self.provisioning.replication_factor,
        };
        let created = self.log.create_topic(&topic).map_err(|source| ProvisionError::Topic {
            topic: topic.name.clone(),
            source,
        })?;
        log::info!(
            "   ├─ Topic {} ({})",
            topic.name,
            if created { "created" } else { "exists" }
        );

        let relation = StagingRelation::for_kind(kind, self.ingest.skip_broken_messages);
        let conn = self.pool.get().map_err(|source| ProvisionError::Staging {
            relation: relation.name.clone(),
            source,
        })?;

        conn.execute(
            REGISTER_STAGING_SQL,
            params![
                relation.name,
                relation.topic,
                relation.consumer_group,
                relation.skip_broken_messages as i64,
                now
            ],
        )
        .map_err(|e| ProvisionError::Staging {
            relation: relation.name.clone(),
            source: StoreError::Query(e),
        })?;
        let mut state = TopicState::Staged;
        log::info!("   ├─ Staging relation {} → {}", relation.name, relation.topic);
        log::debug!("{} state: {:?}", topic.name, state);

        conn.execute_batch(table.create_sql)
            .map_err(|e| ProvisionError::FactTable {
                table: table.name.to_string(),
                source: StoreError::Query(e),
            })?;
        log::info!("   ├─ Fact table {}", table.name);

        conn.execute(
            REGISTER_MATERIALIZER_SQL,
            params![kind.materializer_name(), relation.name, table.name, now],
        )
        .map_err(|e| ProvisionError::Materializer {
            name: kind.materializer_name().to_string(),
            source: StoreError::Query(e),
        })?;
        drop(conn);

        let materializer = Arc::new(Materializer::new(
            kind,
            relation,
            Arc::clone(&self.log),
            Arc::clone(&self.pool),
            &self.ingest,
        ));
        state = TopicState::Materializing;
        log::info!("   └─ Materializer {} installed", materializer.name());
        log::debug!("{} state: {:?}", topic.name, state);

        Ok(TopicPipeline {
            kind,
            state,
            materializer,
        })
    }
}
