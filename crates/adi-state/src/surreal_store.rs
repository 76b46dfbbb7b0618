//! SurrealDB-backed ExecutionStore implementation
//!
//! Rows use millisecond timestamps and a string status; conversion to
//! `storage_traits` types happens at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::{
    ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionStore, StorageResult, Transition,
};

const TABLE: &str = "agent_executions";

/// Row shape stored in `agent_executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbExecution {
    /// SurrealDB record ID
    id: Option<surrealdb::sql::Thing>,
    execution_id: String,
    evaluation_id: String,
    agent_name: String,
    status: String,
    started_at_ms: i64,
    completed_at_ms: Option<i64>,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    duration_ms: Option<u64>,
    #[serde(default)]
    cancelled: bool,
}

impl DbExecution {
    fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            id: None,
            execution_id: record.id.0.clone(),
            evaluation_id: record.evaluation_id.clone(),
            agent_name: record.agent_name.clone(),
            status: record.status.to_string(),
            started_at_ms: record.started_at.timestamp_millis(),
            completed_at_ms: record.completed_at.map(|t| t.timestamp_millis()),
            result: record.result.clone(),
            error_message: record.error_message.clone(),
            duration_ms: record.duration_ms,
            cancelled: record.cancelled,
        }
    }

    fn into_record(self) -> StorageResult<ExecutionRecord> {
        let status = ExecutionStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown execution status: {}", self.status))
        })?;
        Ok(ExecutionRecord {
            id: ExecutionId(self.execution_id),
            evaluation_id: self.evaluation_id,
            agent_name: self.agent_name,
            status,
            started_at: millis_to_utc(self.started_at_ms)?,
            completed_at: self.completed_at_ms.map(millis_to_utc).transpose()?,
            result: self.result,
            error_message: self.error_message,
            duration_ms: self.duration_ms,
            cancelled: self.cancelled,
        })
    }
}

fn millis_to_utc(ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Backend(format!("timestamp out of range: {ms}")))
}

/// SurrealDB-backed implementation of [`ExecutionStore`].
pub struct SurrealExecutionStore {
    db: Surreal<Any>,
}

impl SurrealExecutionStore {
    /// Connect to `endpoint` (e.g. `mem://`, `ws://host:8000`) and select `adi/main`.
    pub async fn connect(endpoint: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(endpoint).await?;
        db.use_ns("adi").use_db("main").await?;
        migrations::init_schema(&db).await?;
        info!(endpoint = %endpoint, "SurrealExecutionStore connected");
        Ok(Self { db })
    }

    /// In-memory instance, used when no `SURREALDB_URL` is configured.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to `SURREALDB_URL` if set, otherwise fall back to in-memory.
    pub async fn from_env() -> StorageResult<Self> {
        match std::env::var("SURREALDB_URL") {
            Ok(url) => Self::connect(&url).await,
            Err(_) => {
                info!("No SURREALDB_URL found, using in-memory SurrealDB");
                Self::in_memory().await
            }
        }
    }

    async fn fetch(&self, eid: &str) -> StorageResult<Option<DbExecution>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::table($tb) WHERE execution_id = $eid")
            .bind(("tb", TABLE))
            .bind(("eid", eid.to_string()))
            .await?;
        let rows: Vec<DbExecution> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl ExecutionStore for SurrealExecutionStore {
    async fn insert(&self, record: ExecutionRecord) -> StorageResult<()> {
        if self.fetch(&record.id.0).await?.is_some() {
            return Err(StorageError::Duplicate {
                execution_id: record.id.0.clone(),
            });
        }

        debug!(execution_id = %record.id, "creating execution record");
        let _created: Option<DbExecution> = self
            .db
            .create(TABLE)
            .content(DbExecution::from_record(&record))
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        transition: Transition,
    ) -> StorageResult<ExecutionRecord> {
        let row = self
            .fetch(&id.0)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                execution_id: id.0.clone(),
            })?;
        let from = row.status.clone();
        let row_id = row.id.clone();

        let mut record = row.into_record()?;
        record.apply(transition)?;

        let mut updated = DbExecution::from_record(&record);
        updated.id = row_id;

        // Compare-and-set on the previous status
        let mut res = self
            .db
            .query("UPDATE type::table($tb) CONTENT $row WHERE execution_id = $eid AND status = $from RETURN AFTER")
            .bind(("tb", TABLE))
            .bind(("row", updated))
            .bind(("eid", id.0.clone()))
            .bind(("from", from.clone()))
            .await?;
        let rows: Vec<DbExecution> = res.take(0)?;

        match rows.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                // Lost the race: report against whatever is stored now
                let current = self
                    .fetch(&id.0)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or(from);
                Err(StorageError::InvalidTransition {
                    execution_id: id.0.clone(),
                    from: current,
                    to: record.status.to_string(),
                })
            }
        }
    }

    async fn get(&self, id: &ExecutionId) -> StorageResult<Option<ExecutionRecord>> {
        self.fetch(&id.0)
            .await?
            .map(DbExecution::into_record)
            .transpose()
    }

    async fn list_by_evaluation(
        &self,
        evaluation_id: &str,
    ) -> StorageResult<Vec<ExecutionRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::table($tb) WHERE evaluation_id = $ev ORDER BY started_at_ms ASC")
            .bind(("tb", TABLE))
            .bind(("ev", evaluation_id.to_string()))
            .await?;
        let rows: Vec<DbExecution> = res.take(0)?;
        rows.into_iter().map(DbExecution::into_record).collect()
    }
}
