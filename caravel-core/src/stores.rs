//! Collaborator sinks of the analysis stage: the user-visible log stream,
//! the stage metadata store used for resume, and the store of the latest
//! successful analysis result per application.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open stage store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("store execution error: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The record persisted after a successful analysis stage, consumed later
/// by the Previous comparison strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Stage start time in unix seconds.
    pub start_time: i64,
}

/// Append-only, user-visible log stream of the running stage.
pub trait LogPersister: Send + Sync {
    fn info(&self, message: &str);
    fn success(&self, message: &str);
    fn error(&self, message: &str);
}

/// Per-stage string metadata, written at stage exit and read on resume.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_stage_metadata(
        &self,
        stage_id: &str,
    ) -> StoreResult<Option<HashMap<String, String>>>;

    async fn set_stage_metadata(
        &self,
        stage_id: &str,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()>;
}

/// Latest successful analysis result, one record per application.
#[async_trait]
pub trait AnalysisResultStore: Send + Sync {
    async fn put_latest_analysis_result(&self, result: &AnalysisResult) -> StoreResult<()>;

    async fn get_latest_analysis_result(&self) -> StoreResult<Option<AnalysisResult>>;
}

/// Log persister that forwards the stage log stream onto `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogPersister;

impl LogPersister for TracingLogPersister {
    fn info(&self, message: &str) {
        tracing::info!(target: "analysis", "{message}");
    }

    fn success(&self, message: &str) {
        tracing::info!(target: "analysis", outcome = "success", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "analysis", "{message}");
    }
}

const STAGE_STORE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stage_metadata (
    stage_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (stage_id, key)
);
CREATE TABLE IF NOT EXISTS analysis_results (
    application TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL
);
";

/// SQLite-backed implementation of both store contracts. Connections are
/// opened per operation so the store stays cheap to clone and share.
#[derive(Debug, Clone)]
pub struct SqliteStageStore {
    path: PathBuf,
    application: String,
    flags: OpenFlags,
}

impl SqliteStageStore {
    pub fn new(path: impl AsRef<Path>, application: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            application: application.into(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        }
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STAGE_STORE_SCHEMA)?;
        Ok(())
    }

    fn open(&self) -> StoreResult<Connection> {
        Connection::open_with_flags(&self.path, self.flags).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStageStore {
    async fn get_stage_metadata(
        &self,
        stage_id: &str,
    ) -> StoreResult<Option<HashMap<String, String>>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM stage_metadata WHERE stage_id = ?1")?;
        let mut rows = stmt.query([stage_id])?;
        let mut metadata = HashMap::new();
        while let Some(row) = rows.next()? {
            metadata.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        if metadata.is_empty() {
            return Ok(None);
        }
        Ok(Some(metadata))
    }

    async fn set_stage_metadata(
        &self,
        stage_id: &str,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for (key, value) in &metadata {
            tx.execute(
                "INSERT OR REPLACE INTO stage_metadata (stage_id, key, value) VALUES (?1, ?2, ?3)",
                params![stage_id, key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl AnalysisResultStore for SqliteStageStore {
    async fn put_latest_analysis_result(&self, result: &AnalysisResult) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO analysis_results (application, start_time) VALUES (?1, ?2)",
            params![self.application, result.start_time],
        )?;
        Ok(())
    }

    async fn get_latest_analysis_result(&self) -> StoreResult<Option<AnalysisResult>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT start_time FROM analysis_results WHERE application = ?1")?;
        let start_time = stmt
            .query_row([&self.application], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(start_time.map(|start_time| AnalysisResult { start_time }))
    }
}
