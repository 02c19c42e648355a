//! Default stand-in for the relational file-record store. spec.md treats
//! this store as an opaque external collaborator owned by another system;
//! this logging implementation is what the bundled binaries wire in so the
//! process can run standalone. A real deployment replaces it with a
//! `FileRecordRepository` backed by that system's database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskqueue_core::collaborators::{FileRecordRepository, RowBatch};
use taskqueue_core::domain::TaskId;
use tracing::debug;

pub struct LoggingFileRecordRepository;

#[async_trait]
impl FileRecordRepository for LoggingFileRecordRepository {
    async fn insert_batch(&self, task_id: TaskId, chunk_id: u32, batch: RowBatch) -> anyhow::Result<()> {
        debug!(%task_id, chunk_id, clean = batch.clean_rows.len(), errors = batch.errors.len(), "insert_batch (no relational store wired)");
        Ok(())
    }

    async fn mark_enqueued(&self, task_id: TaskId, enqueued_at: DateTime<Utc>) -> anyhow::Result<()> {
        debug!(%task_id, %enqueued_at, "mark_enqueued (no relational store wired)");
        Ok(())
    }

    async fn mark_completed(&self, task_id: TaskId, completed_at: DateTime<Utc>) -> anyhow::Result<()> {
        debug!(%task_id, %completed_at, "mark_completed (no relational store wired)");
        Ok(())
    }
}
