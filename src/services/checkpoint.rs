//! Durable per-job checkpoints for resumable backfills.
//!
//! One human-readable JSON document per job under the checkpoint
//! directory. Writes are atomic: the record is written to a temp file in
//! the same directory, fsynced, then renamed over the live file, so a
//! crash can never leave a torn or regressed checkpoint behind.
//! `last_completed_chunk` is monotonically non-decreasing; an attempted
//! regression is an invariant violation and aborts the job.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::errors::AppError;

/// Progress record for one job. Chunk numbers are 1-based; zero means no
/// chunk has completed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job: String,
    pub last_completed_chunk: u32,
    pub total_chunks: u32,
    pub last_chunk_end_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
}

/// File-backed checkpoint store, one document per job name.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{job}.json"))
    }

    /// Read the checkpoint for a job; `None` when the job has never run.
    pub async fn load(&self, job: &str) -> Result<Option<CheckpointRecord>, AppError> {
        let path = self.path(job);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CheckpointRecord = serde_json::from_str(&raw).map_err(|e| {
            AppError::InvariantViolation(format!(
                "checkpoint {} is unreadable: {e}",
                path.display()
            ))
        })?;
        Ok(Some(record))
    }

    /// Persist a new checkpoint. Enforces monotonicity against the current
    /// record and replaces the file atomically.
    pub async fn advance(&self, record: &CheckpointRecord) -> Result<(), AppError> {
        if let Some(current) = self.load(&record.job).await? {
            if record.last_completed_chunk < current.last_completed_chunk {
                return Err(AppError::InvariantViolation(format!(
                    "checkpoint for job '{}' would regress from chunk {} to {}",
                    record.job, current.last_completed_chunk, record.last_completed_chunk,
                )));
            }
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path(&record.job);
        let tmp_path = self.dir.join(format!("{}.json.tmp", record.job));
        let body = serde_json::to_string_pretty(record)
            .map_err(|e| AppError::Write(format!("checkpoint serialise failed: {e}")))?;

        write_and_sync(&tmp_path, body.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(
            "CheckpointStore: job '{}' advanced to chunk {}/{}",
            record.job,
            record.last_completed_chunk,
            record.total_chunks,
        );
        Ok(())
    }
}

/// Write bytes and fsync before returning, so the subsequent rename
/// publishes fully durable content.
async fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(job: &str, chunk: u32) -> CheckpointRecord {
        CheckpointRecord {
            job: job.to_string(),
            last_completed_chunk: chunk,
            total_chunks: 130,
            last_chunk_end_date: NaiveDate::from_ymd_opt(2015, 11, 30).unwrap(),
            timestamp: "2025-10-23T20:23:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_job_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert_eq!(store.load("backfill_events").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let rec = record("backfill_events", 11);
        store.advance(&rec).await.unwrap();

        let loaded = store.load("backfill_events").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.advance(&record("backfill_events", 12)).await.unwrap();
        let err = store
            .advance(&record("backfill_events", 11))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));

        // The regressed write must not have replaced the record
        let loaded = store.load("backfill_events").await.unwrap().unwrap();
        assert_eq!(loaded.last_completed_chunk, 12);
    }

    #[tokio::test]
    async fn test_same_chunk_rewrite_is_allowed() {
        // A retried chunk may re-advance to the same number (idempotent).
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.advance(&record("backfill_events", 12)).await.unwrap();
        store.advance(&record("backfill_events", 12)).await.unwrap();
        let loaded = store.load("backfill_events").await.unwrap().unwrap();
        assert_eq!(loaded.last_completed_chunk, 12);
    }

    #[tokio::test]
    async fn test_jobs_are_independent_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.advance(&record("backfill_events", 3)).await.unwrap();
        store.advance(&record("backfill_results", 7)).await.unwrap();

        assert_eq!(
            store
                .load("backfill_events")
                .await
                .unwrap()
                .unwrap()
                .last_completed_chunk,
            3
        );
        assert_eq!(
            store
                .load("backfill_results")
                .await
                .unwrap()
                .unwrap()
                .last_completed_chunk,
            7
        );
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.advance(&record("backfill_events", 1)).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_invariant_violation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(dir.path().join("backfill_events.json"), "{not json").unwrap();

        let err = store.load("backfill_events").await.unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
    }
}
