use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{QaError, Result};
use crate::util::fsio::{atomic_write, sync_dir};

pub const CHECKPOINT_FILE: &str = "checkpoint.cbor";

/// Progress marker written after a chunk's output is durable in the sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub job_id: String,
    pub last_completed_chunk: u32,
    /// Entries in the sink once that chunk was flushed.
    pub entries_emitted: u64,
    pub records_consumed: u64,
    pub records_rejected: u64,
    /// Unix seconds.
    pub timestamp: i64,
}

impl CheckpointRecord {
    /// Progress after `chunk`, stamped with the current time.
    pub fn new(
        job_id: impl Into<String>,
        chunk: u32,
        entries_emitted: u64,
        records_consumed: u64,
        records_rejected: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            last_completed_chunk: chunk,
            entries_emitted,
            records_consumed,
            records_rejected,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn next_chunk(&self) -> u32 {
        self.last_completed_chunk + 1
    }
}

/// One checkpoint file per job under `<root>/<job_id>/`. Single writer per job.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id).join(CHECKPOINT_FILE)
    }

    /// Atomic and fsync'd: once this returns the record survives a crash.
    pub fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let bytes = serde_cbor::to_vec(record)
            .map_err(|e| QaError::Format(format!("checkpoint encode: {e}")))?;
        let path = self.path(&record.job_id);
        atomic_write(&path, &bytes)?;
        debug!(
            job_id = %record.job_id,
            chunk = record.last_completed_chunk,
            entries = record.entries_emitted,
            "checkpoint written"
        );
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Result<Option<CheckpointRecord>> {
        let bytes = match fs::read(self.path(job_id)) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CheckpointRecord = serde_cbor::from_slice(&bytes)
            .map_err(|e| QaError::Format(format!("checkpoint decode: {e}")))?;
        if record.job_id != job_id {
            return Err(QaError::Format(format!(
                "checkpoint for job {} found under {job_id}",
                record.job_id
            )));
        }
        Ok(Some(record))
    }

    pub fn clear(&self, job_id: &str) -> Result<()> {
        let path = self.path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = path.parent().filter(|d| d.exists()) {
            sync_dir(dir)?;
        }
        Ok(())
    }
}

pub fn job_dir(work_dir: &Path, job_id: &str) -> PathBuf {
    work_dir.join(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cm = CheckpointManager::new(dir.path());
        assert!(cm.load("j").unwrap().is_none());

        cm.save(&CheckpointRecord::new("j", 0, 4, 4, 0)).unwrap();
        let rec = CheckpointRecord::new("j", 1, 9, 10, 1);
        cm.save(&rec).unwrap();
        let back = cm.load("j").unwrap().unwrap();
        assert_eq!(back, rec);
        assert_eq!((back.records_consumed, back.records_rejected), (10, 1));
        assert_eq!(back.next_chunk(), 2);

        cm.clear("j").unwrap();
        assert!(cm.load("j").unwrap().is_none());
        cm.clear("j").unwrap();
    }

    #[test]
    fn garbage_checkpoint_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let cm = CheckpointManager::new(dir.path());
        std::fs::create_dir_all(dir.path().join("j")).unwrap();
        std::fs::write(cm.path("j"), b"\xff\x00garbage").unwrap();
        assert!(matches!(cm.load("j"), Err(QaError::Format(_))));
    }
}
