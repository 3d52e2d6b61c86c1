//! Conversion jobs: lifecycle state, progress, and the pipeline that drives
//! one source through chunking, conversion and verification.

pub mod engine;
pub mod pipeline;
pub mod strategy;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::JobOptions;
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};
use crate::memory::MemoryBudget;
use strategy::Strategy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Chunking,
    Converting,
    Verifying,
    Completed,
    Failed,
    Paused,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Paused)
    }

    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Pending, Chunking | Verifying | Converting) => true,
            (Chunking, Verifying) => true,
            (Verifying, Converting | Completed) => true,
            (Converting, Verifying) => true,
            (Paused, Pending) => true,
            (from, Failed | Paused) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Snapshot polled by callers; the only progress channel out of a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub strategy: Option<Strategy>,
    pub chunks_completed: u32,
    pub chunks_total: u32,
    pub records_consumed: u64,
    pub records_emitted: u64,
    pub records_rejected: u64,
    /// First `error_log_limit` record-level errors.
    pub error_log: Vec<String>,
    pub errors_dropped: u64,
    /// Set whenever anything went wrong, including rejected records on an
    /// otherwise completed job.
    pub last_error: Option<String>,
    pub peak_memory: u64,
}

impl JobStatus {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Pending,
            strategy: None,
            chunks_completed: 0,
            chunks_total: 0,
            records_consumed: 0,
            records_emitted: 0,
            records_rejected: 0,
            error_log: Vec::new(),
            errors_dropped: 0,
            last_error: None,
            peak_memory: 0,
        }
    }

    pub(crate) fn log_error(&mut self, message: String, limit: usize) {
        if self.error_log.len() < limit {
            self.error_log.push(message.clone());
        } else {
            self.errors_dropped += 1;
        }
        self.last_error = Some(message);
    }
}

/// Shared progress cell and cancel flag of a running job.
#[derive(Clone)]
pub struct JobControl {
    status: Arc<Mutex<JobStatus>>,
    cancel: Arc<AtomicBool>,
}

impl JobControl {
    pub fn new(job_id: &str) -> Self {
        Self {
            status: Arc::new(Mutex::new(JobStatus::new(job_id))),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn snapshot(&self) -> JobStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut JobStatus) -> T) -> T {
        let mut guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Takes effect at the next chunk boundary.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// One conversion run of one source file.
pub struct FileProcessingJob {
    pub id: String,
    pub source: PathBuf,
    pub kind: StructuralKind,
    pub source_len: u64,
    pub strategy: Strategy,
    pub options: JobOptions,
    budget: MemoryBudget,
    state: JobState,
    control: JobControl,
}

impl FileProcessingJob {
    /// Detects the kind unless given, sizes the source and picks a strategy.
    pub fn new(source: &Path, kind: Option<StructuralKind>, options: JobOptions) -> Result<Self> {
        options.validate()?;
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let kind = match kind {
            Some(k) => k,
            None => StructuralKind::detect(source)?,
        };
        let (source_len, strategy) = Strategy::analyze(source, &options.strategy_thresholds)?;
        let control = JobControl::new(&id);
        control.update(|s| s.strategy = Some(strategy));
        info!(job_id = %id, source = %source.display(), %kind, bytes = source_len, %strategy, "job created");
        Ok(Self {
            id,
            source: source.to_path_buf(),
            kind,
            source_len,
            strategy,
            budget: MemoryBudget::from_options(&options),
            options,
            state: JobState::Pending,
            control,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    pub fn status(&self) -> JobStatus {
        self.control.snapshot()
    }

    pub fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(QaError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        self.control.update(|s| s.state = to);
        if to.is_terminal() {
            match to {
                JobState::Completed => info!(job_id = %self.id, ?from, "job completed"),
                _ => warn!(job_id = %self.id, ?from, ?to, "job stopped"),
            }
        } else {
            info!(job_id = %self.id, ?from, ?to, "job state changed");
        }
        Ok(())
    }

    /// Records a job-level error and moves to its terminal state.
    pub(crate) fn fail_with(&mut self, err: &QaError) {
        let to = err.disposition();
        self.control.update(|s| s.last_error = Some(err.to_string()));
        if let Err(e) = self.transition(to) {
            warn!(job_id = %self.id, error = %e, "could not record terminal state");
        }
    }
}
