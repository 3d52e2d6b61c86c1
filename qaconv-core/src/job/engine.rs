use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use super::pipeline;
use super::{FileProcessingJob, JobControl, JobStatus};
use crate::config::JobOptions;
use crate::convert::ConverterRegistry;
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};
use crate::sink::OutputSink;

struct JobHandle {
    control: JobControl,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// In-process entry point: submits jobs, reports their status, cancels them.
/// Jobs share nothing but this registry.
pub struct Engine {
    jobs: DashMap<String, Arc<JobHandle>>,
    registry: Option<ConverterRegistry>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            registry: None,
        }
    }

    /// Uses `registry` for every job instead of the built-in converters.
    pub fn with_registry(registry: ConverterRegistry) -> Self {
        Self {
            jobs: DashMap::new(),
            registry: Some(registry),
        }
    }

    fn registry_for(&self, options: &JobOptions) -> ConverterRegistry {
        match &self.registry {
            Some(r) => r.clone(),
            None => ConverterRegistry::standard(options.tabular.schema.clone()),
        }
    }

    fn register(&self, job: &FileProcessingJob) -> Result<Arc<JobHandle>> {
        let handle = Arc::new(JobHandle {
            control: job.control().clone(),
            thread: Mutex::new(None),
        });
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(mut e) => {
                if !e.get().control.snapshot().state.is_terminal() {
                    return Err(QaError::Config(format!("job {} is already running", job.id)));
                }
                e.insert(handle.clone());
            }
            Entry::Vacant(e) => {
                e.insert(handle.clone());
            }
        }
        Ok(handle)
    }

    /// Starts a job on its own thread and returns its id.
    pub fn submit_job(
        &self,
        source: &Path,
        kind: Option<StructuralKind>,
        mut sink: Box<dyn OutputSink>,
        options: JobOptions,
    ) -> Result<String> {
        let registry = self.registry_for(&options);
        let mut job = FileProcessingJob::new(source, kind, options)?;
        let id = job.id.clone();
        let handle = self.register(&job)?;

        let thread = std::thread::Builder::new()
            .name(format!("qaconv-job-{id}"))
            .spawn(move || pipeline::run(&mut job, sink.as_mut(), &registry))?;
        *handle.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
        info!(job_id = %id, "job submitted");
        Ok(id)
    }

    /// Runs a job on the calling thread.
    pub fn run_job(
        &self,
        source: &Path,
        kind: Option<StructuralKind>,
        sink: &mut dyn OutputSink,
        options: JobOptions,
    ) -> Result<JobStatus> {
        let registry = self.registry_for(&options);
        let mut job = FileProcessingJob::new(source, kind, options)?;
        self.register(&job)?;
        pipeline::run(&mut job, sink, &registry)?;
        Ok(job.status())
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        Ok(self.handle(job_id)?.control.snapshot())
    }

    /// Requests a pause at the next chunk boundary.
    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        let handle = self.handle(job_id)?;
        if handle.control.snapshot().state.is_terminal() {
            return Ok(());
        }
        handle.control.request_cancel();
        info!(job_id, "cancel requested");
        Ok(())
    }

    /// Blocks until a submitted job stops; returns its final status.
    pub fn wait(&self, job_id: &str) -> Result<JobStatus> {
        let handle = self.handle(job_id)?;
        let thread = handle
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(t) = thread {
            match t.join() {
                Ok(Ok(())) => {}
                // already recorded in the status
                Ok(Err(e)) => warn!(job_id, error = %e, "job ended with error"),
                Err(_) => {
                    return Err(QaError::Io(std::io::Error::other(format!(
                        "job thread {job_id} panicked"
                    ))));
                }
            }
        }
        Ok(handle.control.snapshot())
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }

    fn handle(&self, job_id: &str) -> Result<Arc<JobHandle>> {
        self.jobs
            .get(job_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| QaError::UnknownJob(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::sink::{JsonlSink, MemorySink};

    fn source(dir: &Path, n: usize) -> std::path::PathBuf {
        let p = dir.join("in.jsonl");
        let body: String = (0..n)
            .map(|i| format!("{{\"id\":{i},\"problem\":\"{i} + 1?\",\"answer\":\"{}\"}}\n", i + 1))
            .collect();
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn submitted_job_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), 4);
        let engine = Engine::new();
        let sink = JsonlSink::new(dir.path().join("out")).unwrap();
        let id = engine
            .submit_job(
                &src,
                None,
                Box::new(sink),
                JobOptions {
                    work_dir: dir.path().join("work"),
                    ..Default::default()
                },
            )
            .unwrap();
        let status = engine.wait(&id).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.records_emitted, 4);
        assert_eq!(engine.get_job_status(&id).unwrap().state, JobState::Completed);

        let out = std::fs::read_to_string(dir.path().join("out").join(format!("{id}.jsonl"))).unwrap();
        assert_eq!(out.lines().count(), 4);
    }

    #[test]
    fn unknown_job_is_an_error() {
        let engine = Engine::new();
        assert!(matches!(engine.get_job_status("nope"), Err(QaError::UnknownJob(_))));
        assert!(matches!(engine.cancel_job("nope"), Err(QaError::UnknownJob(_))));
    }

    #[test]
    fn run_job_reports_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), 3);
        let engine = Engine::new();
        let mut sink = MemorySink::new();
        let status = engine
            .run_job(
                &src,
                Some(StructuralKind::Jsonl),
                &mut sink,
                JobOptions {
                    job_id: Some("sync".into()),
                    work_dir: dir.path().join("work"),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(status.records_emitted, 3);
        assert_eq!(sink.entries("sync")[2].meta_text("answer_shape"), Some("integer"));
        assert_eq!(engine.job_ids(), vec!["sync".to_string()]);
    }
}
