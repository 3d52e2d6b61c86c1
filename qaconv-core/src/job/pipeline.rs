//! Drives one job: chunk (or stream) the source, convert records chunk by
//! chunk, make each chunk durable in the sink, then checkpoint it.
//!
//! A chunk's entries may reach the sink before the chunk finishes, but the
//! checkpoint is only written after the sink is synced. Anything the sink
//! holds past the last checkpoint is dropped on resume.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::strategy::Strategy;
use super::{FileProcessingJob, JobState};
use crate::container::checkpoint::{CheckpointManager, CheckpointRecord, job_dir};
use crate::container::manifest::{MANIFEST_FILE, Manifest};
use crate::convert::{ConverterRegistry, DomainConverter, dispatch};
use crate::domain::{CanonicalQaEntry, DomainFamily, RawRecord};
use crate::error::{ConversionError, QaError, Result};
use crate::memory::{CleanupAction, CleanupLevel, Lease, MemoryBudget, MemoryMonitor, Reclaim};
use crate::read::stream::RecordStream;
use crate::sink::OutputSink;
use crate::split::writer::StructuralChunker;
use crate::util::digest::to_hex;

/// Records converted between memory samples.
pub const MEMORY_CHECK_INTERVAL: u64 = 64;

/// Entries buffered before they are handed to the sink.
const SINK_BATCH: usize = 256;

/// A batch is also handed on once it holds this fraction of its budget.
const BATCH_BUDGET_SHARE: u64 = 8;

/// Write buffer of a parallel worker's spill file.
const SPILL_BUFFER: usize = 8 * 1024;

pub const CHUNK_DIR: &str = "chunks";

/// Parallel workers park converted entries here until their chunk commits.
pub const SPILL_DIR: &str = "spill";

/// On-disk layout of one job under the work directory.
#[derive(Clone, Debug)]
pub struct JobPaths {
    pub root: PathBuf,
    pub chunks: PathBuf,
    pub manifest: PathBuf,
}

impl JobPaths {
    pub fn new(work_dir: &Path, job_id: &str) -> Self {
        let root = job_dir(work_dir, job_id);
        Self {
            chunks: root.join(CHUNK_DIR),
            manifest: root.join(MANIFEST_FILE),
            root,
        }
    }
}

/// Counters for one chunk.
#[derive(Debug, Default)]
struct ChunkTally {
    consumed: u64,
    rejected: u64,
    emitted: u64,
    errors: Vec<String>,
}

/// Picks the converter for each record: the job's family, or detection.
#[derive(Clone)]
struct Dispatcher<'r> {
    registry: &'r ConverterRegistry,
    family: DomainFamily,
    primary: Option<Arc<dyn DomainConverter>>,
}

impl<'r> Dispatcher<'r> {
    fn new(registry: &'r ConverterRegistry, family: DomainFamily) -> Result<Self> {
        let primary = match family {
            DomainFamily::Auto => None,
            f => Some(registry.resolve(f, None)?),
        };
        Ok(Self {
            registry,
            family,
            primary,
        })
    }

    fn converter_for(&mut self, record: &RawRecord) -> std::result::Result<Arc<dyn DomainConverter>, ConversionError> {
        if let Some(p) = &self.primary {
            // auto jobs fall back to per-record detection for mixed files
            if self.family != DomainFamily::Auto || p.can_handle(record) {
                return Ok(p.clone());
            }
            return self
                .registry
                .detect(record)
                .ok_or(ConversionError::NotHandled(record.ordinal));
        }
        let found = self
            .registry
            .detect(record)
            .ok_or(ConversionError::NotHandled(record.ordinal))?;
        debug!(converter = found.name(), record = record.ordinal, "converter detected");
        self.primary = Some(found.clone());
        Ok(found)
    }

    fn convert(&mut self, record: &RawRecord) -> std::result::Result<Vec<CanonicalQaEntry>, ConversionError> {
        let converter = self.converter_for(record)?;
        dispatch(converter.as_ref(), record)
    }

    fn side_effect_free(&self) -> bool {
        match &self.primary {
            Some(p) if self.family != DomainFamily::Auto => p.side_effect_free(),
            _ => self.registry.all_side_effect_free(),
        }
    }
}

/// Pending entries, charged to the budget while held.
struct EntryBatch {
    entries: Vec<CanonicalQaEntry>,
    lease: Lease,
    cap: u64,
}

impl EntryBatch {
    fn new(budget: &MemoryBudget) -> Self {
        Self {
            entries: Vec::new(),
            lease: budget.lease(0),
            cap: (budget.ceiling() / BATCH_BUDGET_SHARE).max(1),
        }
    }

    fn push(&mut self, entry: CanonicalQaEntry) {
        let bytes = self.lease.bytes() + footprint(&entry);
        self.lease.resize(bytes);
        self.entries.push(entry);
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= SINK_BATCH || self.lease.bytes() >= self.cap
    }

    fn bytes(&self) -> u64 {
        self.lease.bytes()
    }

    fn take(&mut self) -> Vec<CanonicalQaEntry> {
        self.lease.resize(0);
        std::mem::take(&mut self.entries)
    }
}

fn footprint(entry: &CanonicalQaEntry) -> u64 {
    let choices: usize = entry
        .choices
        .iter()
        .flatten()
        .map(|c| c.len() + std::mem::size_of::<String>())
        .sum();
    (std::mem::size_of::<CanonicalQaEntry>() + entry.question.len() + choices + entry.metadata.len() * 64) as u64
}

/// What a converting worker holds between memory checks: the pending batch
/// and the read buffer of its record stream.
struct Held<'h, R: Read, F> {
    batch: &'h mut EntryBatch,
    records: &'h mut RecordStream<R>,
    flush: &'h mut F,
}

impl<R, F> Reclaim for Held<'_, R, F>
where
    R: Read,
    F: FnMut(Vec<CanonicalQaEntry>) -> Result<()>,
{
    fn reclaim(&mut self, level: CleanupLevel) -> Result<u64> {
        let mut freed = self.batch.bytes();
        (self.flush)(self.batch.take())?;
        if level == CleanupLevel::Aggressive {
            freed += self.records.shrink();
        }
        Ok(freed)
    }
}

/// Where a converting worker reports memory pressure.
trait PressureGate {
    fn check(&mut self, held: &mut dyn Reclaim) -> Result<CleanupAction>;

    /// Called after a hard breach the first cleanup did not resolve.
    fn settle(&mut self, held: &mut dyn Reclaim) -> Result<()>;
}

impl PressureGate for MemoryMonitor {
    fn check(&mut self, held: &mut dyn Reclaim) -> Result<CleanupAction> {
        self.check_and_maybe_cleanup(held)
    }

    fn settle(&mut self, held: &mut dyn Reclaim) -> Result<()> {
        MemoryMonitor::settle(self, held)
    }
}

/// Parallel workers share one monitor. The lock serialises cleanup, so a
/// breach in one worker holds the others at their next check. Workers only
/// flag a breach; the orchestrator settles once the wave is committed.
struct SharedGate<'a> {
    monitor: &'a Mutex<MemoryMonitor>,
    breached: &'a AtomicBool,
}

impl PressureGate for SharedGate<'_> {
    fn check(&mut self, held: &mut dyn Reclaim) -> Result<CleanupAction> {
        let action = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_maybe_cleanup(held)?;
        if action == CleanupAction::HardAbort {
            self.breached.store(true, Ordering::SeqCst);
        }
        Ok(action)
    }

    fn settle(&mut self, _held: &mut dyn Reclaim) -> Result<()> {
        Ok(())
    }
}

/// One parallel worker's output for a chunk, written as JSON lines.
struct Spill {
    path: PathBuf,
    out: BufWriter<File>,
    _buffer: Lease,
}

impl Spill {
    fn create(dir: &Path, chunk: u32, budget: &MemoryBudget) -> Result<Self> {
        let path = dir.join(format!("chunk-{chunk:06}.jsonl"));
        let f = File::create(&path).map_err(|e| QaError::from_write(e, &path))?;
        Ok(Self {
            out: BufWriter::with_capacity(SPILL_BUFFER, f),
            _buffer: budget.lease(SPILL_BUFFER as u64),
            path,
        })
    }

    fn write(&mut self, entries: &[CanonicalQaEntry]) -> Result<()> {
        for entry in entries {
            serde_json::to_writer(&mut self.out, entry)
                .map_err(|e| QaError::Format(format!("entry encode: {e}")))?;
            self.out
                .write_all(b"\n")
                .map_err(|e| QaError::from_write(e, &self.path))?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf> {
        self.out.flush().map_err(|e| QaError::from_write(e, &self.path))?;
        Ok(self.path)
    }
}

#[allow(clippy::too_many_arguments)]
fn convert_chunk<R, G, F>(
    job_id: &str,
    chunk: u32,
    records: &mut RecordStream<R>,
    dispatcher: &mut Dispatcher<'_>,
    batch: &mut EntryBatch,
    gate: &mut G,
    error_log_limit: usize,
    mut flush: F,
) -> Result<ChunkTally>
where
    R: Read,
    G: PressureGate,
    F: FnMut(Vec<CanonicalQaEntry>) -> Result<()>,
{
    let mut tally = ChunkTally::default();
    while let Some(item) = records.next() {
        let record: RawRecord = item?;
        tally.consumed += 1;
        match dispatcher.convert(&record) {
            Ok(entries) => {
                tally.emitted += entries.len() as u64;
                for entry in entries {
                    batch.push(entry.stamped(record.ordinal, chunk));
                }
            }
            Err(e) => {
                tally.rejected += 1;
                warn!(job_id, chunk, record = record.ordinal, error = %e, "record rejected");
                if tally.errors.len() < error_log_limit.max(1) {
                    tally.errors.push(format!("record {}: {e}", record.ordinal));
                }
            }
        }
        if batch.is_full() {
            flush(batch.take())?;
        }
        if tally.consumed % MEMORY_CHECK_INTERVAL == 0 {
            let mut held = Held {
                batch: &mut *batch,
                records: &mut *records,
                flush: &mut flush,
            };
            if gate.check(&mut held)? == CleanupAction::HardAbort {
                gate.settle(&mut held)?;
            }
        }
    }
    flush(batch.take())?;
    Ok(tally)
}

/// Runs `job` to a terminal state, writing entries to `sink`.
pub fn run(job: &mut FileProcessingJob, sink: &mut dyn OutputSink, registry: &ConverterRegistry) -> Result<()> {
    let result = Pipeline::new(job, sink, registry).and_then(|mut p| p.execute());
    if let Err(e) = &result {
        job.fail_with(e);
    }
    result
}

struct Pipeline<'a> {
    job: &'a mut FileProcessingJob,
    sink: &'a mut dyn OutputSink,
    dispatcher: Dispatcher<'a>,
    monitor: Mutex<MemoryMonitor>,
    checkpoints: CheckpointManager,
    paths: JobPaths,
    emitted: u64,
    consumed: u64,
    rejected: u64,
}

impl<'a> Pipeline<'a> {
    fn new(
        job: &'a mut FileProcessingJob,
        sink: &'a mut dyn OutputSink,
        registry: &'a ConverterRegistry,
    ) -> Result<Self> {
        let budget = job.budget().clone();
        let mut monitor = MemoryMonitor::new(job.id.clone(), budget.clone(), budget.probe(job.options.probe));
        monitor.reset();
        Ok(Self {
            dispatcher: Dispatcher::new(registry, job.options.family)?,
            monitor: Mutex::new(monitor),
            checkpoints: CheckpointManager::new(&job.options.work_dir),
            paths: JobPaths::new(&job.options.work_dir, &job.id),
            job,
            sink,
            emitted: 0,
            consumed: 0,
            rejected: 0,
        })
    }

    fn monitor(&mut self) -> &mut MemoryMonitor {
        self.monitor.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&mut self) -> Result<()> {
        let checkpoint = self.reconcile_sink()?;
        let start = checkpoint.as_ref().map_or(0, CheckpointRecord::next_chunk);

        match self.job.strategy {
            Strategy::SplittingWithStreaming => {
                let manifest = self.prepare_chunks(checkpoint.is_some())?;
                if start as usize > manifest.chunks.len() {
                    return Err(QaError::ResumeMismatch {
                        checkpoint: self.emitted,
                        sink: self.sink.records_written(&self.job.id)?,
                    });
                }
                self.set_total(manifest.chunks.len() as u32, start);
                self.job.transition(JobState::Converting)?;
                let k = self.job.options.parallelism;
                if k > 1 && self.dispatcher.side_effect_free() {
                    self.convert_parallel(&manifest, start as usize, k)?;
                } else {
                    self.convert_sequential(&manifest, start as usize)?;
                }
            }
            Strategy::Standard | Strategy::Streaming => {
                self.set_total(1, start);
                self.job.transition(JobState::Converting)?;
                if start == 0 {
                    self.convert_whole_source()?;
                }
            }
        }
        self.finish()
    }

    /// Loads the checkpoint and brings the sink back to it.
    fn reconcile_sink(&mut self) -> Result<Option<CheckpointRecord>> {
        let id = self.job.id.clone();
        let checkpoint = if self.job.options.resume {
            self.checkpoints.load(&id)?
        } else {
            self.checkpoints.clear(&id)?;
            None
        };
        let expected = checkpoint.as_ref().map_or(0, |c| c.entries_emitted);
        let held = self.sink.records_written(&id)?;
        if held < expected {
            return Err(QaError::ResumeMismatch {
                checkpoint: expected,
                sink: held,
            });
        }
        if held > expected {
            warn!(job_id = %id, held, expected, "sink holds entries past the checkpoint; dropping them");
            self.sink.truncate(&id, expected)?;
            self.sink.sync()?;
        }
        if let Some(c) = &checkpoint {
            info!(job_id = %id, next_chunk = c.next_chunk(), entries = c.entries_emitted, "resuming from checkpoint");
            self.emitted = c.entries_emitted;
            self.consumed = c.records_consumed;
            self.rejected = c.records_rejected;
            self.job.control().update(|s| {
                s.records_emitted = c.entries_emitted;
                s.records_consumed = c.records_consumed;
                s.records_rejected = c.records_rejected;
            });
        }
        Ok(checkpoint)
    }

    /// Reuses a validated chunk set when resuming, otherwise chunks afresh.
    fn prepare_chunks(&mut self, resuming: bool) -> Result<Manifest> {
        if resuming || (self.job.options.resume && self.paths.manifest.exists()) {
            self.job.transition(JobState::Verifying)?;
            let manifest = Manifest::load(&self.paths.manifest)?;
            self.verify_for_resume(&manifest)?;
            return Ok(manifest);
        }

        self.job.transition(JobState::Chunking)?;
        if self.paths.chunks.exists() {
            crate::split::writer::remove_chunk_files(&self.paths.chunks)?;
        }
        let chunker = StructuralChunker::new(
            self.job.id.clone(),
            self.job.kind,
            self.job.options.chunk_size_bytes,
            self.job.budget().clone(),
        )
        .with_tabular(self.job.options.tabular.clone())
        .with_window(self.job.options.read_buffer_bytes);
        let (source, chunks, manifest_path) = (
            self.job.source.clone(),
            self.paths.chunks.clone(),
            self.paths.manifest.clone(),
        );
        let manifest = self
            .monitor()
            .with_monitoring(|_| chunker.split_file(&source, &chunks, &manifest_path))?;

        self.job.transition(JobState::Verifying)?;
        manifest.validate(&self.paths.chunks).into_result()?;
        Ok(manifest)
    }

    fn verify_for_resume(&mut self, manifest: &Manifest) -> Result<()> {
        if manifest.job_id != self.job.id {
            return Err(QaError::Format(format!(
                "manifest belongs to job {}, not {}",
                manifest.job_id, self.job.id
            )));
        }
        manifest.validate(&self.paths.chunks).into_result()?;
        if manifest.source_len != self.job.source_len {
            return Err(QaError::SourceChanged {
                expected: format!("{} bytes", manifest.source_len),
                actual: format!("{} bytes", self.job.source_len),
            });
        }
        if self.job.options.verify_source_on_resume {
            let actual = hash_file(&self.job.source)?;
            if actual != manifest.source_checksum {
                return Err(QaError::SourceChanged {
                    expected: manifest.source_checksum.clone(),
                    actual,
                });
            }
        }
        debug!(job_id = %self.job.id, chunks = manifest.chunks.len(), "chunk set verified for resume");
        Ok(())
    }

    fn set_total(&mut self, total: u32, start: u32) {
        self.job.control().update(|s| {
            s.chunks_total = total;
            s.chunks_completed = start.min(total);
        });
    }

    fn check_cancel(&self) -> Result<()> {
        if self.job.control().cancel_requested() {
            info!(job_id = %self.job.id, "cancel requested; stopping at chunk boundary");
            return Err(QaError::Cancelled);
        }
        Ok(())
    }

    fn convert_whole_source(&mut self) -> Result<()> {
        self.check_cancel()?;
        let opts = &self.job.options;
        let delimiter = opts.tabular.delimiter_for(&self.job.source);
        let budget = self.job.budget().clone();
        match self.job.strategy {
            Strategy::Standard => {
                let bytes = fs::read(&self.job.source)?;
                let _resident = budget.lease(bytes.len() as u64);
                let stream = RecordStream::from_bytes(&bytes, self.job.kind, &opts.tabular, delimiter);
                self.convert_one(0, stream, false)
            }
            _ => {
                let stream = RecordStream::open_path(&self.job.source, self.job.kind, &opts.tabular, opts.read_buffer_bytes)?
                    .with_budget(&budget);
                self.convert_one(0, stream, false)
            }
        }
    }

    fn convert_sequential(&mut self, manifest: &Manifest, start: usize) -> Result<()> {
        let window = self.job.options.read_buffer_bytes;
        let budget = self.job.budget().clone();
        for chunk in &manifest.chunks[start..] {
            self.check_cancel()?;
            let stream = RecordStream::open_chunk(manifest, &self.paths.chunks, chunk, window)?.with_budget(&budget);
            self.convert_one(chunk.index, stream, chunk.oversized)?;
        }
        Ok(())
    }

    /// Converts one chunk straight into the sink and commits it.
    fn convert_one<R: Read>(&mut self, index: u32, mut records: RecordStream<R>, oversized: bool) -> Result<()> {
        let before = self.emitted;
        let job_id = self.job.id.clone();
        let limit = self.job.options.error_log_limit;
        let budget = self.job.budget().clone();

        let monitor = self.monitor.get_mut().unwrap_or_else(PoisonError::into_inner);
        monitor.set_chunk(Some(index));
        if oversized {
            monitor.tighten_for_oversized();
        }
        let sink = &mut *self.sink;
        let dispatcher = &mut self.dispatcher;
        let result = monitor.with_monitoring(|m| {
            let mut batch = EntryBatch::new(&budget);
            convert_chunk(&job_id, index, &mut records, dispatcher, &mut batch, m, limit, |entries| {
                sink.append(&job_id, &entries)
            })
        });
        monitor.relax();

        match result {
            Ok(tally) => self.commit(index, tally, before),
            Err(e) => {
                self.rollback(before);
                Err(e)
            }
        }
    }

    fn convert_parallel(&mut self, manifest: &Manifest, start: usize, k: usize) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(k)
            .thread_name(|i| format!("qaconv-worker-{i}"))
            .build()
            .map_err(|e| QaError::Config(format!("worker pool: {e}")))?;
        let workers = self.job.budget().split(k);
        let breached = AtomicBool::new(false);
        let job_id = self.job.id.clone();
        let window = self.job.options.read_buffer_bytes;
        let limit = self.job.options.error_log_limit;
        let spill_dir = self.paths.root.join(SPILL_DIR);
        fs::create_dir_all(&spill_dir).map_err(|e| QaError::from_write(e, &spill_dir))?;
        info!(job_id = %job_id, workers = k, "converting chunks in parallel");

        for wave in manifest.chunks[start..].chunks(k) {
            self.check_cancel()?;
            {
                let m = self.monitor();
                m.set_chunk(wave.first().map(|c| c.index));
                if wave.iter().any(|c| c.oversized) {
                    m.tighten_for_oversized();
                }
            }
            let dispatcher = self.dispatcher.clone();
            let monitor = &self.monitor;
            let chunk_dir = &self.paths.chunks;
            let spill_dir = &spill_dir;
            let outputs: Vec<Result<(ChunkTally, PathBuf)>> = pool.install(|| {
                wave.par_iter()
                    .zip(workers.par_iter())
                    .map(|(chunk, budget)| -> Result<(ChunkTally, PathBuf)> {
                        let mut dispatcher = dispatcher.clone();
                        let mut gate = SharedGate {
                            monitor,
                            breached: &breached,
                        };
                        let mut records =
                            RecordStream::open_chunk(manifest, chunk_dir, chunk, window)?.with_budget(budget);
                        let mut batch = EntryBatch::new(budget);
                        let mut spill = Spill::create(spill_dir, chunk.index, budget)?;
                        let tally = convert_chunk(
                            &job_id,
                            chunk.index,
                            &mut records,
                            &mut dispatcher,
                            &mut batch,
                            &mut gate,
                            limit,
                            |entries| spill.write(&entries),
                        )?;
                        Ok((tally, spill.finish()?))
                    })
                    .collect()
            });

            for (chunk, output) in wave.iter().zip(outputs) {
                let (tally, spilled) = output?;
                self.commit_spilled(chunk.index, tally, &spilled)?;
            }
            let m = self.monitor();
            m.relax();
            if breached.swap(false, Ordering::SeqCst) {
                m.settle(&mut ())?;
            }
        }
        Ok(())
    }

    /// Replays a worker's spilled entries into the sink, then commits the chunk.
    fn commit_spilled(&mut self, index: u32, tally: ChunkTally, spilled: &Path) -> Result<()> {
        let before = self.emitted;
        if let Err(e) = self.replay(spilled) {
            self.rollback(before);
            return Err(e);
        }
        if let Err(e) = fs::remove_file(spilled) {
            debug!(job_id = %self.job.id, path = %spilled.display(), error = %e, "spill file not removed");
        }
        self.commit(index, tally, before)
    }

    fn replay(&mut self, spilled: &Path) -> Result<()> {
        let id = self.job.id.clone();
        let mut batch = EntryBatch::new(self.job.budget());
        for line in BufReader::new(File::open(spilled)?).lines() {
            let entry: CanonicalQaEntry = serde_json::from_str(&line?)
                .map_err(|e| QaError::Format(format!("spilled entry: {e}")))?;
            batch.push(entry);
            if batch.is_full() {
                self.sink.append(&id, &batch.take())?;
            }
        }
        self.sink.append(&id, &batch.take())
    }

    /// Enforces the chunk's error budget, then syncs the sink and checkpoints.
    fn commit(&mut self, index: u32, tally: ChunkTally, before: u64) -> Result<()> {
        self.consumed += tally.consumed;
        self.rejected += tally.rejected;
        let limit = self.job.options.error_log_limit;
        let (consumed, rejected) = (self.consumed, self.rejected);
        self.job.control().update(|s| {
            s.records_consumed = consumed;
            s.records_rejected = rejected;
            for e in tally.errors.iter().cloned() {
                s.log_error(e, limit);
            }
        });

        let threshold = self.job.options.error_rate_threshold;
        if tally.consumed > 0 && tally.rejected as f64 / tally.consumed as f64 > threshold {
            self.rollback(before);
            return Err(QaError::ErrorBudgetExceeded {
                chunk: index,
                errors: tally.rejected,
                records: tally.consumed,
                threshold,
            });
        }

        self.emitted = before + tally.emitted;
        self.sink.sync()?;
        self.checkpoints.save(&CheckpointRecord::new(
            self.job.id.clone(),
            index,
            self.emitted,
            self.consumed,
            self.rejected,
        ))?;

        let (emitted, peak) = (self.emitted, self.monitor().max_sampled());
        self.job.control().update(|s| {
            s.chunks_completed = index + 1;
            s.records_emitted = emitted;
            s.peak_memory = peak;
        });
        info!(
            job_id = %self.job.id,
            chunk = index,
            records = tally.consumed,
            entries = tally.emitted,
            rejected = tally.rejected,
            "chunk converted"
        );
        Ok(())
    }

    /// Drops whatever the failed chunk already appended.
    fn rollback(&mut self, before: u64) {
        let id = self.job.id.clone();
        if let Err(e) = self.sink.truncate(&id, before).and_then(|_| self.sink.sync()) {
            warn!(job_id = %id, error = %e, "could not roll back partial chunk output");
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.job.transition(JobState::Verifying)?;
        let id = self.job.id.clone();
        let held = self.sink.records_written(&id)?;
        if held != self.emitted {
            return Err(QaError::ResumeMismatch {
                checkpoint: self.emitted,
                sink: held,
            });
        }
        self.checkpoints.clear(&id)?;
        match fs::remove_dir_all(&self.paths.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %id, error = %e, "could not remove job directory"),
        }
        let peak = self.monitor().max_sampled();
        self.job.control().update(|s| s.peak_memory = peak);
        self.job.transition(JobState::Completed)
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(to_hex(hasher.finalize().as_bytes()))
}
