//! Memory budget and monitor.
//!
//! A [`MemoryBudget`] is created per job and passed to every component that
//! holds sizeable buffers. Components charge what they hold through RAII
//! [`Lease`]s; the [`MemoryMonitor`] samples a [`UsageProbe`] (process RSS or
//! the budget's own tracked total) and escalates through soft cleanup to a
//! `MemoryExhausted` failure.

pub mod probe;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::config::{JobOptions, ProbeKind};
use crate::error::{QaError, Result};
use probe::{ProcessRss, TrackedUsage, UsageProbe};

/// Cleanup passes attempted before a ceiling breach becomes fatal.
pub const MAX_CLEANUP_ATTEMPTS: usize = 2;

/// Soft thresholds are scaled by this while an oversized chunk is in flight.
pub const OVERSIZED_TIGHTENING: f64 = 0.75;

pub(crate) struct Counter {
    in_use: AtomicU64,
    peak: AtomicU64,
    parent: Option<Arc<Counter>>,
}

impl Counter {
    fn new(parent: Option<Arc<Counter>>) -> Self {
        Self {
            in_use: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            parent,
        }
    }

    fn add(&self, n: u64) {
        let now = self.in_use.fetch_add(n, Ordering::SeqCst) + n;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(p) = &self.parent {
            p.add(n);
        }
    }

    fn sub(&self, n: u64) {
        self.in_use.fetch_sub(n, Ordering::SeqCst);
        if let Some(p) = &self.parent {
            p.sub(n);
        }
    }

    pub(crate) fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// Ceiling plus two soft thresholds, scoped to one job.
#[derive(Clone)]
pub struct MemoryBudget {
    ceiling: u64,
    warning_ratio: f64,
    cleanup_ratio: f64,
    counter: Arc<Counter>,
}

impl MemoryBudget {
    pub fn new(ceiling: u64, warning_ratio: f64, cleanup_ratio: f64) -> Self {
        Self {
            ceiling,
            warning_ratio,
            cleanup_ratio,
            counter: Arc::new(Counter::new(None)),
        }
    }

    pub fn from_options(opts: &JobOptions) -> Self {
        Self::new(
            opts.memory_ceiling_bytes,
            opts.warning_ratio,
            opts.cleanup_ratio,
        )
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn warning_threshold(&self) -> u64 {
        (self.ceiling as f64 * self.warning_ratio) as u64
    }

    pub fn cleanup_threshold(&self) -> u64 {
        (self.ceiling as f64 * self.cleanup_ratio) as u64
    }

    /// Charges `bytes` until the returned lease is dropped.
    pub fn lease(&self, bytes: u64) -> Lease {
        self.counter.add(bytes);
        Lease {
            counter: self.counter.clone(),
            bytes,
        }
    }

    pub fn in_use(&self) -> u64 {
        self.counter.in_use()
    }

    pub fn peak(&self) -> u64 {
        self.counter.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.counter.peak.store(self.in_use(), Ordering::SeqCst);
    }

    /// Divides the ceiling across `k` workers. Charges against a child also
    /// count against this budget.
    pub fn split(&self, k: usize) -> Vec<MemoryBudget> {
        let k = k.max(1);
        (0..k)
            .map(|_| MemoryBudget {
                ceiling: self.ceiling / k as u64,
                warning_ratio: self.warning_ratio,
                cleanup_ratio: self.cleanup_ratio,
                counter: Arc::new(Counter::new(Some(self.counter.clone()))),
            })
            .collect()
    }

    pub fn tracked_probe(&self) -> TrackedUsage {
        TrackedUsage {
            counter: self.counter.clone(),
        }
    }

    pub fn probe(&self, kind: ProbeKind) -> Arc<dyn UsageProbe> {
        match kind {
            ProbeKind::Process => Arc::new(ProcessRss),
            ProbeKind::Tracked => Arc::new(self.tracked_probe()),
        }
    }
}

/// Bytes charged to a budget; released on drop.
pub struct Lease {
    counter: Arc<Counter>,
    bytes: u64,
}

impl Lease {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn resize(&mut self, bytes: u64) {
        if bytes > self.bytes {
            self.counter.add(bytes - self.bytes);
        } else {
            self.counter.sub(self.bytes - bytes);
        }
        self.bytes = bytes;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counter.sub(self.bytes);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Warning,
    Cleanup,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupAction {
    None,
    SoftCleanup,
    HardAbort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupLevel {
    /// Warning threshold crossed: flush what can be flushed.
    Soft,
    /// Cleanup threshold or ceiling crossed: flush and release spare capacity.
    Aggressive,
}

/// Something holding transient memory it can hand back under pressure.
pub trait Reclaim {
    /// Releases what `level` allows; returns the bytes freed.
    fn reclaim(&mut self, level: CleanupLevel) -> Result<u64>;
}

/// Nothing to give back.
impl Reclaim for () {
    fn reclaim(&mut self, _level: CleanupLevel) -> Result<u64> {
        Ok(0)
    }
}

pub struct MemoryMonitor {
    budget: MemoryBudget,
    probe: Arc<dyn UsageProbe>,
    job_id: String,
    chunk: Option<u32>,
    level: PressureLevel,
    tighten: f64,
    last: u64,
    max_sampled: u64,
    cleanups: u64,
}

impl MemoryMonitor {
    pub fn new(job_id: impl Into<String>, budget: MemoryBudget, probe: Arc<dyn UsageProbe>) -> Self {
        Self {
            budget,
            probe,
            job_id: job_id.into(),
            chunk: None,
            level: PressureLevel::Normal,
            tighten: 1.0,
            last: 0,
            max_sampled: 0,
            cleanups: 0,
        }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn set_chunk(&mut self, chunk: Option<u32>) {
        self.chunk = chunk;
    }

    pub fn tighten_for_oversized(&mut self) {
        self.tighten = OVERSIZED_TIGHTENING;
        debug!(job_id = %self.job_id, chunk = ?self.chunk, "tightening memory thresholds for oversized chunk");
    }

    pub fn relax(&mut self) {
        self.tighten = 1.0;
    }

    /// Forgets everything observed; called at job start.
    pub fn reset(&mut self) {
        self.level = PressureLevel::Normal;
        self.tighten = 1.0;
        self.last = 0;
        self.max_sampled = 0;
        self.cleanups = 0;
        self.chunk = None;
        self.budget.reset_peak();
    }

    pub fn max_sampled(&self) -> u64 {
        self.max_sampled
    }

    pub fn cleanups_run(&self) -> u64 {
        self.cleanups
    }

    pub fn sample(&mut self) -> Result<u64> {
        let usage = match self.probe.sample() {
            Ok(u) => u,
            Err(e) if e.kind() == std::io::ErrorKind::Unsupported => 0,
            Err(e) => return Err(e.into()),
        };
        self.last = usage;
        self.max_sampled = self.max_sampled.max(usage);
        Ok(usage)
    }

    pub fn level_for(&self, usage: u64) -> PressureLevel {
        let warning = (self.budget.warning_threshold() as f64 * self.tighten) as u64;
        let cleanup = (self.budget.cleanup_threshold() as f64 * self.tighten) as u64;
        if usage > self.budget.ceiling() {
            PressureLevel::Critical
        } else if usage >= cleanup {
            PressureLevel::Cleanup
        } else if usage >= warning {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Samples once and, above the warning threshold, asks `held` to give
    /// memory back. `HardAbort` means usage stayed over the ceiling after that.
    pub fn check_and_maybe_cleanup(&mut self, held: &mut dyn Reclaim) -> Result<CleanupAction> {
        let usage = self.sample()?;
        let level = self.level_for(usage);
        self.note_crossing(level, usage);
        match level {
            PressureLevel::Normal => Ok(CleanupAction::None),
            PressureLevel::Warning => {
                self.cleanup(CleanupLevel::Soft, held)?;
                Ok(CleanupAction::SoftCleanup)
            }
            PressureLevel::Cleanup => {
                self.cleanup(CleanupLevel::Aggressive, held)?;
                Ok(CleanupAction::SoftCleanup)
            }
            PressureLevel::Critical => {
                self.cleanup(CleanupLevel::Aggressive, held)?;
                let after = self.sample()?;
                let after_level = self.level_for(after);
                self.note_crossing(after_level, after);
                if after > self.budget.ceiling() {
                    Ok(CleanupAction::HardAbort)
                } else {
                    Ok(CleanupAction::SoftCleanup)
                }
            }
        }
    }

    /// Samples around `block`, then cleans up until usage is back under the
    /// ceiling or `MAX_CLEANUP_ATTEMPTS` passes have failed.
    pub fn with_monitoring<T>(&mut self, block: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.sample()?;
        let out = block(self)?;
        self.settle(&mut ())?;
        Ok(out)
    }

    pub fn settle(&mut self, held: &mut dyn Reclaim) -> Result<()> {
        for attempt in 1..=MAX_CLEANUP_ATTEMPTS {
            match self.check_and_maybe_cleanup(held)? {
                CleanupAction::HardAbort => {
                    warn!(
                        job_id = %self.job_id,
                        chunk = ?self.chunk,
                        attempt,
                        usage = self.last,
                        ceiling = self.budget.ceiling(),
                        "cleanup failed to bring usage under ceiling"
                    );
                }
                _ => return Ok(()),
            }
        }
        Err(QaError::MemoryExhausted {
            usage: self.last,
            ceiling: self.budget.ceiling(),
        })
    }

    fn cleanup(&mut self, level: CleanupLevel, held: &mut dyn Reclaim) -> Result<()> {
        self.cleanups += 1;
        let released = held.reclaim(level)?;
        debug!(job_id = %self.job_id, chunk = ?self.chunk, ?level, released, "cleanup pass");
        Ok(())
    }

    fn note_crossing(&mut self, level: PressureLevel, usage: u64) {
        if level == self.level {
            return;
        }
        let usage_h = format_bytes(usage);
        if level > self.level {
            warn!(
                job_id = %self.job_id,
                chunk = ?self.chunk,
                from = ?self.level,
                to = ?level,
                usage = %usage_h,
                ceiling = %format_bytes(self.budget.ceiling()),
                "memory threshold crossed"
            );
        } else {
            info!(job_id = %self.job_id, chunk = ?self.chunk, from = ?self.level, to = ?level, usage = %usage_h, "memory pressure eased");
        }
        self.level = level;
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
