//! Output sinks for canonical entries.
//!
//! The engine needs ordered append plus a count of what a job already wrote.
//! `truncate` lets a resumed job drop entries of a chunk whose checkpoint was
//! never persisted.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::domain::CanonicalQaEntry;
use crate::error::{QaError, Result};

pub trait OutputSink: Send {
    /// Entries already held for `job_id`.
    fn records_written(&mut self, job_id: &str) -> Result<u64>;

    /// Appends in order. Not durable until [`OutputSink::sync`].
    fn append(&mut self, job_id: &str, entries: &[CanonicalQaEntry]) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    /// Keeps the first `count` entries of `job_id`.
    fn truncate(&mut self, job_id: &str, count: u64) -> Result<()>;
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn records_written(&mut self, job_id: &str) -> Result<u64> {
        (**self).records_written(job_id)
    }

    fn append(&mut self, job_id: &str, entries: &[CanonicalQaEntry]) -> Result<()> {
        (**self).append(job_id, entries)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn truncate(&mut self, job_id: &str, count: u64) -> Result<()> {
        (**self).truncate(job_id, count)
    }
}

struct JobFile {
    path: PathBuf,
    out: BufWriter<File>,
    lines: u64,
}

/// One `<job_id>.jsonl` per job under a directory, one entry per line.
pub struct JsonlSink {
    dir: PathBuf,
    open: HashMap<String, JobFile>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| QaError::from_write(e, &dir))?;
        Ok(Self {
            dir,
            open: HashMap::new(),
        })
    }

    pub fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.jsonl"))
    }

    fn job(&mut self, job_id: &str) -> Result<&mut JobFile> {
        if !self.open.contains_key(job_id) {
            let path = self.path(job_id);
            let lines = drop_torn_tail(&path)?;
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| QaError::from_write(e, &path))?;
            debug!(job_id, path = %path.display(), lines, "sink opened");
            self.open.insert(
                job_id.to_string(),
                JobFile {
                    path,
                    out: BufWriter::new(f),
                    lines,
                },
            );
        }
        self.open
            .get_mut(job_id)
            .ok_or_else(|| QaError::UnknownJob(job_id.to_string()))
    }
}

/// Complete lines in `path` and the offset just past the last newline.
fn scan_lines(path: &Path) -> Result<Option<(u64, u64, u64)>> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(f);
    let (mut n, mut pos, mut end_of_last) = (0u64, 0u64, 0u64);
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        for (i, b) in buf.iter().enumerate() {
            if *b == b'\n' {
                n += 1;
                end_of_last = pos + i as u64 + 1;
            }
        }
        let len = buf.len();
        pos += len as u64;
        reader.consume(len);
    }
    Ok(Some((n, end_of_last, pos)))
}

/// Counts the complete lines of a job file, cutting a partial last line
/// left by an interrupted write.
fn drop_torn_tail(path: &Path) -> Result<u64> {
    let Some((lines, keep, len)) = scan_lines(path)? else {
        return Ok(0);
    };
    if len > keep {
        warn!(path = %path.display(), lines, dropped = len - keep, "cutting partial line at end of job file");
        let f = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| QaError::from_write(e, path))?;
        f.set_len(keep)?;
        f.sync_all()?;
    }
    Ok(lines)
}

/// Byte offset just past the `count`-th newline, or `None` if the file is shorter.
fn offset_after_lines(path: &Path, count: u64) -> Result<Option<u64>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut seen = 0u64;
    let mut offset = 0u64;
    while seen < count {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        let mut used = buf.len();
        for (i, b) in buf.iter().enumerate() {
            if *b == b'\n' {
                seen += 1;
                if seen == count {
                    used = i + 1;
                    break;
                }
            }
        }
        offset += used as u64;
        reader.consume(used);
    }
    Ok(Some(offset))
}

impl OutputSink for JsonlSink {
    fn records_written(&mut self, job_id: &str) -> Result<u64> {
        Ok(self.job(job_id)?.lines)
    }

    fn append(&mut self, job_id: &str, entries: &[CanonicalQaEntry]) -> Result<()> {
        let job = self.job(job_id)?;
        for entry in entries {
            serde_json::to_writer(&mut job.out, entry)
                .map_err(|e| QaError::Format(format!("entry encode: {e}")))?;
            job.out
                .write_all(b"\n")
                .map_err(|e| QaError::from_write(e, &job.path))?;
        }
        job.lines += entries.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for job in self.open.values_mut() {
            job.out.flush().map_err(|e| QaError::from_write(e, &job.path))?;
            job.out
                .get_ref()
                .sync_all()
                .map_err(|e| QaError::from_write(e, &job.path))?;
        }
        Ok(())
    }

    fn truncate(&mut self, job_id: &str, count: u64) -> Result<()> {
        let job = self.job(job_id)?;
        if count >= job.lines {
            return Ok(());
        }
        job.out.flush()?;
        let offset = offset_after_lines(&job.path, count)?.ok_or(QaError::ResumeMismatch {
            checkpoint: count,
            sink: job.lines,
        })?;
        let f = job.out.get_mut();
        f.set_len(offset)?;
        f.seek(SeekFrom::End(0))?;
        f.sync_all()?;
        info!(job_id, from = job.lines, to = count, "sink truncated");
        job.lines = count;
        Ok(())
    }
}

/// Keeps entries in memory; for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    jobs: HashMap<String, Vec<CanonicalQaEntry>>,
    syncs: u64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, job_id: &str) -> &[CanonicalQaEntry] {
        self.jobs.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_entries(mut self, job_id: &str) -> Vec<CanonicalQaEntry> {
        self.jobs.remove(job_id).unwrap_or_default()
    }

    pub fn syncs(&self) -> u64 {
        self.syncs
    }
}

impl OutputSink for MemorySink {
    fn records_written(&mut self, job_id: &str) -> Result<u64> {
        Ok(self.entries(job_id).len() as u64)
    }

    fn append(&mut self, job_id: &str, entries: &[CanonicalQaEntry]) -> Result<()> {
        self.jobs
            .entry(job_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.syncs += 1;
        Ok(())
    }

    fn truncate(&mut self, job_id: &str, count: u64) -> Result<()> {
        if let Some(v) = self.jobs.get_mut(job_id) {
            v.truncate(count as usize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnswerValue, Metadata};

    fn entry(q: &str) -> CanonicalQaEntry {
        CanonicalQaEntry::new(q, AnswerValue::Integer(1), None, Metadata::new()).unwrap()
    }

    #[test]
    fn jsonl_sink_counts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path()).unwrap();
        sink.append("j", &[entry("a"), entry("b")]).unwrap();
        sink.sync().unwrap();
        drop(sink);

        let mut sink = JsonlSink::new(dir.path()).unwrap();
        assert_eq!(sink.records_written("j").unwrap(), 2);
        assert_eq!(sink.records_written("other").unwrap(), 0);
        sink.append("j", &[entry("c")]).unwrap();
        sink.sync().unwrap();

        let text = std::fs::read_to_string(sink.path("j")).unwrap();
        let qs: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<CanonicalQaEntry>(l).unwrap().question)
            .collect();
        assert_eq!(qs, vec!["a", "b", "c"]);
    }

    #[test]
    fn truncate_drops_trailing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path()).unwrap();
        sink.append("j", &[entry("a"), entry("b"), entry("c")]).unwrap();
        sink.truncate("j", 1).unwrap();
        sink.append("j", &[entry("d")]).unwrap();
        sink.sync().unwrap();

        let text = std::fs::read_to_string(sink.path("j")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().contains("\"d\""));
        assert_eq!(sink.records_written("j").unwrap(), 2);
    }

    #[test]
    fn reopen_cuts_partial_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path()).unwrap();
        sink.append("j", &[entry("a"), entry("b")]).unwrap();
        sink.sync().unwrap();
        let path = sink.path("j");
        drop(sink);

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"question\":\"c").unwrap();
        drop(f);

        let mut sink = JsonlSink::new(dir.path()).unwrap();
        assert_eq!(sink.records_written("j").unwrap(), 2);
        sink.append("j", &[entry("d")]).unwrap();
        sink.sync().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let qs: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<CanonicalQaEntry>(l).unwrap().question)
            .collect();
        assert_eq!(qs, vec!["a", "b", "d"]);
    }

    #[test]
    fn memory_sink_keeps_jobs_apart() {
        let mut sink = MemorySink::new();
        sink.append("a", &[entry("1")]).unwrap();
        sink.append("b", &[entry("2"), entry("3")]).unwrap();
        sink.truncate("b", 1).unwrap();
        assert_eq!(sink.records_written("a").unwrap(), 1);
        assert_eq!(sink.entries("b")[0].question, "2");
        assert_eq!(sink.entries("b").len(), 1);
    }
}
