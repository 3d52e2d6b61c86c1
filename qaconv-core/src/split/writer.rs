use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::boundary::{RecordScanner, detector_for};
use crate::config::TabularOptions;
use crate::container::chunk::{ChunkInfo, chunk_file_name, is_chunk_artifact};
use crate::container::manifest::{CsvLayout, Manifest, SourceSummary};
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};
use crate::memory::{Lease, MemoryBudget};
use crate::util::digest::{RecordDigest, to_hex};
use crate::util::fsio::sync_dir;
use crate::util::hash_forward::HashingForward;

const WRITE_BUF: usize = 64 * 1024;

/// Splits a source into self-contained chunk files whose boundaries fall only
/// between records.
pub struct StructuralChunker {
    job_id: String,
    kind: StructuralKind,
    target: u64,
    window: usize,
    tabular: TabularOptions,
    budget: MemoryBudget,
}

impl StructuralChunker {
    pub fn new(
        job_id: impl Into<String>,
        kind: StructuralKind,
        target_chunk_size: u64,
        budget: MemoryBudget,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            target: target_chunk_size.max(1),
            window: WRITE_BUF,
            tabular: TabularOptions::default(),
            budget,
        }
    }

    pub fn with_tabular(mut self, tabular: TabularOptions) -> Self {
        self.tabular = tabular;
        self
    }

    /// Read window of the boundary scanner.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Chunks `source` into `chunk_dir` and persists the manifest at
    /// `manifest_path`. Running out of disk removes this job's chunk files.
    pub fn split_file(&self, source: &Path, chunk_dir: &Path, manifest_path: &Path) -> Result<Manifest> {
        let f = File::open(source)?;
        let delimiter = self.tabular.delimiter_for(source);
        let label = source.display().to_string();
        let result = self
            .split_reader(f, &label, delimiter, chunk_dir)
            .and_then(|m| m.persist(manifest_path).map(|_| m));

        if let Err(err @ QaError::InsufficientStorage { .. }) = &result {
            match remove_chunk_files(chunk_dir) {
                Ok(removed) => {
                    warn!(job_id = %self.job_id, removed, error = %err, "disk full while chunking; partial chunks removed")
                }
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "failed to remove partial chunks")
                }
            }
        }
        result
    }

    pub fn split_reader<R: Read>(
        &self,
        src: R,
        label: &str,
        delimiter: u8,
        chunk_dir: &Path,
    ) -> Result<Manifest> {
        fs::create_dir_all(chunk_dir).map_err(|e| QaError::from_write(e, chunk_dir))?;

        let detector = detector_for(self.kind, &self.tabular, delimiter);
        let mut scanner = RecordScanner::new(src, detector, self.window)
            .with_hasher()
            .with_budget(&self.budget);

        let mut header: Option<Vec<u8>> = None;
        let mut open: Option<OpenChunk> = None;
        let mut chunks: Vec<ChunkInfo> = Vec::new();
        let mut digest = RecordDigest::new();
        let mut ordinal = 0u64;

        while let Some(span) = scanner.next_span()? {
            let bytes = scanner.bytes(&span);
            if span.is_header() {
                header = Some(bytes.to_vec());
                continue;
            }

            let full = open
                .as_ref()
                .is_some_and(|c| c.record_count > 0 && c.written() + bytes.len() as u64 + 1 > self.target);
            if full {
                if let Some(c) = open.take() {
                    chunks.push(c.close(self.target)?);
                }
            }

            if open.is_none() {
                open = Some(OpenChunk::create(
                    chunk_dir,
                    chunks.len() as u32,
                    self.kind,
                    header.as_deref(),
                    span.start,
                    ordinal,
                    &self.budget,
                )?);
            }
            if let Some(chunk) = open.as_mut() {
                chunk.push(bytes, span.end)?;
            }
            digest.push(bytes);
            ordinal += 1;
        }
        if let Some(c) = open.take() {
            chunks.push(c.close(self.target)?);
        }
        sync_dir(chunk_dir)?;

        let source_checksum = scanner
            .source_digest()
            .map(|d| to_hex(&d))
            .unwrap_or_default();
        let csv = (self.kind == StructuralKind::CsvTabular).then(|| CsvLayout {
            delimiter,
            grouping: self.tabular.grouping.clone(),
        });
        let manifest = Manifest::build(
            SourceSummary {
                job_id: self.job_id.clone(),
                kind: self.kind,
                source_path: label.to_string(),
                source_len: scanner.bytes_read(),
                source_checksum,
                records_digest: digest.finish_hex(),
                target_chunk_size: self.target,
                csv,
            },
            chunks,
        );
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            chunks = manifest.chunks.len(),
            records = manifest.total_records,
            bytes = manifest.source_len,
            "source chunked"
        );
        Ok(manifest)
    }
}

/// Chunk file being written through a temp file in the chunk directory.
struct OpenChunk {
    out: HashingForward<BufWriter<NamedTempFile>>,
    kind: StructuralKind,
    index: u32,
    dest: std::path::PathBuf,
    file_name: String,
    source_start: u64,
    source_end: u64,
    first_record: u64,
    record_count: u64,
    largest_record: u64,
    header_replicated: bool,
    _lease: Lease,
}

impl OpenChunk {
    fn create(
        dir: &Path,
        index: u32,
        kind: StructuralKind,
        header: Option<&[u8]>,
        source_start: u64,
        first_record: u64,
        budget: &MemoryBudget,
    ) -> Result<Self> {
        let file_name = chunk_file_name(index, kind.chunk_extension());
        let dest = dir.join(&file_name);
        let tmp = NamedTempFile::new_in(dir).map_err(|e| QaError::from_write(e, &dest))?;
        let mut out = HashingForward::new(BufWriter::with_capacity(WRITE_BUF, tmp));

        let mut header_replicated = false;
        match kind {
            StructuralKind::JsonArray => out.write_all(b"[\n"),
            StructuralKind::CsvTabular => match header {
                Some(h) => {
                    header_replicated = true;
                    out.write_all(h).and_then(|_| out.write_all(b"\n"))
                }
                None => Ok(()),
            },
            StructuralKind::Jsonl => Ok(()),
        }
        .map_err(|e| QaError::from_write(e, &dest))?;

        Ok(Self {
            out,
            kind,
            index,
            dest,
            file_name,
            source_start,
            source_end: source_start,
            first_record,
            record_count: 0,
            largest_record: 0,
            header_replicated,
            _lease: budget.lease(WRITE_BUF as u64),
        })
    }

    fn written(&self) -> u64 {
        self.out.written
    }

    fn push(&mut self, record: &[u8], source_end: u64) -> Result<()> {
        let res = match self.kind {
            StructuralKind::JsonArray => {
                let sep: &[u8] = if self.record_count > 0 { b",\n" } else { b"" };
                self.out.write_all(sep).and_then(|_| self.out.write_all(record))
            }
            StructuralKind::Jsonl | StructuralKind::CsvTabular => self
                .out
                .write_all(record)
                .and_then(|_| self.out.write_all(b"\n")),
        };
        res.map_err(|e| QaError::from_write(e, &self.dest))?;
        self.record_count += 1;
        self.largest_record = self.largest_record.max(record.len() as u64);
        self.source_end = source_end;
        Ok(())
    }

    fn close(mut self, target: u64) -> Result<ChunkInfo> {
        if self.kind == StructuralKind::JsonArray {
            self.out
                .write_all(b"\n]\n")
                .map_err(|e| QaError::from_write(e, &self.dest))?;
        }
        self.out
            .flush()
            .map_err(|e| QaError::from_write(e, &self.dest))?;
        let (buf, digest, byte_len) = self.out.finish();
        let tmp = buf
            .into_inner()
            .map_err(|e| QaError::from_write(e.into_error(), &self.dest))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| QaError::from_write(e, &self.dest))?;
        tmp.persist(&self.dest)
            .map_err(|e| QaError::from_write(e.error, &self.dest))?;

        let oversized = self.largest_record > target;
        debug!(
            chunk = self.index,
            records = self.record_count,
            bytes = byte_len,
            oversized,
            "chunk written"
        );
        Ok(ChunkInfo {
            index: self.index,
            file_name: self.file_name,
            source_start: self.source_start,
            source_end: self.source_end,
            first_record: self.first_record,
            record_count: self.record_count,
            byte_len,
            checksum: to_hex(&digest),
            continues_previous: self.index > 0,
            oversized,
            header_replicated: self.header_replicated,
        })
    }
}

/// Deletes chunk files and leftover temp files directly inside `dir`.
pub fn remove_chunk_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for e in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let e = e.map_err(|e| std::io::Error::other(e.to_string()))?;
        let name = e.file_name().to_string_lossy();
        if e.file_type().is_file() && is_chunk_artifact(&name) {
            fs::remove_file(e.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RowGrouping;

    fn budget() -> MemoryBudget {
        MemoryBudget::new(64 << 20, 0.8, 0.9)
    }

    fn split(kind: StructuralKind, input: &[u8], target: u64, tab: TabularOptions) -> (tempfile::TempDir, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let m = StructuralChunker::new("t", kind, target, budget())
            .with_tabular(tab)
            .with_window(7)
            .split_reader(input, "mem", b',', dir.path())
            .unwrap();
        (dir, m)
    }

    fn chunk_text(dir: &Path, c: &ChunkInfo) -> String {
        std::fs::read_to_string(c.path(dir)).unwrap()
    }

    #[test]
    fn json_array_one_record_per_chunk_when_target_is_tiny() {
        let input = br#"[{"id":"g1","nodes":[1,2]},{"id":"g2"},{"id":"g3","x":[[1],[2]]}]"#;
        let (dir, m) = split(StructuralKind::JsonArray, input, 4, TabularOptions::default());
        assert_eq!(m.chunks.len(), 3);
        assert_eq!(m.total_records, 3);
        assert!(m.chunks.iter().all(|c| c.record_count == 1 && c.oversized));
        assert_eq!(chunk_text(dir.path(), &m.chunks[1]), "[\n{\"id\":\"g2\"}\n]\n");
        assert!(!m.chunks[0].continues_previous && m.chunks[2].continues_previous);
        assert_eq!(m.source_len, input.len() as u64);
        assert_eq!(m.source_checksum, to_hex(blake3::hash(input).as_bytes()));
        assert!(m.validate(dir.path()).is_ok());
    }

    #[test]
    fn records_pack_up_to_target() {
        let input = b"{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n{\"a\":4}\n{\"a\":5}\n";
        let (dir, m) = split(StructuralKind::Jsonl, input, 17, TabularOptions::default());
        let counts: Vec<u64> = m.chunks.iter().map(|c| c.record_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert_eq!(m.chunks[1].first_record, 2);
        assert_eq!(chunk_text(dir.path(), &m.chunks[2]), "{\"a\":5}\n");
        assert!(m.chunks.iter().all(|c| !c.oversized));
    }

    #[test]
    fn csv_header_is_replicated() {
        let input = b"scenario_id,q\ns1,a\ns1,b\ns2,c\n";
        let tab = TabularOptions {
            grouping: RowGrouping::ByColumn("scenario_id".into()),
            ..Default::default()
        };
        let (dir, m) = split(StructuralKind::CsvTabular, input, 1, tab);
        assert_eq!(m.chunks.len(), 2);
        assert_eq!(chunk_text(dir.path(), &m.chunks[0]), "scenario_id,q\ns1,a\ns1,b\n");
        assert_eq!(chunk_text(dir.path(), &m.chunks[1]), "scenario_id,q\ns2,c\n");
        assert!(m.chunks[1].header_replicated);
        assert_eq!(m.csv.as_ref().map(|c| c.delimiter), Some(b','));
    }

    #[test]
    fn corruption_reports_offset() {
        let dir = tempfile::tempdir().unwrap();
        let err = StructuralChunker::new("t", StructuralKind::JsonArray, 8, budget())
            .split_reader(&b"[{\"a\":1}, {\"b\":]"[..], "mem", b',', dir.path())
            .unwrap_err();
        assert!(matches!(err, QaError::StructuralCorruption { offset: 15, .. }));
    }

    #[test]
    fn remove_chunk_files_spares_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chunk_000000.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("manifest.cbor"), b"x").unwrap();
        assert_eq!(remove_chunk_files(dir.path()).unwrap(), 1);
        assert!(dir.path().join("manifest.cbor").exists());
    }
}
