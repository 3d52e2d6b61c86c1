use std::fmt;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::RowGrouping;
use crate::container::chunk::ChunkInfo;
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};
use crate::util::digest::to_hex;
use crate::util::fsio::atomic_write;

pub const SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.cbor";

/// How CSV chunks are laid out, so a chunk can be read without the options
/// it was split with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CsvLayout {
    pub delimiter: u8,
    pub grouping: RowGrouping,
}

/// Facts about the source gathered while chunking.
#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub job_id: String,
    pub kind: StructuralKind,
    pub source_path: String,
    pub source_len: u64,
    pub source_checksum: String,
    pub records_digest: String,
    pub target_chunk_size: u64,
    pub csv: Option<CsvLayout>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub schema_version: u32,
    pub job_id: String,
    pub kind: StructuralKind,
    pub source_path: String,
    pub source_len: u64,
    /// blake3 of every source byte, hex.
    pub source_checksum: String,
    /// blake3 over the per-record blake3 digests, in record order.
    pub records_digest: String,
    pub total_records: u64,
    pub target_chunk_size: u64,
    pub csv: Option<CsvLayout>,
    /// Unix seconds.
    pub created: i64,
    pub chunks: Vec<ChunkInfo>,
}

impl Manifest {
    pub fn build(source: SourceSummary, chunks: Vec<ChunkInfo>) -> Manifest {
        let total_records = chunks.iter().map(|c| c.record_count).sum();
        Manifest {
            schema_version: SCHEMA_VERSION,
            job_id: source.job_id,
            kind: source.kind,
            source_path: source.source_path,
            source_len: source.source_len,
            source_checksum: source.source_checksum,
            records_digest: source.records_digest,
            total_records,
            target_chunk_size: source.target_chunk_size,
            csv: source.csv,
            created: OffsetDateTime::now_utc().unix_timestamp(),
            chunks,
        }
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| QaError::Format(format!("manifest encode: {e}")))?;
        atomic_write(path, &buf)?;
        debug!(job_id = %self.job_id, path = %path.display(), chunks = self.chunks.len(), "manifest persisted");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Manifest> {
        let f = File::open(path)?;
        let manifest: Manifest = ciborium::de::from_reader(std::io::BufReader::new(f))
            .map_err(|e| QaError::Format(format!("manifest decode: {e}")))?;
        Ok(manifest)
    }

    /// Re-derives every chunk checksum from disk and checks the bookkeeping.
    /// Never stops at the first problem.
    pub fn validate(&self, chunk_dir: &Path) -> ValidationReport {
        let mut problems = Vec::new();

        if self.schema_version != SCHEMA_VERSION {
            problems.push(Problem::SchemaVersion(self.schema_version));
        }

        let mut next_record = 0u64;
        for (pos, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != pos {
                problems.push(Problem::IndexGap {
                    expected: pos as u32,
                    found: chunk.index,
                });
            }
            if chunk.first_record != next_record {
                problems.push(Problem::RecordGap {
                    index: chunk.index,
                    expected: next_record,
                    found: chunk.first_record,
                });
            }
            next_record = chunk.end_record();

            let path = chunk.path(chunk_dir);
            let f = match File::open(&path) {
                Ok(f) => f,
                Err(_) => {
                    problems.push(Problem::MissingChunk {
                        index: chunk.index,
                        file: chunk.file_name.clone(),
                    });
                    continue;
                }
            };
            let mut hasher = blake3::Hasher::new();
            let len = match std::io::copy(&mut std::io::BufReader::new(f), &mut hasher) {
                Ok(n) => n,
                Err(e) => {
                    problems.push(Problem::Unreadable {
                        index: chunk.index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if len != chunk.byte_len {
                problems.push(Problem::SizeMismatch {
                    index: chunk.index,
                    expected: chunk.byte_len,
                    actual: len,
                });
            }
            let actual = to_hex(hasher.finalize().as_bytes());
            if actual != chunk.checksum {
                problems.push(Problem::ChecksumMismatch {
                    index: chunk.index,
                    expected: chunk.checksum.clone(),
                    actual,
                });
            }
        }

        let sum: u64 = self.chunks.iter().map(|c| c.record_count).sum();
        if sum != self.total_records {
            problems.push(Problem::TotalMismatch {
                sum,
                total: self.total_records,
            });
        }

        for p in &problems {
            warn!(job_id = %self.job_id, problem = %p, "manifest validation problem");
        }
        ValidationReport { problems }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    SchemaVersion(u32),
    MissingChunk { index: u32, file: String },
    Unreadable { index: u32, reason: String },
    SizeMismatch { index: u32, expected: u64, actual: u64 },
    ChecksumMismatch { index: u32, expected: String, actual: String },
    IndexGap { expected: u32, found: u32 },
    RecordGap { index: u32, expected: u64, found: u64 },
    TotalMismatch { sum: u64, total: u64 },
}

impl Problem {
    fn chunk(&self) -> u32 {
        match self {
            Problem::MissingChunk { index, .. }
            | Problem::Unreadable { index, .. }
            | Problem::SizeMismatch { index, .. }
            | Problem::ChecksumMismatch { index, .. }
            | Problem::RecordGap { index, .. } => *index,
            Problem::IndexGap { found, .. } => *found,
            Problem::SchemaVersion(_) | Problem::TotalMismatch { .. } => 0,
        }
    }

    fn expected_actual(&self) -> (String, String) {
        match self {
            Problem::SchemaVersion(v) => (format!("schema {SCHEMA_VERSION}"), format!("schema {v}")),
            Problem::MissingChunk { file, .. } => (file.clone(), "missing".into()),
            Problem::Unreadable { reason, .. } => ("readable chunk".into(), reason.clone()),
            Problem::SizeMismatch { expected, actual, .. } => {
                (format!("{expected} bytes"), format!("{actual} bytes"))
            }
            Problem::ChecksumMismatch {
                expected, actual, ..
            } => (expected.clone(), actual.clone()),
            Problem::IndexGap { expected, found } => {
                (format!("index {expected}"), format!("index {found}"))
            }
            Problem::RecordGap {
                expected, found, ..
            } => (format!("first record {expected}"), format!("first record {found}")),
            Problem::TotalMismatch { sum, total } => {
                (format!("{total} records"), format!("{sum} records"))
            }
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::SchemaVersion(v) => write!(f, "unsupported schema version {v}"),
            Problem::MissingChunk { index, file } => write!(f, "chunk {index}: {file} missing"),
            Problem::Unreadable { index, reason } => write!(f, "chunk {index}: unreadable: {reason}"),
            Problem::SizeMismatch {
                index,
                expected,
                actual,
            } => write!(f, "chunk {index}: {actual} bytes on disk, manifest says {expected}"),
            Problem::ChecksumMismatch {
                index,
                expected,
                actual,
            } => write!(f, "chunk {index}: checksum {actual}, manifest says {expected}"),
            Problem::IndexGap { expected, found } => {
                write!(f, "chunk index {found} where {expected} was expected")
            }
            Problem::RecordGap {
                index,
                expected,
                found,
            } => write!(f, "chunk {index}: starts at record {found}, expected {expected}"),
            Problem::TotalMismatch { sum, total } => {
                write!(f, "chunk record counts sum to {sum}, manifest total is {total}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub problems: Vec<Problem>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        match self.problems.into_iter().next() {
            None => Ok(()),
            Some(p) => {
                let (expected, actual) = p.expected_actual();
                Err(QaError::ChecksumMismatch {
                    chunk: p.chunk(),
                    expected,
                    actual,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::chunk::chunk_file_name;

    fn write_chunk(dir: &Path, index: u32, first: u64, body: &[u8], records: u64) -> ChunkInfo {
        let file_name = chunk_file_name(index, "jsonl");
        std::fs::write(dir.join(&file_name), body).unwrap();
        ChunkInfo {
            index,
            file_name,
            source_start: 0,
            source_end: body.len() as u64,
            first_record: first,
            record_count: records,
            byte_len: body.len() as u64,
            checksum: to_hex(blake3::hash(body).as_bytes()),
            continues_previous: index > 0,
            oversized: false,
            header_replicated: false,
        }
    }

    fn summary() -> SourceSummary {
        SourceSummary {
            job_id: "job-1".into(),
            kind: StructuralKind::Jsonl,
            source_path: "in.jsonl".into(),
            source_len: 12,
            source_checksum: String::new(),
            records_digest: String::new(),
            target_chunk_size: 6,
            csv: None,
        }
    }

    #[test]
    fn persist_load_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = vec![
            write_chunk(dir.path(), 0, 0, b"{\"a\":1}\n", 1),
            write_chunk(dir.path(), 1, 1, b"{\"a\":2}\n{\"a\":3}\n", 2),
        ];
        let m = Manifest::build(summary(), chunks);
        assert_eq!(m.total_records, 3);

        let path = dir.path().join(MANIFEST_FILE);
        m.persist(&path).unwrap();
        let back = Manifest::load(&path).unwrap();
        assert_eq!(back, m);
        assert!(back.validate(dir.path()).is_ok());
    }

    #[test]
    fn detects_flipped_byte_and_bad_totals() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = vec![
            write_chunk(dir.path(), 0, 0, b"{\"a\":1}\n", 1),
            write_chunk(dir.path(), 1, 1, b"{\"a\":2}\n", 1),
        ];
        let mut m = Manifest::build(summary(), chunks);
        std::fs::write(dir.path().join(&m.chunks[1].file_name), b"{\"a\":3}\n").unwrap();
        m.total_records = 5;

        let report = m.validate(dir.path());
        assert_eq!(report.problems.len(), 2);
        assert!(matches!(report.problems[0], Problem::ChecksumMismatch { index: 1, .. }));
        assert!(matches!(
            report.into_result(),
            Err(QaError::ChecksumMismatch { chunk: 1, .. })
        ));
    }

    #[test]
    fn detects_missing_chunk_and_record_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunks = vec![
            write_chunk(dir.path(), 0, 0, b"{}\n", 1),
            write_chunk(dir.path(), 1, 2, b"{}\n", 1),
        ];
        chunks[0].record_count = 1;
        std::fs::remove_file(dir.path().join(&chunks[0].file_name)).unwrap();
        let m = Manifest::build(summary(), chunks);
        let report = m.validate(dir.path());
        assert!(report.problems.contains(&Problem::MissingChunk {
            index: 0,
            file: chunk_file_name(0, "jsonl")
        }));
        assert!(report.problems.contains(&Problem::RecordGap {
            index: 1,
            expected: 1,
            found: 2
        }));
    }
}
