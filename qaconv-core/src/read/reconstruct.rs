use std::io::Write;
use std::path::Path;

use tracing::{info, warn};

use crate::boundary::csv::render_row;
use crate::container::manifest::Manifest;
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};
use crate::read::stream::RecordStream;
use crate::util::digest::RecordDigest;

/// Streams every chunk in manifest order and recomputes the record digest,
/// proving the chunk set holds exactly the source's records in order.
pub fn verify_reconstruction(manifest: &Manifest, chunk_dir: &Path, window: usize) -> Result<()> {
    let mut digest = RecordDigest::new();
    for chunk in &manifest.chunks {
        let before = digest.count();
        let mut stream = RecordStream::open_chunk(manifest, chunk_dir, chunk, window)?;
        while let Some((_, bytes)) = stream.next_raw()? {
            digest.push(bytes);
        }
        let got = digest.count() - before;
        if got != chunk.record_count {
            return Err(QaError::ChecksumMismatch {
                chunk: chunk.index,
                expected: format!("{} records", chunk.record_count),
                actual: format!("{got} records"),
            });
        }
    }
    let actual = digest.finish_hex();
    if actual != manifest.records_digest {
        warn!(job_id = %manifest.job_id, "reassembled records differ from source");
        return Err(QaError::ChecksumMismatch {
            chunk: manifest.chunks.last().map(|c| c.index).unwrap_or(0),
            expected: manifest.records_digest.clone(),
            actual,
        });
    }
    info!(job_id = %manifest.job_id, records = digest.count(), "reconstruction verified");
    Ok(())
}

/// Writes the records of all chunks back out as one document of the source's
/// kind. Returns the number of records written.
pub fn reassemble(manifest: &Manifest, chunk_dir: &Path, out: &mut impl Write, window: usize) -> Result<u64> {
    let mut n = 0u64;
    if manifest.kind == StructuralKind::JsonArray {
        out.write_all(b"[")?;
    }
    for chunk in &manifest.chunks {
        let mut stream = RecordStream::open_chunk(manifest, chunk_dir, chunk, window)?;
        while let Some((_, bytes)) = stream.next_raw()? {
            match manifest.kind {
                StructuralKind::JsonArray => {
                    let sep: &[u8] = if n == 0 { b"\n" } else { b",\n" };
                    out.write_all(sep)?;
                    out.write_all(bytes)?;
                }
                StructuralKind::Jsonl => {
                    out.write_all(bytes)?;
                    out.write_all(b"\n")?;
                }
                StructuralKind::CsvTabular => {
                    if n == 0 {
                        // the header is only known once the first record was scanned
                        let first = bytes.to_vec();
                        if let Some(h) = stream.headers() {
                            let d = manifest.csv.as_ref().map_or(b',', |c| c.delimiter);
                            writeln!(out, "{}", render_row(h, d))?;
                        }
                        out.write_all(&first)?;
                    } else {
                        out.write_all(bytes)?;
                    }
                    out.write_all(b"\n")?;
                }
            }
            n += 1;
        }
    }
    if manifest.kind == StructuralKind::JsonArray {
        let close: &[u8] = if n == 0 { b"]\n" } else { b"\n]\n" };
        out.write_all(close)?;
    }
    out.flush()?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBudget;
    use crate::split::writer::StructuralChunker;

    fn chunked(kind: StructuralKind, input: &[u8], target: u64) -> (tempfile::TempDir, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let m = StructuralChunker::new("r", kind, target, MemoryBudget::new(1 << 26, 0.8, 0.9))
            .split_reader(input, "mem", b',', dir.path())
            .unwrap();
        (dir, m)
    }

    #[test]
    fn reassembled_array_matches_source_records() {
        let input = b"[ {\"a\": 1},\n  {\"a\": [2, 3]} , \"s\" ]";
        let (dir, m) = chunked(StructuralKind::JsonArray, input, 10);
        verify_reconstruction(&m, dir.path(), 5).unwrap();

        let mut out = Vec::new();
        assert_eq!(reassemble(&m, dir.path(), &mut out, 64).unwrap(), 3);
        assert_eq!(out, b"[\n{\"a\": 1},\n{\"a\": [2, 3]},\n\"s\"\n]\n");
    }

    #[test]
    fn csv_reassembly_writes_one_header() {
        let input = b"id,v\n1,x\n2,y\n";
        let (dir, m) = chunked(StructuralKind::CsvTabular, input, 1);
        assert_eq!(m.chunks.len(), 2);
        let mut out = Vec::new();
        reassemble(&m, dir.path(), &mut out, 64).unwrap();
        assert_eq!(out, b"id,v\n1,x\n2,y\n");
    }

    #[test]
    fn tampered_chunk_fails_reconstruction() {
        let (dir, m) = chunked(StructuralKind::Jsonl, b"{\"a\":1}\n{\"a\":2}\n", 4);
        std::fs::write(m.chunks[1].path(dir.path()), b"{\"a\":9}\n").unwrap();
        assert!(matches!(
            verify_reconstruction(&m, dir.path(), 64),
            Err(QaError::ChecksumMismatch { chunk: 1, .. })
        ));
    }
}
