use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One chunk file on disk. Immutable once written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u32,
    pub file_name: String,
    /// Byte range `[source_start, source_end)` of the chunk's records in the source.
    pub source_start: u64,
    pub source_end: u64,
    /// Ordinal of the chunk's first record in the whole source.
    pub first_record: u64,
    pub record_count: u64,
    pub byte_len: u64,
    /// blake3 of the chunk file, hex.
    pub checksum: String,
    /// The chunk picks up the source's array/table after an earlier chunk.
    pub continues_previous: bool,
    /// A single record larger than the target chunk size.
    pub oversized: bool,
    /// The CSV header line was copied in front of the rows.
    pub header_replicated: bool,
}

impl ChunkInfo {
    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }

    pub fn end_record(&self) -> u64 {
        self.first_record + self.record_count
    }
}

pub fn chunk_file_name(index: u32, ext: &str) -> String {
    format!("chunk_{index:06}.{ext}")
}

/// True for names produced by [`chunk_file_name`] and for in-flight temp files.
pub fn is_chunk_artifact(name: &str) -> bool {
    name.starts_with("chunk_") || name.starts_with(".tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_sort_in_index_order() {
        let a = chunk_file_name(9, "json");
        let b = chunk_file_name(10, "json");
        assert_eq!(a, "chunk_000009.json");
        assert!(a < b);
        assert!(is_chunk_artifact(&b));
        assert!(!is_chunk_artifact("manifest.cbor"));
    }
}
