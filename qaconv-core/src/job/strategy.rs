use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::StrategyThresholds;
use crate::error::Result;

/// How a source is read, chosen once from its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Whole file resident, read through the record stream.
    Standard,
    /// Record at a time from the source, no chunk files.
    Streaming,
    /// Chunk files first, then record at a time per chunk.
    SplittingWithStreaming,
}

impl Strategy {
    pub fn select(size: u64, thresholds: &StrategyThresholds) -> Self {
        if size <= thresholds.standard_max {
            Strategy::Standard
        } else if size <= thresholds.streaming_max {
            Strategy::Streaming
        } else {
            Strategy::SplittingWithStreaming
        }
    }

    /// Stats `path` and picks a strategy for it.
    pub fn analyze(path: &Path, thresholds: &StrategyThresholds) -> Result<(u64, Self)> {
        let size = std::fs::metadata(path)?.len();
        Ok((size, Self::select(size, thresholds)))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Standard => "standard",
            Strategy::Streaming => "streaming",
            Strategy::SplittingWithStreaming => "splitting-with-streaming",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    #[test]
    fn size_thresholds_are_inclusive() {
        let t = StrategyThresholds::default();
        assert_eq!(Strategy::select(0, &t), Strategy::Standard);
        assert_eq!(Strategy::select(50 * MIB, &t), Strategy::Standard);
        assert_eq!(Strategy::select(50 * MIB + 1, &t), Strategy::Streaming);
        assert_eq!(Strategy::select(100 * MIB, &t), Strategy::Streaming);
        assert_eq!(
            Strategy::select(100 * MIB + 1, &t),
            Strategy::SplittingWithStreaming
        );
    }

    #[test]
    fn analyze_reads_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("s.jsonl");
        std::fs::write(&p, b"{}\n{}\n").unwrap();
        let tiny = StrategyThresholds {
            standard_max: 2,
            streaming_max: 4,
        };
        assert_eq!(
            Strategy::analyze(&p, &tiny).unwrap(),
            (6, Strategy::SplittingWithStreaming)
        );
    }
}
