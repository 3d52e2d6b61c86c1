use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::DomainFamily;
use crate::error::{QaError, Result};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// How CSV/TSV rows are grouped into one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowGrouping {
    /// Exactly `n` rows per record (the last record may be shorter).
    FixedRows(usize),
    /// Consecutive rows sharing this column's value form one record.
    ByColumn(String),
}

impl Default for RowGrouping {
    fn default() -> Self {
        RowGrouping::FixedRows(1)
    }
}

/// Column layout of a grouped-scenario table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSchema {
    pub id_column: String,
    /// Copied verbatim into every entry's metadata.
    pub context_columns: Vec<String>,
    /// (question column, answer column) per sub-question.
    pub sub_questions: Vec<(String, String)>,
}

impl Default for ScenarioSchema {
    fn default() -> Self {
        Self {
            id_column: "scenario_id".into(),
            context_columns: vec!["scenario".into(), "domain".into(), "difficulty".into()],
            sub_questions: (1..=4)
                .map(|i| (format!("question_{i}"), format!("answer_{i}")))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularOptions {
    /// Field separator; `None` means infer from the file extension.
    pub delimiter: Option<u8>,
    pub grouping: RowGrouping,
    pub schema: ScenarioSchema,
}

impl Default for TabularOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            grouping: RowGrouping::default(),
            schema: ScenarioSchema::default(),
        }
    }
}

impl TabularOptions {
    pub fn delimiter_for(&self, path: &Path) -> u8 {
        if let Some(d) = self.delimiter {
            return d;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
            _ => b',',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyThresholds {
    /// At or below: whole file in memory.
    pub standard_max: u64,
    /// At or below (and above `standard_max`): stream without chunk files.
    pub streaming_max: u64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            standard_max: 50 * MIB,
            streaming_max: 100 * MIB,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// Resident set size of this process.
    #[default]
    Process,
    /// Bytes explicitly charged to the job's budget.
    Tracked,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub job_id: Option<String>,
    pub work_dir: PathBuf,
    pub resume: bool,
    pub memory_ceiling_bytes: u64,
    pub warning_ratio: f64,
    pub cleanup_ratio: f64,
    pub chunk_size_bytes: u64,
    /// Reject-rate above which a chunk fails the job, e.g. 0.05.
    pub error_rate_threshold: f64,
    pub family: DomainFamily,
    pub tabular: TabularOptions,
    pub strategy_thresholds: StrategyThresholds,
    pub read_buffer_bytes: usize,
    pub parallelism: usize,
    pub probe: ProbeKind,
    pub verify_source_on_resume: bool,
    pub error_log_limit: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            work_dir: PathBuf::from(".qaconv"),
            resume: false,
            memory_ceiling_bytes: 2 * GIB,
            warning_ratio: 0.80,
            cleanup_ratio: 0.90,
            chunk_size_bytes: 16 * MIB,
            error_rate_threshold: 0.05,
            family: DomainFamily::Auto,
            tabular: TabularOptions::default(),
            strategy_thresholds: StrategyThresholds::default(),
            read_buffer_bytes: 64 * 1024,
            parallelism: 1,
            probe: ProbeKind::Process,
            verify_source_on_resume: true,
            error_log_limit: 100,
        }
    }
}

impl JobOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let opts: JobOptions = serde_json::from_slice(&bytes)
            .map_err(|e| QaError::Config(format!("{}: {e}", path.display())))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.warning_ratio
            && self.warning_ratio <= self.cleanup_ratio
            && self.cleanup_ratio <= 1.0)
        {
            return Err(QaError::Config(format!(
                "thresholds must satisfy 0 < warning ({}) <= cleanup ({}) <= 1",
                self.warning_ratio, self.cleanup_ratio
            )));
        }
        if self.memory_ceiling_bytes == 0 {
            return Err(QaError::Config("memory ceiling must be > 0".into()));
        }
        if self.chunk_size_bytes == 0 {
            return Err(QaError::Config("chunk size must be > 0".into()));
        }
        if self.read_buffer_bytes == 0 {
            return Err(QaError::Config("read buffer must be > 0".into()));
        }
        if self.parallelism == 0 {
            return Err(QaError::Config("parallelism must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(QaError::Config(format!(
                "error rate threshold {} outside [0, 1]",
                self.error_rate_threshold
            )));
        }
        if self.strategy_thresholds.standard_max > self.strategy_thresholds.streaming_max {
            return Err(QaError::Config(
                "standard threshold exceeds streaming threshold".into(),
            ));
        }
        if let RowGrouping::FixedRows(0) = self.tabular.grouping {
            return Err(QaError::Config("row groups need at least one row".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let o = JobOptions::default();
        o.validate().unwrap();
        assert_eq!(o.memory_ceiling_bytes, 2 * GIB);
        assert_eq!(o.tabular.schema.sub_questions.len(), 4);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let o = JobOptions {
            warning_ratio: 0.95,
            cleanup_ratio: 0.9,
            ..Default::default()
        };
        assert!(matches!(o.validate(), Err(QaError::Config(_))));
    }

    #[test]
    fn partial_json_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("job.json");
        std::fs::write(
            &p,
            r#"{"chunk_size_bytes": 1024, "family": "graph-spatial",
                "tabular": {"grouping": {"by-column": "scenario_id"}}}"#,
        )
        .unwrap();
        let o = JobOptions::from_json_file(&p).unwrap();
        assert_eq!(o.chunk_size_bytes, 1024);
        assert_eq!(o.family, DomainFamily::GraphSpatial);
        assert_eq!(o.tabular.grouping, RowGrouping::ByColumn("scenario_id".into()));
        assert_eq!(o.error_rate_threshold, 0.05);
    }

    #[test]
    fn delimiter_follows_extension() {
        let t = TabularOptions::default();
        assert_eq!(t.delimiter_for(Path::new("a.tsv")), b'\t');
        assert_eq!(t.delimiter_for(Path::new("a.csv")), b',');
    }
}
