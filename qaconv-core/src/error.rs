use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobState;

#[derive(Error, Debug)]
pub enum QaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("structural corruption at byte {offset}: {reason}")]
    StructuralCorruption { offset: u64, reason: String },

    #[error("checksum mismatch in chunk {chunk}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        chunk: u32,
        expected: String,
        actual: String,
    },

    #[error("insufficient storage while writing {}", path.display())]
    InsufficientStorage { path: PathBuf },

    #[error("memory exhausted: {usage} bytes in use, ceiling {ceiling}")]
    MemoryExhausted { usage: u64, ceiling: u64 },

    #[error("error budget exceeded in chunk {chunk}: {errors}/{records} records rejected (threshold {threshold})")]
    ErrorBudgetExceeded {
        chunk: u32,
        errors: u64,
        records: u64,
        threshold: f64,
    },

    #[error("source changed since it was chunked: expected {expected}, found {actual}")]
    SourceChanged { expected: String, actual: String },

    #[error("resume mismatch: checkpoint says {checkpoint} entries, sink holds {sink}")]
    ResumeMismatch { checkpoint: u64, sink: u64 },

    #[error("invalid job transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("job cancelled")]
    Cancelled,
}

impl QaError {
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        QaError::StructuralCorruption {
            offset,
            reason: reason.into(),
        }
    }

    /// Terminal state a job lands in when this error escapes the pipeline.
    pub fn disposition(&self) -> JobState {
        match self {
            QaError::InsufficientStorage { .. }
            | QaError::MemoryExhausted { .. }
            | QaError::Cancelled => JobState::Paused,
            _ => JobState::Failed,
        }
    }

    /// Maps ENOSPC-style write failures onto `InsufficientStorage`.
    pub fn from_write(err: std::io::Error, path: &std::path::Path) -> Self {
        if is_storage_full(&err) {
            QaError::InsufficientStorage {
                path: path.to_path_buf(),
            }
        } else {
            QaError::Io(err)
        }
    }
}

fn is_storage_full(err: &std::io::Error) -> bool {
    const ENOSPC: i32 = 28;
    err.kind() == std::io::ErrorKind::StorageFull || err.raw_os_error() == Some(ENOSPC)
}

/// Record-level failure. Counted against the chunk error budget, never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("graph integrity: {0}")]
    GraphIntegrity(String),

    #[error("{converter} declared {expected} entries but produced {actual}")]
    ExpansionMismatch {
        converter: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("answer `{answer}` does not resolve to exactly one choice")]
    AmbiguousAnswer { answer: String },

    #[error("record has no derivable answer: {0}")]
    Unanswerable(String),

    #[error("no converter handles record {0}")]
    NotHandled(u64),
}

impl ConversionError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConversionError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, QaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_follow_taxonomy() {
        assert_eq!(QaError::corrupt(3, "x").disposition(), JobState::Failed);
        assert_eq!(
            QaError::MemoryExhausted {
                usage: 2,
                ceiling: 1
            }
            .disposition(),
            JobState::Paused
        );
        assert_eq!(
            QaError::InsufficientStorage {
                path: PathBuf::from("/tmp/x")
            }
            .disposition(),
            JobState::Paused
        );
        assert_eq!(QaError::Cancelled.disposition(), JobState::Paused);
    }

    #[test]
    fn enospc_becomes_insufficient_storage() {
        let err = std::io::Error::from_raw_os_error(28);
        let mapped = QaError::from_write(err, std::path::Path::new("chunk_000001.json"));
        assert!(matches!(mapped, QaError::InsufficientStorage { .. }));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            QaError::from_write(other, std::path::Path::new("x")),
            QaError::Io(_)
        ));
    }
}
