#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod error;

pub mod util {
    pub mod digest;
    pub mod fsio;
    pub mod hash_forward;
}

pub mod memory;

pub mod boundary;

pub mod container {
    pub mod checkpoint;
    pub mod chunk;
    pub mod manifest;
}

pub mod split {
    pub mod writer;
}

pub mod read {
    pub mod reconstruct;
    pub mod stream;
}

pub mod convert;
pub mod job;
pub mod sink;

// Re-exports: stable API surface
pub use config::{JobOptions, ScenarioSchema, StrategyThresholds, TabularOptions};
pub use container::manifest::Manifest;
pub use convert::{ConverterRegistry, DomainConverter};
pub use domain::{AnswerValue, CanonicalQaEntry, DomainFamily, StructuralKind};
pub use error::{ConversionError, QaError, Result};
pub use job::engine::Engine;
pub use job::strategy::Strategy;
pub use job::{JobState, JobStatus};
pub use read::reconstruct::{reassemble, verify_reconstruction};
pub use sink::{JsonlSink, MemorySink, OutputSink};
pub use split::writer::StructuralChunker;
