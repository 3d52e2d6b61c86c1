use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "qaconv: chunk and convert benchmark files into canonical Q&A", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Job settings shared by the commands that run or inspect a job.
#[derive(Args, Clone, Debug, Default)]
pub struct JobArgs {
    /// JSON file with job options; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root for per-job state (chunks, manifest, checkpoint)
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Target chunk size in bytes
    #[arg(long = "chunk-size")]
    pub chunk_size: Option<u64>,

    /// Memory ceiling in bytes
    #[arg(long = "memory-ceiling")]
    pub memory_ceiling: Option<u64>,

    /// Reject rate per chunk above which the job fails (0.0 - 1.0)
    #[arg(long = "error-threshold")]
    pub error_threshold: Option<f64>,

    /// auto | graph | tabular | math | judge | planning
    #[arg(long)]
    pub family: Option<String>,

    #[arg(long = "job-id")]
    pub job_id: Option<String>,

    /// Continue from the last checkpoint of `--job-id`
    #[arg(long)]
    pub resume: bool,

    /// Chunks converted concurrently
    #[arg(long)]
    pub parallelism: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Split a source into self-contained chunk files plus a manifest
    Split {
        source: PathBuf,

        /// json-array | jsonl | csv (detected when omitted)
        #[arg(long)]
        kind: Option<String>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Re-derive chunk checksums and record counts against a manifest
    Validate {
        manifest: PathBuf,

        /// Chunk directory (defaults to `chunks/` beside the manifest)
        #[arg(long)]
        chunks: Option<PathBuf>,

        /// Also stream every record and check the record digest
        #[arg(long)]
        deep: bool,
    },

    /// Print the chunk table of a manifest
    Chunks {
        manifest: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Reassemble the chunk set into one document
    Reconstruct {
        manifest: PathBuf,
        out: PathBuf,

        #[arg(long)]
        chunks: Option<PathBuf>,
    },

    /// Convert a source into canonical Q&A entries (JSONL, one file per job)
    Convert {
        source: PathBuf,

        /// Output directory; entries go to `<out>/<job_id>.jsonl`
        #[arg(long, default_value = "qaconv-out")]
        out: PathBuf,

        #[arg(long)]
        kind: Option<String>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Show progress of an unfinished job from its checkpoint and manifest
    Status {
        #[command(flatten)]
        job: JobArgs,
    },
}
