pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use qaconv_core::error::Result;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Split { source, kind, job } => handlers::handle_split(source, kind, job),
        Commands::Validate {
            manifest,
            chunks,
            deep,
        } => handlers::handle_validate(manifest, chunks, deep),
        Commands::Chunks { manifest, json } => handlers::handle_chunks(manifest, json),
        Commands::Reconstruct {
            manifest,
            out,
            chunks,
        } => handlers::handle_reconstruct(manifest, out, chunks),
        Commands::Convert {
            source,
            out,
            kind,
            job,
        } => handlers::handle_convert(source, out, kind, job),
        Commands::Status { job } => handlers::handle_status(job),
    }
}
