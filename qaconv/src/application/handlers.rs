use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use qaconv_core::container::checkpoint::CheckpointManager;
use qaconv_core::container::manifest::Manifest;
use qaconv_core::domain::{DomainFamily, StructuralKind};
use qaconv_core::error::{QaError, Result};
use qaconv_core::job::FileProcessingJob;
use qaconv_core::job::pipeline::{CHUNK_DIR, JobPaths};
use qaconv_core::{Engine, JobOptions, JsonlSink, StructuralChunker, reassemble, verify_reconstruction};
use tracing::info;

use crate::presentation::cli::JobArgs;

const READ_WINDOW: usize = 64 * 1024;

fn options_from_args(args: &JobArgs) -> Result<JobOptions> {
    let mut opts = match &args.config {
        Some(path) => JobOptions::from_json_file(path)?,
        None => JobOptions::default(),
    };
    if let Some(dir) = &args.work_dir {
        opts.work_dir = dir.clone();
    }
    if let Some(n) = args.chunk_size {
        opts.chunk_size_bytes = n;
    }
    if let Some(n) = args.memory_ceiling {
        opts.memory_ceiling_bytes = n;
    }
    if let Some(t) = args.error_threshold {
        opts.error_rate_threshold = t;
    }
    if let Some(f) = &args.family {
        opts.family = f.parse::<DomainFamily>()?;
    }
    if let Some(id) = &args.job_id {
        opts.job_id = Some(id.clone());
    }
    if let Some(k) = args.parallelism {
        opts.parallelism = k;
    }
    opts.resume |= args.resume;
    opts.validate()?;
    Ok(opts)
}

fn parse_kind(kind: Option<String>) -> Result<Option<StructuralKind>> {
    kind.map(|k| k.parse::<StructuralKind>()).transpose()
}

fn chunk_dir_for(manifest: &Path, chunks: Option<PathBuf>) -> PathBuf {
    chunks.unwrap_or_else(|| {
        manifest
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(CHUNK_DIR)
    })
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| QaError::Format(format!("json encode: {e}")))?;
    println!("{text}");
    Ok(())
}

pub fn handle_split(source: PathBuf, kind: Option<String>, args: JobArgs) -> Result<()> {
    let opts = options_from_args(&args)?;
    let job = FileProcessingJob::new(&source, parse_kind(kind)?, opts)?;
    let paths = JobPaths::new(&job.options.work_dir, &job.id);

    let manifest = StructuralChunker::new(
        job.id.clone(),
        job.kind,
        job.options.chunk_size_bytes,
        job.budget().clone(),
    )
    .with_tabular(job.options.tabular.clone())
    .with_window(job.options.read_buffer_bytes)
    .split_file(&source, &paths.chunks, &paths.manifest)?;
    manifest.validate(&paths.chunks).into_result()?;

    info!(job_id = %job.id, manifest = %paths.manifest.display(), "split finished");
    println!(
        "{} chunks, {} records -> {}",
        manifest.chunks.len(),
        manifest.total_records,
        paths.manifest.display()
    );
    Ok(())
}

pub fn handle_validate(manifest_path: PathBuf, chunks: Option<PathBuf>, deep: bool) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let chunk_dir = chunk_dir_for(&manifest_path, chunks);
    let report = manifest.validate(&chunk_dir);
    for p in &report.problems {
        eprintln!("problem: {p}");
    }
    report.into_result()?;
    if deep {
        verify_reconstruction(&manifest, &chunk_dir, READ_WINDOW)?;
    }
    eprintln!("validate: OK ({} chunks, {} records)", manifest.chunks.len(), manifest.total_records);
    Ok(())
}

pub fn handle_chunks(manifest_path: PathBuf, json: bool) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    if json {
        return print_json(&manifest.chunks);
    }
    for c in &manifest.chunks {
        let mut flags = Vec::new();
        if c.oversized {
            flags.push("oversized");
        }
        if c.header_replicated {
            flags.push("header");
        }
        println!(
            "#{:<5} {:<22} records={:<8} first={:<10} bytes={:<10} src=[{}, {}) {} {}",
            c.index,
            c.file_name,
            c.record_count,
            c.first_record,
            c.byte_len,
            c.source_start,
            c.source_end,
            &c.checksum[..c.checksum.len().min(16)],
            flags.join(",")
        );
    }
    Ok(())
}

pub fn handle_reconstruct(manifest_path: PathBuf, out: PathBuf, chunks: Option<PathBuf>) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let chunk_dir = chunk_dir_for(&manifest_path, chunks);
    manifest.validate(&chunk_dir).into_result()?;
    let file = File::create(&out).map_err(|e| QaError::from_write(e, &out))?;
    let mut writer = BufWriter::new(file);
    let n = reassemble(&manifest, &chunk_dir, &mut writer, READ_WINDOW)?;
    writer.flush()?;
    eprintln!("reconstruct: {n} records -> {}", out.display());
    Ok(())
}

pub fn handle_convert(source: PathBuf, out: PathBuf, kind: Option<String>, args: JobArgs) -> Result<()> {
    let opts = options_from_args(&args)?;
    let mut sink = JsonlSink::new(&out)?;
    let engine = Engine::new();
    match engine.run_job(&source, parse_kind(kind)?, &mut sink, opts) {
        Ok(status) => {
            print_json(&status)?;
            eprintln!("convert: entries in {}", sink.path(&status.job_id).display());
            Ok(())
        }
        Err(e) => {
            for id in engine.job_ids() {
                print_json(&engine.get_job_status(&id)?)?;
            }
            Err(e)
        }
    }
}

pub fn handle_status(args: JobArgs) -> Result<()> {
    let opts = options_from_args(&args)?;
    let id = opts
        .job_id
        .clone()
        .ok_or_else(|| QaError::Config("status needs --job-id".into()))?;
    let paths = JobPaths::new(&opts.work_dir, &id);
    if !paths.root.exists() {
        return Err(QaError::UnknownJob(id));
    }

    let checkpoint = CheckpointManager::new(&opts.work_dir).load(&id)?;
    let manifest = if paths.manifest.exists() {
        Some(Manifest::load(&paths.manifest)?)
    } else {
        None
    };
    let summary = serde_json::json!({
        "job_id": id,
        "chunks_total": manifest.as_ref().map(|m| m.chunks.len()),
        "records_total": manifest.as_ref().map(|m| m.total_records),
        "chunks_completed": checkpoint.as_ref().map_or(0, |c| c.next_chunk()),
        "records_emitted": checkpoint.as_ref().map_or(0, |c| c.entries_emitted),
        "records_rejected": checkpoint.as_ref().map_or(0, |c| c.records_rejected),
        "last_checkpoint": checkpoint.as_ref().map(|c| c.timestamp),
    });
    print_json(&summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("job.json");
        std::fs::write(&config, r#"{"chunk_size_bytes": 1024, "parallelism": 2, "family": "mathematical"}"#).unwrap();
        let args = JobArgs {
            config: Some(config),
            chunk_size: Some(4096),
            family: Some("judge".into()),
            resume: true,
            ..Default::default()
        };
        let opts = options_from_args(&args).unwrap();
        assert_eq!(opts.chunk_size_bytes, 4096);
        assert_eq!(opts.parallelism, 2);
        assert_eq!(opts.family, DomainFamily::JudgeMeta);
        assert!(opts.resume);
    }

    #[test]
    fn bad_flags_are_config_errors() {
        let args = JobArgs {
            family: Some("poetry".into()),
            ..Default::default()
        };
        assert!(matches!(options_from_args(&args), Err(QaError::Config(_))));
        let args = JobArgs {
            parallelism: Some(0),
            ..Default::default()
        };
        assert!(matches!(options_from_args(&args), Err(QaError::Config(_))));
    }

    #[test]
    fn split_then_reconstruct_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.jsonl");
        std::fs::write(&src, "{\"question\":\"a\",\"answer\":1}\n{\"question\":\"b\",\"answer\":2}\n").unwrap();
        let work = dir.path().join("work");
        let args = JobArgs {
            work_dir: Some(work.clone()),
            chunk_size: Some(1),
            job_id: Some("cli".into()),
            ..Default::default()
        };
        handle_split(src.clone(), None, args).unwrap();
        let manifest = work.join("cli").join("manifest.cbor");
        handle_validate(manifest.clone(), None, true).unwrap();

        let out = dir.path().join("out.jsonl");
        handle_reconstruct(manifest, out.clone(), None).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), std::fs::read(src).unwrap());
    }
}
