//! Property tests for structural chunking.
//!
//! For every kind and target size, the chunk set must hold exactly the
//! source's records in order, each chunk must parse on its own, and
//! reassembly must yield the same record stream as the source.

use std::path::{Path, PathBuf};

use proptest::prelude::*;

use qaconv_core::config::TabularOptions;
use qaconv_core::domain::{RawRecord, StructuralKind};
use qaconv_core::memory::MemoryBudget;
use qaconv_core::read::stream::RecordStream;
use qaconv_core::{StructuralChunker, reassemble, verify_reconstruction};

const WINDOW: usize = 4096;

fn target_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(1u64), Just(48), Just(200), Just(4096)]
}

fn kind_strategy() -> impl Strategy<Value = StructuralKind> {
    prop_oneof![
        Just(StructuralKind::Jsonl),
        Just(StructuralKind::JsonArray),
        Just(StructuralKind::CsvTabular),
    ]
}

fn rows_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-z ]{1,24}", -1000i64..1000), 1..40)
}

fn render(kind: StructuralKind, rows: &[(String, i64)]) -> String {
    match kind {
        StructuralKind::Jsonl => rows
            .iter()
            .map(|(q, a)| format!("{}\n", serde_json::json!({"question": q, "answer": a})))
            .collect(),
        StructuralKind::JsonArray => {
            let items: Vec<String> = rows
                .iter()
                .map(|(q, a)| serde_json::json!({"question": q, "answer": a, "tags": [q]}).to_string())
                .collect();
            format!("[\n  {}\n]\n", items.join(",\n  "))
        }
        StructuralKind::CsvTabular => {
            let mut s = String::from("question,answer\n");
            for (q, a) in rows {
                s.push_str(&format!("{q},{a}\n"));
            }
            s
        }
    }
}

fn records(path: &Path, kind: StructuralKind) -> Vec<RawRecord> {
    RecordStream::open_path(path, kind, &TabularOptions::default(), WINDOW)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn source(dir: &Path, kind: StructuralKind, body: &str) -> PathBuf {
    let p = dir.join(format!("src.{}", kind.chunk_extension()));
    std::fs::write(&p, body).unwrap();
    p
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_chunks_reassemble_to_source_records(
        kind in kind_strategy(),
        rows in rows_strategy(),
        target in target_strategy(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), kind, &render(kind, &rows));
        let chunk_dir = dir.path().join("chunks");
        let budget = MemoryBudget::new(1 << 30, 0.8, 0.9);

        let manifest = StructuralChunker::new("prop", kind, target, budget)
            .with_window(WINDOW)
            .split_file(&src, &chunk_dir, &dir.path().join("manifest.cbor"))
            .unwrap();

        prop_assert_eq!(manifest.total_records, rows.len() as u64);
        prop_assert!(manifest.validate(&chunk_dir).is_ok());
        verify_reconstruction(&manifest, &chunk_dir, WINDOW).unwrap();

        // every chunk is a self-contained document of the source's kind
        let mut ordinal = 0u64;
        for chunk in &manifest.chunks {
            let got = records(&chunk.path(&chunk_dir), kind);
            prop_assert_eq!(got.len() as u64, chunk.record_count);
            prop_assert_eq!(chunk.first_record, ordinal);
            ordinal += chunk.record_count;
        }

        let out = dir.path().join(format!("out.{}", kind.chunk_extension()));
        let mut f = std::fs::File::create(&out).unwrap();
        let n = reassemble(&manifest, &chunk_dir, &mut f, WINDOW).unwrap();
        prop_assert_eq!(n, rows.len() as u64);
        drop(f);

        let want: Vec<_> = records(&src, kind).into_iter().map(|r| r.body).collect();
        let got: Vec<_> = records(&out, kind).into_iter().map(|r| r.body).collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn prop_one_record_per_chunk_at_minimum_target(
        kind in kind_strategy(),
        rows in rows_strategy(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path(), kind, &render(kind, &rows));
        let chunk_dir = dir.path().join("chunks");
        let manifest = StructuralChunker::new("min", kind, 1, MemoryBudget::new(1 << 30, 0.8, 0.9))
            .split_file(&src, &chunk_dir, &dir.path().join("manifest.cbor"))
            .unwrap();

        prop_assert_eq!(manifest.chunks.len(), rows.len());
        prop_assert!(manifest.chunks.iter().all(|c| c.record_count == 1));
    }
}
