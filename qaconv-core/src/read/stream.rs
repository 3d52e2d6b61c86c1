use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::boundary::csv::parse_rows;
use crate::boundary::{RecordScanner, Span, detector_for};
use crate::config::TabularOptions;
use crate::container::chunk::ChunkInfo;
use crate::container::manifest::Manifest;
use crate::domain::{RawRecord, RecordBody, StructuralKind};
use crate::error::{QaError, Result};
use crate::memory::MemoryBudget;

/// Lazy, single-pass sequence of records from one chunk or one whole file.
/// Holds at most one read window plus the record being assembled.
pub struct RecordStream<R: Read> {
    scanner: RecordScanner<R>,
    delimiter: u8,
    headers: Option<Arc<Vec<String>>>,
    next_ordinal: u64,
    done: bool,
}

impl RecordStream<File> {
    pub fn open_path(
        path: &Path,
        kind: StructuralKind,
        tabular: &TabularOptions,
        window: usize,
    ) -> Result<Self> {
        let f = File::open(path)?;
        Ok(Self::new(f, kind, tabular, tabular.delimiter_for(path), window))
    }

    /// Opens a chunk listed in `manifest`; ordinals continue from the chunk's
    /// first record.
    pub fn open_chunk(
        manifest: &Manifest,
        chunk_dir: &Path,
        chunk: &ChunkInfo,
        window: usize,
    ) -> Result<Self> {
        let f = File::open(chunk.path(chunk_dir))?;
        let (tabular, delimiter) = match &manifest.csv {
            Some(layout) => (
                TabularOptions {
                    delimiter: Some(layout.delimiter),
                    grouping: layout.grouping.clone(),
                    ..Default::default()
                },
                layout.delimiter,
            ),
            None => (TabularOptions::default(), b','),
        };
        Ok(Self::new(f, manifest.kind, &tabular, delimiter, window).starting_at(chunk.first_record))
    }
}

impl<'a> RecordStream<&'a [u8]> {
    /// Whole input already resident; the window covers all of it.
    pub fn from_bytes(
        bytes: &'a [u8],
        kind: StructuralKind,
        tabular: &TabularOptions,
        delimiter: u8,
    ) -> Self {
        Self::new(bytes, kind, tabular, delimiter, bytes.len().max(1))
    }
}

impl<R: Read> RecordStream<R> {
    pub fn new(
        src: R,
        kind: StructuralKind,
        tabular: &TabularOptions,
        delimiter: u8,
        window: usize,
    ) -> Self {
        Self {
            scanner: RecordScanner::new(src, detector_for(kind, tabular, delimiter), window),
            delimiter,
            headers: None,
            next_ordinal: 0,
            done: false,
        }
    }

    pub fn starting_at(mut self, ordinal: u64) -> Self {
        self.next_ordinal = ordinal;
        self
    }

    pub fn with_budget(mut self, budget: &MemoryBudget) -> Self {
        self.scanner = self.scanner.with_budget(budget);
        self
    }

    pub fn kind(&self) -> StructuralKind {
        self.scanner.kind()
    }

    pub fn headers(&self) -> Option<&Arc<Vec<String>>> {
        self.headers.as_ref()
    }

    /// Drops read-buffer capacity a large record left behind.
    pub fn shrink(&mut self) -> u64 {
        self.scanner.shrink()
    }

    /// Next record's ordinal and raw bytes, without parsing.
    pub fn next_raw(&mut self) -> Result<Option<(u64, &[u8])>> {
        match self.next_record_span()? {
            Some((ordinal, span)) => Ok(Some((ordinal, self.scanner.bytes(&span)))),
            None => Ok(None),
        }
    }

    fn next_record_span(&mut self) -> Result<Option<(u64, Span)>> {
        while let Some(span) = self.scanner.next_span()? {
            if span.is_header() {
                let rows = parse_rows(self.scanner.bytes(&span), self.delimiter, span.start)?;
                let header = rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| QaError::corrupt(span.start, "empty header row"))?;
                self.headers = Some(Arc::new(header.into_iter().map(|h| h.trim().to_string()).collect()));
                continue;
            }
            let ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            return Ok(Some((ordinal, span)));
        }
        Ok(None)
    }

    fn read_record(&mut self) -> Result<Option<RawRecord>> {
        let Some((ordinal, span)) = self.next_record_span()? else {
            return Ok(None);
        };
        let bytes = self.scanner.bytes(&span);
        let body = match self.scanner.kind() {
            StructuralKind::JsonArray | StructuralKind::Jsonl => {
                let v: Value = serde_json::from_slice(bytes).map_err(|e| {
                    QaError::corrupt(span.start, format!("record {ordinal} is not valid JSON: {e}"))
                })?;
                RecordBody::Json(v)
            }
            StructuralKind::CsvTabular => {
                let headers = self
                    .headers
                    .clone()
                    .ok_or_else(|| QaError::corrupt(span.start, "rows before header"))?;
                RecordBody::Tabular {
                    headers,
                    rows: parse_rows(bytes, self.delimiter, span.start)?,
                }
            }
        };
        Ok(Some(RawRecord { ordinal, body }))
    }
}

impl<R: Read> Iterator for RecordStream<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(r)) => Some(Ok(r)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
