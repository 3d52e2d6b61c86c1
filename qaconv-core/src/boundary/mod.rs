//! Record boundary detection.
//!
//! A [`BoundaryDetector`] is an incremental byte state machine for one
//! structural kind. It never looks at a byte twice and never needs the whole
//! input: it is fed successive slices with their absolute offsets and reports
//! a [`Span`] for every record it has seen end. [`RecordScanner`] drives a
//! detector over any `Read` through a fixed-size window, keeping only the
//! bytes of records not yet handed out.

pub mod csv;
pub mod json_array;
pub mod jsonl;

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};

use crate::config::TabularOptions;
use crate::domain::StructuralKind;
use crate::error::Result;
use crate::memory::{Lease, MemoryBudget};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// CSV header row; replicated into every chunk.
    Header,
    Record { rows: u32 },
}

/// Absolute byte range `[start, end)` of one record (or header) in the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub end: u64,
    pub kind: SpanKind,
}

impl Span {
    pub fn record(start: u64, end: u64) -> Self {
        Span {
            start,
            end,
            kind: SpanKind::Record { rows: 1 },
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_header(&self) -> bool {
        self.kind == SpanKind::Header
    }
}

pub trait BoundaryDetector: Send {
    fn kind(&self) -> StructuralKind;

    /// Feeds `bytes`, which start at absolute offset `offset` and directly
    /// follow everything fed before.
    fn scan(&mut self, bytes: &[u8], offset: u64, out: &mut Vec<Span>) -> Result<()>;

    /// Signals end of input at absolute offset `end`.
    fn finish(&mut self, end: u64, out: &mut Vec<Span>) -> Result<()>;

    /// Start of the earliest record still open, if any.
    fn retain_from(&self) -> Option<u64>;
}

pub fn detector_for(
    kind: StructuralKind,
    tabular: &TabularOptions,
    delimiter: u8,
) -> Box<dyn BoundaryDetector> {
    match kind {
        StructuralKind::JsonArray => Box::new(json_array::JsonArrayDetector::new()),
        StructuralKind::Jsonl => Box::new(jsonl::JsonlDetector::new()),
        StructuralKind::CsvTabular => Box::new(csv::CsvDetector::new(
            delimiter,
            tabular.grouping.clone(),
        )),
    }
}

/// Drives a detector over a reader with a bounded window.
pub struct RecordScanner<R: Read> {
    src: R,
    detector: Box<dyn BoundaryDetector>,
    buf: Vec<u8>,
    /// Absolute offset of `buf[0]`.
    buf_base: u64,
    /// Absolute offset of the next byte to read.
    read_pos: u64,
    spans: VecDeque<Span>,
    scratch: Vec<Span>,
    window: usize,
    eof: bool,
    hasher: Option<blake3::Hasher>,
    lease: Option<Lease>,
}

impl<R: Read> RecordScanner<R> {
    pub fn new(src: R, detector: Box<dyn BoundaryDetector>, window: usize) -> Self {
        Self {
            src,
            detector,
            buf: Vec::with_capacity(window),
            buf_base: 0,
            read_pos: 0,
            spans: VecDeque::new(),
            scratch: Vec::new(),
            window: window.max(1),
            eof: false,
            hasher: None,
            lease: None,
        }
    }

    /// Hash every byte pulled from the source.
    pub fn with_hasher(mut self) -> Self {
        self.hasher = Some(blake3::Hasher::new());
        self
    }

    /// Charge the scan buffer to `budget`.
    pub fn with_budget(mut self, budget: &MemoryBudget) -> Self {
        self.lease = Some(budget.lease(self.buf.capacity() as u64));
        self
    }

    pub fn kind(&self) -> StructuralKind {
        self.detector.kind()
    }

    pub fn bytes_read(&self) -> u64 {
        self.read_pos
    }

    /// Digest of everything read so far; complete once `next_span` returned `None`.
    pub fn source_digest(&self) -> Option<[u8; 32]> {
        self.hasher.as_ref().map(|h| *h.finalize().as_bytes())
    }

    pub fn next_span(&mut self) -> Result<Option<Span>> {
        loop {
            if let Some(s) = self.spans.pop_front() {
                return Ok(Some(s));
            }
            if self.eof {
                return Ok(None);
            }
            self.compact();
            self.fill()?;
        }
    }

    /// Bytes of the span most recently returned by `next_span`.
    pub fn bytes(&self, span: &Span) -> &[u8] {
        let start = (span.start - self.buf_base) as usize;
        let end = (span.end - self.buf_base) as usize;
        &self.buf[start..end]
    }

    /// Releases spare capacity above one window; returns the bytes freed.
    pub fn shrink(&mut self) -> u64 {
        let before = self.buf.capacity();
        self.buf.shrink_to(self.buf.len().max(self.window));
        self.update_lease();
        before.saturating_sub(self.buf.capacity()) as u64
    }

    fn compact(&mut self) {
        let keep = self
            .spans
            .front()
            .map(|s| s.start)
            .into_iter()
            .chain(self.detector.retain_from())
            .min()
            .unwrap_or(self.read_pos);
        let drop = (keep - self.buf_base) as usize;
        if drop > 0 {
            self.buf.drain(..drop);
            self.buf_base = keep;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let old_len = self.buf.len();
        self.buf.resize(old_len + self.window, 0);
        let n = loop {
            match self.src.read(&mut self.buf[old_len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e.into());
                }
            }
        };
        self.buf.truncate(old_len + n);

        if n == 0 {
            self.eof = true;
            self.detector.finish(self.read_pos, &mut self.scratch)?;
        } else {
            if let Some(h) = self.hasher.as_mut() {
                h.update(&self.buf[old_len..]);
            }
            self.detector
                .scan(&self.buf[old_len..], self.read_pos, &mut self.scratch)?;
            self.read_pos += n as u64;
        }
        self.spans.extend(self.scratch.drain(..));
        self.update_lease();
        Ok(())
    }

    fn update_lease(&mut self) {
        let cap = self.buf.capacity() as u64;
        if let Some(lease) = self.lease.as_mut() {
            lease.resize(cap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RowGrouping;

    fn collect(kind: StructuralKind, input: &[u8], window: usize) -> Vec<Vec<u8>> {
        let tab = TabularOptions {
            grouping: RowGrouping::FixedRows(1),
            ..Default::default()
        };
        let mut sc = RecordScanner::new(input, detector_for(kind, &tab, b','), window);
        let mut out = Vec::new();
        while let Some(span) = sc.next_span().unwrap() {
            out.push(sc.bytes(&span).to_vec());
        }
        out
    }

    #[test]
    fn spans_independent_of_window_size() {
        let input = br#"[ {"id": 1, "s": "a,]b"}, [1, [2]], "x\"y" , 42 ]"#;
        let want = collect(StructuralKind::JsonArray, input, 4096);
        assert_eq!(want.len(), 4);
        assert_eq!(want[0], br#"{"id": 1, "s": "a,]b"}"#.to_vec());
        assert_eq!(want[2], br#""x\"y""#.to_vec());
        for w in [1, 2, 3, 7, 16] {
            assert_eq!(collect(StructuralKind::JsonArray, input, w), want, "window {w}");
        }
    }

    #[test]
    fn scanner_hashes_whole_input() {
        let input = b"{\"a\":1}\n{\"a\":2}\n";
        let tab = TabularOptions::default();
        let mut sc = RecordScanner::new(
            &input[..],
            detector_for(StructuralKind::Jsonl, &tab, b','),
            3,
        )
        .with_hasher();
        while sc.next_span().unwrap().is_some() {}
        assert_eq!(sc.source_digest().unwrap(), *blake3::hash(input).as_bytes());
        assert_eq!(sc.bytes_read(), input.len() as u64);
    }

    #[test]
    fn scanner_buffer_stays_near_window() {
        let mut input = b"[".to_vec();
        for i in 0..2000 {
            if i > 0 {
                input.push(b',');
            }
            input.extend_from_slice(format!("{{\"n\":{i}}}").as_bytes());
        }
        input.push(b']');
        let budget = MemoryBudget::new(1 << 20, 0.8, 0.9);
        let tab = TabularOptions::default();
        let mut sc = RecordScanner::new(
            &input[..],
            detector_for(StructuralKind::JsonArray, &tab, b','),
            256,
        )
        .with_budget(&budget);
        let mut n = 0;
        while sc.next_span().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 2000);
        assert!(budget.peak() < 4096, "peak {}", budget.peak());
    }

    #[test]
    fn shrink_returns_capacity_left_by_a_large_record() {
        let mut input = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(10_000)).into_bytes();
        for i in 0..20 {
            input.extend_from_slice(format!("{{\"n\":{i}}}\n").as_bytes());
        }
        let budget = MemoryBudget::new(1 << 20, 0.8, 0.9);
        let tab = TabularOptions::default();
        let mut sc = RecordScanner::new(&input[..], detector_for(StructuralKind::Jsonl, &tab, b','), 64)
            .with_budget(&budget);
        while sc.next_span().unwrap().is_some() {}
        assert!(budget.in_use() >= 10_000);

        let freed = sc.shrink();
        assert!(freed >= 9_000, "freed {freed}");
        assert!(budget.in_use() < 1024, "in use {}", budget.in_use());
    }
}
