use super::{BoundaryDetector, Span};
use crate::domain::StructuralKind;
use crate::error::Result;

/// One record per non-blank line; spans exclude surrounding whitespace.
pub struct JsonlDetector {
    first: Option<u64>,
    last_end: u64,
}

impl JsonlDetector {
    pub fn new() -> Self {
        Self {
            first: None,
            last_end: 0,
        }
    }
}

impl Default for JsonlDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundaryDetector for JsonlDetector {
    fn kind(&self) -> StructuralKind {
        StructuralKind::Jsonl
    }

    fn scan(&mut self, bytes: &[u8], offset: u64, out: &mut Vec<Span>) -> Result<()> {
        for (i, &b) in bytes.iter().enumerate() {
            let pos = offset + i as u64;
            if b == b'\n' {
                if let Some(start) = self.first.take() {
                    out.push(Span::record(start, self.last_end));
                }
            } else if !b.is_ascii_whitespace() {
                if self.first.is_none() {
                    self.first = Some(pos);
                }
                self.last_end = pos + 1;
            }
        }
        Ok(())
    }

    fn finish(&mut self, _end: u64, out: &mut Vec<Span>) -> Result<()> {
        if let Some(start) = self.first.take() {
            out.push(Span::record(start, self.last_end));
        }
        Ok(())
    }

    fn retain_from(&self) -> Option<u64> {
        self.first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_blank_lines_and_missing_final_newline() {
        let input = b"{\"a\":1}\r\n\n  \n {\"b\":2} \n{\"c\":3}";
        let mut d = JsonlDetector::new();
        let mut out = Vec::new();
        d.scan(&input[..10], 0, &mut out).unwrap();
        d.scan(&input[10..], 10, &mut out).unwrap();
        d.finish(input.len() as u64, &mut out).unwrap();
        let got: Vec<&[u8]> = out
            .iter()
            .map(|s| &input[s.start as usize..s.end as usize])
            .collect();
        assert_eq!(got, vec![&b"{\"a\":1}"[..], b"{\"b\":2}", b"{\"c\":3}"]);
    }
}
