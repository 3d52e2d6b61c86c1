use super::{BoundaryDetector, Span, SpanKind};
use crate::config::RowGrouping;
use crate::domain::StructuralKind;
use crate::error::{QaError, Result};

/// Quote-aware row scanner for CSV/TSV. The first row is the header; every
/// later row must have the same number of fields. Rows are grouped into
/// records per [`RowGrouping`]; only the header and the grouping key column
/// are ever buffered.
pub struct CsvDetector {
    delimiter: u8,
    grouping: RowGrouping,

    in_quotes: bool,
    after_quote: bool,
    prev_cr: bool,
    field_started: bool,
    field_idx: usize,
    field: Vec<u8>,

    row_start: Option<u64>,
    header: Option<Vec<String>>,
    header_fields: Vec<String>,
    key_col: Option<usize>,
    key: Option<Vec<u8>>,

    group_start: Option<u64>,
    group_end: u64,
    group_rows: u32,
    group_key: Option<Vec<u8>>,
}

impl CsvDetector {
    pub fn new(delimiter: u8, grouping: RowGrouping) -> Self {
        Self {
            delimiter,
            grouping,
            in_quotes: false,
            after_quote: false,
            prev_cr: false,
            field_started: false,
            field_idx: 0,
            field: Vec::new(),
            row_start: None,
            header: None,
            header_fields: Vec::new(),
            key_col: None,
            key: None,
            group_start: None,
            group_end: 0,
            group_rows: 0,
            group_key: None,
        }
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    fn capturing(&self) -> bool {
        self.header.is_none() || Some(self.field_idx) == self.key_col
    }

    fn capture(&mut self, b: u8) {
        self.field_started = true;
        if self.capturing() {
            self.field.push(b);
        }
    }

    fn end_field(&mut self, pos: u64) -> Result<()> {
        if self.header.is_none() {
            let name = String::from_utf8(std::mem::take(&mut self.field))
                .map_err(|_| QaError::corrupt(pos, "header is not valid UTF-8"))?;
            self.header_fields.push(name.trim().to_string());
        } else if Some(self.field_idx) == self.key_col {
            self.key = Some(std::mem::take(&mut self.field));
        }
        self.field.clear();
        self.field_idx += 1;
        self.field_started = false;
        Ok(())
    }

    fn end_row(&mut self, end: u64, out: &mut Vec<Span>) -> Result<()> {
        let Some(start) = self.row_start.take() else {
            return Ok(());
        };
        let fields = self.field_idx;
        self.field_idx = 0;

        if self.header.is_none() {
            let header = std::mem::take(&mut self.header_fields);
            if let RowGrouping::ByColumn(name) = &self.grouping {
                let idx = header.iter().position(|h| h == name).ok_or_else(|| {
                    QaError::corrupt(start, format!("grouping column `{name}` not in header"))
                })?;
                self.key_col = Some(idx);
            }
            self.header = Some(header);
            out.push(Span {
                start,
                end,
                kind: SpanKind::Header,
            });
            return Ok(());
        }

        let expected = self.header.as_ref().map_or(0, Vec::len);
        if fields != expected {
            return Err(QaError::corrupt(
                start,
                format!("row has {fields} fields, header declares {expected}"),
            ));
        }

        match self.grouping {
            RowGrouping::FixedRows(n) => {
                self.group_start.get_or_insert(start);
                self.group_rows += 1;
                self.group_end = end;
                if self.group_rows as usize >= n {
                    self.flush_group(out);
                }
            }
            RowGrouping::ByColumn(_) => {
                let key = self.key.take().unwrap_or_default();
                if self.group_key.as_ref().is_some_and(|k| *k != key) {
                    self.flush_group(out);
                }
                if self.group_start.is_none() {
                    self.group_start = Some(start);
                    self.group_key = Some(key);
                }
                self.group_rows += 1;
                self.group_end = end;
            }
        }
        Ok(())
    }

    fn flush_group(&mut self, out: &mut Vec<Span>) {
        if let Some(start) = self.group_start.take() {
            out.push(Span {
                start,
                end: self.group_end,
                kind: SpanKind::Record {
                    rows: self.group_rows,
                },
            });
        }
        self.group_rows = 0;
        self.group_key = None;
    }
}

impl BoundaryDetector for CsvDetector {
    fn kind(&self) -> StructuralKind {
        StructuralKind::CsvTabular
    }

    fn scan(&mut self, bytes: &[u8], offset: u64, out: &mut Vec<Span>) -> Result<()> {
        for (i, &b) in bytes.iter().enumerate() {
            let pos = offset + i as u64;

            if self.row_start.is_none() {
                // blank lines between rows
                if b == b'\n' || b == b'\r' {
                    continue;
                }
                self.row_start = Some(pos);
            }

            if self.in_quotes {
                if b == b'"' {
                    self.in_quotes = false;
                    self.after_quote = true;
                } else {
                    self.capture(b);
                }
                self.prev_cr = false;
                continue;
            }
            if self.after_quote {
                self.after_quote = false;
                if b == b'"' {
                    self.in_quotes = true;
                    self.capture(b'"');
                    continue;
                }
            }

            match b {
                b'"' if !self.field_started => {
                    self.in_quotes = true;
                    self.field_started = true;
                }
                b'\n' => {
                    let end = if self.prev_cr { pos - 1 } else { pos };
                    self.end_field(pos)?;
                    self.end_row(end, out)?;
                }
                b'\r' => {}
                d if d == self.delimiter => self.end_field(pos)?,
                _ => self.capture(b),
            }
            self.prev_cr = b == b'\r';
        }
        Ok(())
    }

    fn finish(&mut self, end: u64, out: &mut Vec<Span>) -> Result<()> {
        if self.in_quotes {
            return Err(QaError::corrupt(end, "unterminated quoted field"));
        }
        if self.row_start.is_some() {
            let row_end = if self.prev_cr { end - 1 } else { end };
            self.end_field(end)?;
            self.end_row(row_end, out)?;
        }
        if self.header.is_none() {
            return Err(QaError::corrupt(end, "missing header row"));
        }
        self.flush_group(out);
        Ok(())
    }

    fn retain_from(&self) -> Option<u64> {
        self.group_start.into_iter().chain(self.row_start).min()
    }
}

/// Parses CSV text into rows of fields. `base` is the absolute offset of
/// `bytes[0]`, used for error reporting.
pub fn parse_rows(bytes: &[u8], delimiter: u8, base: u64) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field: Vec<u8> = Vec::new();
    let mut in_row = false;
    let mut in_quotes = false;
    let mut after_quote = false;
    let mut field_started = false;

    let finish_field = |field: &mut Vec<u8>, row: &mut Vec<String>, pos: usize| -> Result<()> {
        let s = String::from_utf8(std::mem::take(field))
            .map_err(|_| QaError::corrupt(base + pos as u64, "field is not valid UTF-8"))?;
        row.push(s);
        Ok(())
    };

    for (pos, &b) in bytes.iter().enumerate() {
        if !in_row {
            if b == b'\n' || b == b'\r' {
                continue;
            }
            in_row = true;
        }
        if in_quotes {
            if b == b'"' {
                in_quotes = false;
                after_quote = true;
            } else {
                field.push(b);
            }
            continue;
        }
        if after_quote {
            after_quote = false;
            if b == b'"' {
                in_quotes = true;
                field.push(b'"');
                continue;
            }
        }
        match b {
            b'"' if !field_started => {
                in_quotes = true;
                field_started = true;
            }
            b'\n' => {
                finish_field(&mut field, &mut row, pos)?;
                rows.push(std::mem::take(&mut row));
                in_row = false;
                field_started = false;
            }
            b'\r' => {}
            d if d == delimiter => {
                finish_field(&mut field, &mut row, pos)?;
                field_started = false;
            }
            _ => {
                field.push(b);
                field_started = true;
            }
        }
    }
    if in_quotes {
        return Err(QaError::corrupt(
            base + bytes.len() as u64,
            "unterminated quoted field",
        ));
    }
    if in_row {
        finish_field(&mut field, &mut row, bytes.len())?;
        rows.push(row);
    }
    Ok(rows)
}

/// Renders one row back to CSV, quoting where needed.
pub fn render_row(fields: &[String], delimiter: u8) -> String {
    let d = delimiter as char;
    fields
        .iter()
        .map(|f| {
            if f.contains(d) || f.contains('"') || f.contains('\n') || f.contains('\r') {
                format!("\"{}\"", f.replace('"', "\"\""))
            } else {
                f.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(&d.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(input: &[u8], grouping: RowGrouping) -> Result<Vec<(SpanKind, String)>> {
        let mut d = CsvDetector::new(b',', grouping);
        let mut out = Vec::new();
        for (i, piece) in input.chunks(5).enumerate() {
            d.scan(piece, (i * 5) as u64, &mut out)?;
        }
        d.finish(input.len() as u64, &mut out)?;
        Ok(out
            .iter()
            .map(|s| {
                (
                    s.kind,
                    String::from_utf8_lossy(&input[s.start as usize..s.end as usize]).into_owned(),
                )
            })
            .collect())
    }

    #[test]
    fn quoted_newlines_and_delimiters_stay_in_row() {
        let input = b"id,text\r\n1,\"a,b\nc\"\r\n\n2,\"say \"\"hi\"\"\"\n";
        let got = spans(input, RowGrouping::FixedRows(1)).unwrap();
        assert_eq!(got[0], (SpanKind::Header, "id,text".into()));
        assert_eq!(got[1], (SpanKind::Record { rows: 1 }, "1,\"a,b\nc\"".into()));
        assert_eq!(got[2], (SpanKind::Record { rows: 1 }, "2,\"say \"\"hi\"\"\"".into()));
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn groups_by_column_runs() {
        let input = b"sid,v\na,1\na,2\nb,3\na,4";
        let got = spans(input, RowGrouping::ByColumn("sid".into())).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[1], (SpanKind::Record { rows: 2 }, "a,1\na,2".into()));
        assert_eq!(got[2], (SpanKind::Record { rows: 1 }, "b,3".into()));
        assert_eq!(got[3], (SpanKind::Record { rows: 1 }, "a,4".into()));
    }

    #[test]
    fn fixed_row_groups_keep_short_tail() {
        let input = b"x\n1\n2\n3\n";
        let got = spans(input, RowGrouping::FixedRows(2)).unwrap();
        assert_eq!(got[1], (SpanKind::Record { rows: 2 }, "1\n2".into()));
        assert_eq!(got[2], (SpanKind::Record { rows: 1 }, "3".into()));
    }

    #[test]
    fn field_count_mismatch_is_corruption() {
        let err = spans(b"a,b\n1,2\n3\n", RowGrouping::FixedRows(1)).unwrap_err();
        assert!(matches!(err, QaError::StructuralCorruption { offset: 8, .. }));
        assert!(spans(b"a\n\"open\n", RowGrouping::FixedRows(1)).is_err());
        assert!(spans(b"", RowGrouping::FixedRows(1)).is_err());
        assert!(spans(b"a,b\n1,2\n", RowGrouping::ByColumn("zz".into())).is_err());
    }

    #[test]
    fn parse_rows_matches_render() {
        let rows = parse_rows(b"1,\"a,b\nc\"\r\n2,\"say \"\"hi\"\"\"", b',', 0).unwrap();
        assert_eq!(rows, vec![
            vec!["1".to_string(), "a,b\nc".to_string()],
            vec!["2".to_string(), "say \"hi\"".to_string()],
        ]);
        assert_eq!(render_row(&rows[1], b','), "2,\"say \"\"hi\"\"\"");
        let tsv = parse_rows(b"a\tb c\n", b'\t', 0).unwrap();
        assert_eq!(tsv, vec![vec!["a".to_string(), "b c".to_string()]]);
    }
}
