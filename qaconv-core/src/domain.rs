// qaconv_core/src/domain.rs
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConversionError, QaError, Result};

/// Syntactic family of a source file; decides where chunk boundaries may fall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructuralKind {
    JsonArray,
    Jsonl,
    CsvTabular,
}

impl StructuralKind {
    /// Extension first, then the first non-whitespace byte.
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => return Ok(StructuralKind::JsonArray),
            Some("jsonl") | Some("ndjson") => return Ok(StructuralKind::Jsonl),
            Some("csv") | Some("tsv") => return Ok(StructuralKind::CsvTabular),
            _ => {}
        }

        let mut f = std::fs::File::open(path)?;
        let mut buf = [0u8; 4096];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if let Some(b) = buf[..n].iter().find(|b| !b.is_ascii_whitespace()) {
                return match b {
                    b'[' => Ok(StructuralKind::JsonArray),
                    b'{' => Ok(StructuralKind::Jsonl),
                    _ => Ok(StructuralKind::CsvTabular),
                };
            }
        }
        Err(QaError::corrupt(0, "cannot detect structural kind of empty file"))
    }

    pub fn chunk_extension(&self) -> &'static str {
        match self {
            StructuralKind::JsonArray => "json",
            StructuralKind::Jsonl => "jsonl",
            StructuralKind::CsvTabular => "csv",
        }
    }
}

impl fmt::Display for StructuralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StructuralKind::JsonArray => "json-array",
            StructuralKind::Jsonl => "jsonl",
            StructuralKind::CsvTabular => "csv-tabular",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for StructuralKind {
    type Err = QaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json-array" | "json" => Ok(StructuralKind::JsonArray),
            "jsonl" | "ndjson" => Ok(StructuralKind::Jsonl),
            "csv-tabular" | "csv" | "tsv" => Ok(StructuralKind::CsvTabular),
            other => Err(QaError::Config(format!("unknown structural kind: {other}"))),
        }
    }
}

/// Benchmark family a converter targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainFamily {
    #[default]
    Auto,
    GraphSpatial,
    TabularScenario,
    Mathematical,
    JudgeMeta,
    GenericPlanning,
}

impl std::str::FromStr for DomainFamily {
    type Err = QaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DomainFamily::Auto),
            "graph" | "graph-spatial" => Ok(DomainFamily::GraphSpatial),
            "tabular" | "tabular-scenario" => Ok(DomainFamily::TabularScenario),
            "math" | "mathematical" => Ok(DomainFamily::Mathematical),
            "judge" | "judge-meta" => Ok(DomainFamily::JudgeMeta),
            "planning" | "generic-planning" => Ok(DomainFamily::GenericPlanning),
            other => Err(QaError::Config(format!("unknown domain family: {other}"))),
        }
    }
}

/// One logical unit pulled out of a source or chunk. Transient.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    /// Position in the original source, 0-based.
    pub ordinal: u64,
    pub body: RecordBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordBody {
    Json(Value),
    Tabular {
        headers: Arc<Vec<String>>,
        rows: Vec<Vec<String>>,
    },
}

impl RawRecord {
    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        match &self.body {
            RecordBody::Json(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Rows of a tabular record as column-name → cell maps.
    pub fn tabular_rows(&self) -> Option<Vec<BTreeMap<&str, &str>>> {
        match &self.body {
            RecordBody::Tabular { headers, rows } => Some(
                rows.iter()
                    .map(|row| {
                        headers
                            .iter()
                            .zip(row.iter())
                            .map(|(h, v)| (h.as_str(), v.as_str()))
                            .collect()
                    })
                    .collect(),
            ),
            RecordBody::Json(_) => None,
        }
    }

    pub fn row_count(&self) -> usize {
        match &self.body {
            RecordBody::Tabular { rows, .. } => rows.len(),
            RecordBody::Json(_) => 1,
        }
    }
}

/// Typed expected answer; exactly one variant, never ambiguous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::Boolean(b) => write!(f, "{b}"),
            AnswerValue::Integer(i) => write!(f, "{i}"),
            AnswerValue::Float(x) => write!(f, "{x}"),
            AnswerValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}
impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}
impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}
impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}
impl From<u64> for MetaValue {
    fn from(i: u64) -> Self {
        MetaValue::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}
impl From<usize> for MetaValue {
    fn from(i: usize) -> Self {
        MetaValue::from(i as u64)
    }
}
impl From<f64> for MetaValue {
    fn from(x: f64) -> Self {
        MetaValue::Float(x)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// Uniform output unit every converter produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalQaEntry {
    pub question: String,
    pub answer: AnswerValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CanonicalQaEntry {
    /// Builds an entry, rejecting answers that do not resolve to one choice.
    pub fn new(
        question: impl Into<String>,
        answer: AnswerValue,
        choices: Option<Vec<String>>,
        metadata: Metadata,
    ) -> std::result::Result<Self, ConversionError> {
        let question = question.into();
        if question.trim().is_empty() {
            return Err(ConversionError::invalid("question", "empty"));
        }
        if let AnswerValue::Float(x) = answer {
            if !x.is_finite() {
                return Err(ConversionError::invalid("answer", "non-finite number"));
            }
        }
        let entry = Self {
            question,
            answer,
            choices,
            metadata,
        };
        if let Some(choices) = &entry.choices {
            if choices.is_empty() {
                return Err(ConversionError::invalid("choices", "empty choice list"));
            }
            if entry.answer_choice_index().is_none() {
                return Err(ConversionError::AmbiguousAnswer {
                    answer: entry.answer.to_string(),
                });
            }
        }
        Ok(entry)
    }

    /// Index of the choice the answer resolves to, if exactly one matches.
    pub fn answer_choice_index(&self) -> Option<usize> {
        let choices = self.choices.as_ref()?;
        resolve_choice(&self.answer, choices)
    }

    /// Adds provenance keys on the way to the sink.
    pub fn stamped(mut self, record_index: u64, chunk_index: u32) -> Self {
        self.metadata
            .insert("record_index".into(), MetaValue::from(record_index));
        self.metadata
            .insert("chunk_index".into(), MetaValue::Int(chunk_index as i64));
        self
    }

    pub fn meta_text(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(MetaValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

fn resolve_choice(answer: &AnswerValue, choices: &[String]) -> Option<usize> {
    let text = answer.to_string();
    let unique = |hits: Vec<usize>| if hits.len() == 1 { Some(hits[0]) } else { None };

    let exact: Vec<usize> = positions(choices, |c| c == &text);
    if !exact.is_empty() {
        return unique(exact);
    }
    let folded: Vec<usize> = positions(choices, |c| c.trim().eq_ignore_ascii_case(text.trim()));
    if !folded.is_empty() {
        return unique(folded);
    }
    match answer {
        AnswerValue::Integer(i) if *i >= 0 && (*i as usize) < choices.len() => Some(*i as usize),
        AnswerValue::Text(s) => {
            // single letter label: "B" -> 1
            let s = s.trim();
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => {
                    let idx = (c.to_ascii_uppercase() as u8 - b'A') as usize;
                    (idx < choices.len()).then_some(idx)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn positions(choices: &[String], pred: impl Fn(&String) -> bool) -> Vec<usize> {
    choices
        .iter()
        .enumerate()
        .filter(|(_, c)| pred(c))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices(v: &[&str]) -> Option<Vec<String>> {
        Some(v.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn answer_must_resolve_to_one_choice() {
        let ok = CanonicalQaEntry::new(
            "Which?",
            AnswerValue::Text("beta".into()),
            choices(&["alpha", "Beta", "gamma"]),
            Metadata::new(),
        )
        .unwrap();
        assert_eq!(ok.answer_choice_index(), Some(1));

        let dup = CanonicalQaEntry::new(
            "Which?",
            AnswerValue::Text("x".into()),
            choices(&["x", "x"]),
            Metadata::new(),
        );
        assert!(matches!(dup, Err(ConversionError::AmbiguousAnswer { .. })));

        let missing = CanonicalQaEntry::new(
            "Which?",
            AnswerValue::Text("delta".into()),
            choices(&["alpha", "beta"]),
            Metadata::new(),
        );
        assert!(missing.is_err());
    }

    #[test]
    fn integer_and_letter_answers_index_choices() {
        let by_value = CanonicalQaEntry::new(
            "Sum?",
            AnswerValue::Integer(12),
            choices(&["10", "12"]),
            Metadata::new(),
        )
        .unwrap();
        assert_eq!(by_value.answer_choice_index(), Some(1));

        let by_index = CanonicalQaEntry::new(
            "Pick",
            AnswerValue::Integer(2),
            choices(&["a", "b", "c"]),
            Metadata::new(),
        )
        .unwrap();
        assert_eq!(by_index.answer_choice_index(), Some(2));

        let by_letter = CanonicalQaEntry::new(
            "Pick",
            AnswerValue::Text("C".into()),
            choices(&["red", "green", "blue"]),
            Metadata::new(),
        )
        .unwrap();
        assert_eq!(by_letter.answer_choice_index(), Some(2));
    }

    #[test]
    fn answer_serializes_with_explicit_type() {
        let entry = CanonicalQaEntry::new("Q", AnswerValue::Float(0.5), None, Metadata::new())
            .unwrap()
            .stamped(7, 2);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["answer"]["type"], "float");
        assert_eq!(json["metadata"]["record_index"], 7);
        let back: CanonicalQaEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn rejects_empty_question_and_nan() {
        assert!(CanonicalQaEntry::new(" ", AnswerValue::Boolean(true), None, Metadata::new()).is_err());
        assert!(
            CanonicalQaEntry::new("q", AnswerValue::Float(f64::NAN), None, Metadata::new())
                .is_err()
        );
    }

    #[test]
    fn kind_detection_by_extension_and_sniff() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("data.tsv");
        std::fs::write(&p, "a\tb\n").unwrap();
        assert_eq!(StructuralKind::detect(&p).unwrap(), StructuralKind::CsvTabular);

        let p = dir.path().join("blob.dat");
        std::fs::write(&p, "  \n [1,2]").unwrap();
        assert_eq!(StructuralKind::detect(&p).unwrap(), StructuralKind::JsonArray);

        let p = dir.path().join("lines.txt");
        std::fs::write(&p, "{\"a\":1}\n").unwrap();
        assert_eq!(StructuralKind::detect(&p).unwrap(), StructuralKind::Jsonl);
    }
}
