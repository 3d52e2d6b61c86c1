//! Domain converters.
//!
//! Each benchmark family has one [`DomainConverter`]. A converter declares
//! how many canonical entries one record expands into; [`dispatch`] holds it
//! to that declaration so a short or long expansion is a loud error instead
//! of a silent gap in the output.

pub mod answer;
pub mod graph;
pub mod judge;
pub mod math;
pub mod planning;
pub mod tabular;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::ScenarioSchema;
use crate::domain::{CanonicalQaEntry, DomainFamily, RawRecord};
use crate::error::{ConversionError, QaError, Result};

/// Declared entries-per-record ratio of a converter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expansion {
    /// Exactly `n` entries for every record.
    PerRecord(usize),
    /// Exactly `n` entries for every row of a tabular record.
    PerRow(usize),
}

impl Expansion {
    pub fn expected(&self, record: &RawRecord) -> usize {
        match *self {
            Expansion::PerRecord(n) => n,
            Expansion::PerRow(n) => n * record.row_count(),
        }
    }
}

pub trait DomainConverter: Send + Sync {
    fn name(&self) -> &'static str;

    fn family(&self) -> DomainFamily;

    fn expansion(&self) -> Expansion;

    /// Output depends only on the record; allows parallel chunk conversion.
    fn side_effect_free(&self) -> bool {
        true
    }

    fn can_handle(&self, record: &RawRecord) -> bool;

    fn convert(&self, record: &RawRecord) -> std::result::Result<Vec<CanonicalQaEntry>, ConversionError>;
}

/// Converts one record and checks the declared expansion.
pub fn dispatch(
    converter: &dyn DomainConverter,
    record: &RawRecord,
) -> std::result::Result<Vec<CanonicalQaEntry>, ConversionError> {
    let entries = converter.convert(record)?;
    let expected = converter.expansion().expected(record);
    if entries.len() != expected {
        return Err(ConversionError::ExpansionMismatch {
            converter: converter.name(),
            expected,
            actual: entries.len(),
        });
    }
    Ok(entries)
}

#[derive(Clone)]
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn DomainConverter>>,
}

impl ConverterRegistry {
    pub fn empty() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// All built-in converters, most specific first.
    pub fn standard(schema: ScenarioSchema) -> Self {
        let mut r = Self::empty();
        r.register(Arc::new(graph::GraphSpatialConverter));
        r.register(Arc::new(judge::JudgeMetaConverter));
        r.register(Arc::new(tabular::TabularScenarioConverter::new(schema)));
        r.register(Arc::new(math::MathematicalConverter));
        r.register(Arc::new(planning::GenericPlanningConverter));
        r
    }

    pub fn register(&mut self, converter: Arc<dyn DomainConverter>) {
        self.converters.push(converter);
    }

    pub fn for_family(&self, family: DomainFamily) -> Option<Arc<dyn DomainConverter>> {
        self.converters.iter().find(|c| c.family() == family).cloned()
    }

    pub fn all_side_effect_free(&self) -> bool {
        self.converters.iter().all(|c| c.side_effect_free())
    }

    /// First converter that accepts `record`.
    pub fn detect(&self, record: &RawRecord) -> Option<Arc<dyn DomainConverter>> {
        self.converters.iter().find(|c| c.can_handle(record)).cloned()
    }

    /// Converter for a job: explicit family, or detection on the first record.
    pub fn resolve(
        &self,
        family: DomainFamily,
        first: Option<&RawRecord>,
    ) -> Result<Arc<dyn DomainConverter>> {
        let found = match family {
            DomainFamily::Auto => match first {
                Some(r) => self.detect(r),
                None => self.for_family(DomainFamily::GenericPlanning),
            },
            f => self.for_family(f),
        };
        found.ok_or_else(|| QaError::Config(format!("no converter available for family {family:?}")))
    }
}

// JSON field helpers shared by the object-based converters.

pub(crate) fn object(record: &RawRecord) -> std::result::Result<&Map<String, Value>, ConversionError> {
    record
        .as_object()
        .ok_or_else(|| ConversionError::invalid("record", "expected a JSON object"))
}

/// First present, non-null field among `names`.
pub(crate) fn field<'a, 'n>(
    obj: &'a Map<String, Value>,
    names: &[&'n str],
) -> Option<(&'n str, &'a Value)> {
    names.iter().find_map(|n| match obj.get(*n) {
        Some(Value::Null) | None => None,
        Some(v) => Some((*n, v)),
    })
}

/// Required non-empty text; numbers and booleans are rendered.
pub(crate) fn text(
    obj: &Map<String, Value>,
    names: &[&str],
) -> std::result::Result<String, ConversionError> {
    let (name, v) = field(obj, names).ok_or_else(|| ConversionError::MissingField(names.join("|")))?;
    let s = value_text(v);
    if s.trim().is_empty() {
        return Err(ConversionError::invalid(name, "empty"));
    }
    Ok(s)
}

pub(crate) fn number(
    obj: &Map<String, Value>,
    names: &[&str],
) -> std::result::Result<f64, ConversionError> {
    let (name, v) = field(obj, names).ok_or_else(|| ConversionError::MissingField(names.join("|")))?;
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|x| x.is_finite())
    .ok_or_else(|| ConversionError::invalid(name, format!("not a number: {v}")))
}

/// Strings verbatim, everything else as compact JSON.
pub(crate) fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn record_id(obj: &Map<String, Value>) -> Option<String> {
    field(obj, &["id", "scenario_id", "graph_id", "problem_id"]).map(|(_, v)| value_text(v))
}

/// Optional choice list from `choices`/`options`: an array, or an object of
/// label -> text in label order.
pub(crate) fn choices(
    obj: &Map<String, Value>,
) -> std::result::Result<Option<Vec<String>>, ConversionError> {
    match field(obj, &["choices", "options"]) {
        None => Ok(None),
        Some((_, Value::Array(items))) => Ok(Some(items.iter().map(value_text).collect())),
        Some((_, Value::Object(map))) => Ok(Some(map.values().map(value_text).collect())),
        Some((name, _)) => Err(ConversionError::invalid(name, "expected a list of choices")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnswerValue, Metadata, RecordBody};
    use serde_json::json;

    struct Doubler;

    impl DomainConverter for Doubler {
        fn name(&self) -> &'static str {
            "doubler"
        }
        fn family(&self) -> DomainFamily {
            DomainFamily::GenericPlanning
        }
        fn expansion(&self) -> Expansion {
            Expansion::PerRecord(2)
        }
        fn can_handle(&self, _: &RawRecord) -> bool {
            true
        }
        fn convert(&self, _: &RawRecord) -> std::result::Result<Vec<CanonicalQaEntry>, ConversionError> {
            Ok(vec![CanonicalQaEntry::new("q", AnswerValue::Integer(1), None, Metadata::new())?])
        }
    }

    fn json_record(v: Value) -> RawRecord {
        RawRecord {
            ordinal: 0,
            body: RecordBody::Json(v),
        }
    }

    #[test]
    fn dispatch_enforces_declared_expansion() {
        let err = dispatch(&Doubler, &json_record(json!({}))).unwrap_err();
        assert_eq!(
            err,
            ConversionError::ExpansionMismatch {
                converter: "doubler",
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn auto_detection_prefers_specific_converters() {
        let reg = ConverterRegistry::standard(ScenarioSchema::default());
        let graph = json_record(json!({"nodes": [1, 2], "edges": [[1, 2]], "question": "q", "answer": "yes"}));
        assert_eq!(reg.detect(&graph).unwrap().family(), DomainFamily::GraphSpatial);

        let judge = json_record(json!({"response": "r", "judge_score": 3, "human_score": 4}));
        assert_eq!(reg.detect(&judge).unwrap().family(), DomainFamily::JudgeMeta);

        let math = json_record(json!({"problem": "1+1?", "answer": "2"}));
        assert_eq!(reg.detect(&math).unwrap().family(), DomainFamily::Mathematical);

        let plan = json_record(json!({"question": "Next step?", "answer": "boil water", "steps": ["a"]}));
        assert_eq!(reg.detect(&plan).unwrap().family(), DomainFamily::GenericPlanning);

        assert_eq!(
            reg.resolve(DomainFamily::Auto, None).unwrap().family(),
            DomainFamily::GenericPlanning
        );
        assert!(reg.detect(&json_record(json!([1, 2]))).is_none());
    }

    #[test]
    fn field_helpers() {
        let v = json!({"id": 7, "question": "  ", "choices": {"A": "x", "B": "y"}, "judge_score": "4.5"});
        let obj = v.as_object().unwrap();
        assert_eq!(record_id(obj).as_deref(), Some("7"));
        assert_eq!(text(obj, &["question"]), Err(ConversionError::invalid("question", "empty")));
        assert_eq!(choices(obj).unwrap(), Some(vec!["x".to_string(), "y".to_string()]));
        assert_eq!(number(obj, &["judge_score"]).unwrap(), 4.5);
        assert!(matches!(text(obj, &["answer"]), Err(ConversionError::MissingField(_))));
    }
}
