use serde_json::{Map, Value};

use super::answer::{AnswerShape, classify_answer, final_answer};
use super::{DomainConverter, Expansion, choices, field, object, record_id, text, value_text};
use crate::domain::{CanonicalQaEntry, DomainFamily, MetaValue, Metadata, RawRecord};
use crate::error::ConversionError;

const QUESTION_FIELDS: &[&str] = &["question", "problem"];
const ANSWER_FIELDS: &[&str] = &["final_answer", "answer", "solution"];
/// Supporting material, appended to the question and kept verbatim in metadata.
const EVIDENCE_FIELDS: &[&str] = &["table", "context", "evidence", "passage"];

/// Word problems and numeric QA: GSM8K-style worked answers, table QA, and
/// anything whose expected answer is a number or expression.
pub struct MathematicalConverter;

fn answer_text(obj: &Map<String, Value>) -> Result<(String, Option<String>), ConversionError> {
    let (name, v) =
        field(obj, ANSWER_FIELDS).ok_or_else(|| ConversionError::MissingField(ANSWER_FIELDS.join("|")))?;
    let raw = value_text(v);
    let (ans, work) = final_answer(&raw);
    if ans.is_empty() {
        return Err(ConversionError::invalid(name, "no final answer"));
    }
    Ok((ans.to_string(), work.filter(|w| !w.is_empty()).map(str::to_string)))
}

impl DomainConverter for MathematicalConverter {
    fn name(&self) -> &'static str {
        "mathematical"
    }

    fn family(&self) -> DomainFamily {
        DomainFamily::Mathematical
    }

    fn expansion(&self) -> Expansion {
        Expansion::PerRecord(1)
    }

    fn can_handle(&self, record: &RawRecord) -> bool {
        let Some(obj) = record.as_object() else {
            return false;
        };
        if obj.contains_key("nodes") {
            return false;
        }
        if ["problem", "solution", "final_answer"].iter().any(|k| obj.contains_key(*k)) {
            return true;
        }
        if obj.contains_key("steps") || obj.contains_key("goal") || !obj.contains_key("question") {
            return false;
        }
        match answer_text(obj) {
            Ok((ans, _)) => {
                let shape = classify_answer(&ans);
                shape.is_numeric() || matches!(shape, AnswerShape::Symbolic(_))
            }
            Err(_) => false,
        }
    }

    fn convert(&self, record: &RawRecord) -> Result<Vec<CanonicalQaEntry>, ConversionError> {
        let obj = object(record)?;
        let mut question = text(obj, QUESTION_FIELDS)?;
        let mut meta = Metadata::new();
        for name in EVIDENCE_FIELDS {
            if let Some((_, v)) = field(obj, &[*name]) {
                let evidence = value_text(v);
                question.push_str("\n\n");
                question.push_str(&evidence);
                meta.insert((*name).to_string(), evidence.into());
            }
        }

        let (ans, work) = answer_text(obj)?;
        let shape = classify_answer(&ans);

        if let Some(id) = record_id(obj) {
            meta.insert("scenario_id".into(), MetaValue::Text(id));
        }
        meta.insert("domain".into(), "mathematical".into());
        meta.insert("answer_shape".into(), shape.label().into());
        if let AnswerShape::Currency { symbol, .. } = &shape {
            meta.insert("currency".into(), symbol.as_str().into());
        }
        if let Some(work) = work {
            let steps = work.lines().filter(|l| !l.trim().is_empty()).count();
            meta.insert("reasoning_steps".into(), steps.into());
            meta.insert("worked_solution".into(), work.into());
        }

        let entry = CanonicalQaEntry::new(question, shape.to_value(), choices(obj)?, meta)?;
        Ok(vec![entry])
    }
}
