//! Judge-evaluation records: a model's score of a response next to a
//! reference score. The entry asks whether the judge was calibrated, which
//! makes it an evaluation of an evaluation.

use serde_json::{Map, Value};

use super::{DomainConverter, Expansion, field, number, object, record_id, text, value_text};
use crate::domain::{AnswerValue, CanonicalQaEntry, DomainFamily, MetaValue, Metadata, RawRecord};
use crate::error::ConversionError;

const DEFAULT_MAX_SCORE: f64 = 10.0;
const DEFAULT_TOLERANCE_RATIO: f64 = 0.1;

pub const VERDICTS: [&str; 3] = ["accurate", "too lenient", "too harsh"];

const REFERENCE_FIELDS: &[&str] = &["human_score", "reference_score", "gold_score"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accurate,
    TooLenient,
    TooHarsh,
}

impl Verdict {
    pub fn of(judge: f64, reference: f64, tolerance: f64) -> Self {
        let delta = judge - reference;
        if delta.abs() <= tolerance {
            Verdict::Accurate
        } else if delta > 0.0 {
            Verdict::TooLenient
        } else {
            Verdict::TooHarsh
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accurate => VERDICTS[0],
            Verdict::TooLenient => VERDICTS[1],
            Verdict::TooHarsh => VERDICTS[2],
        }
    }
}

pub struct JudgeMetaConverter;

fn score_in_range(obj: &Map<String, Value>, names: &[&str], max: f64) -> Result<f64, ConversionError> {
    let s = number(obj, names)?;
    if !(0.0..=max).contains(&s) {
        return Err(ConversionError::invalid(
            names[0],
            format!("score {s} outside 0..={max}"),
        ));
    }
    Ok(s)
}

impl DomainConverter for JudgeMetaConverter {
    fn name(&self) -> &'static str {
        "judge-meta"
    }

    fn family(&self) -> DomainFamily {
        DomainFamily::JudgeMeta
    }

    fn expansion(&self) -> Expansion {
        Expansion::PerRecord(1)
    }

    fn can_handle(&self, record: &RawRecord) -> bool {
        record.as_object().is_some_and(|o| {
            o.contains_key("judge_score") && field(o, REFERENCE_FIELDS).is_some()
        })
    }

    fn convert(&self, record: &RawRecord) -> Result<Vec<CanonicalQaEntry>, ConversionError> {
        let obj = object(record)?;
        let response = text(obj, &["response", "output", "completion"])?;

        let max = match field(obj, &["max_score"]) {
            Some(_) => number(obj, &["max_score"])?,
            None => DEFAULT_MAX_SCORE,
        };
        if max <= 0.0 {
            return Err(ConversionError::invalid("max_score", "must be positive"));
        }
        let tolerance = match field(obj, &["tolerance"]) {
            Some(_) => number(obj, &["tolerance"])?.abs(),
            None => max * DEFAULT_TOLERANCE_RATIO,
        };
        let judge = score_in_range(obj, &["judge_score"], max)?;
        let reference = score_in_range(obj, REFERENCE_FIELDS, max)?;
        let verdict = Verdict::of(judge, reference, tolerance);

        let mut question = String::new();
        if let Some((_, p)) = field(obj, &["prompt", "question", "instruction"]) {
            question.push_str(&format!("Prompt: {}\n", value_text(p)));
        }
        question.push_str(&format!("Response: {response}\n"));
        question.push_str(&format!("A judge scored this response {judge} out of {max}."));
        if let Some((_, r)) = field(obj, &["judge_reasoning", "rationale"]) {
            question.push_str(&format!(" Its reasoning: {}", value_text(r)));
        }
        question.push_str("\nWas the judge's score accurate, too lenient, or too harsh?");

        let mut meta = Metadata::new();
        if let Some(id) = record_id(obj) {
            meta.insert("scenario_id".into(), MetaValue::Text(id));
        }
        meta.insert("domain".into(), "judge_meta".into());
        meta.insert("evaluation_of_an_evaluation".into(), true.into());
        meta.insert("evaluation_order".into(), 2i64.into());
        meta.insert("judge_score".into(), judge.into());
        meta.insert("reference_score".into(), reference.into());
        meta.insert("score_delta".into(), (judge - reference).into());
        meta.insert("max_score".into(), max.into());

        let entry = CanonicalQaEntry::new(
            question,
            AnswerValue::Text(verdict.as_str().into()),
            Some(VERDICTS.iter().map(|v| v.to_string()).collect()),
            meta,
        )?;
        Ok(vec![entry])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordBody;
    use serde_json::json;

    fn rec(v: Value) -> RawRecord {
        RawRecord {
            ordinal: 0,
            body: RecordBody::Json(v),
        }
    }

    #[test]
    fn verdict_bands() {
        assert_eq!(Verdict::of(7.0, 7.5, 1.0), Verdict::Accurate);
        assert_eq!(Verdict::of(9.0, 5.0, 1.0), Verdict::TooLenient);
        assert_eq!(Verdict::of(2.0, 5.0, 1.0), Verdict::TooHarsh);
    }

    #[test]
    fn lenient_judge_entry() {
        let r = rec(json!({
            "id": "j1",
            "prompt": "Summarise the memo",
            "response": "It is about budgets.",
            "judge_score": 9,
            "judge_reasoning": "Concise.",
            "human_score": 4
        }));
        let out = JudgeMetaConverter.convert(&r).unwrap();
        let e = &out[0];
        assert_eq!(e.answer, AnswerValue::Text("too lenient".into()));
        assert_eq!(e.answer_choice_index(), Some(1));
        assert!(e.question.starts_with("Prompt: Summarise the memo\n"));
        assert!(e.question.contains("Its reasoning: Concise."));
        assert_eq!(e.meta_text("scenario_id"), Some("j1"));
        assert_eq!(e.metadata["evaluation_of_an_evaluation"], MetaValue::Bool(true));
        assert_eq!(e.metadata["evaluation_order"], MetaValue::Int(2));
        assert_eq!(e.metadata["score_delta"], MetaValue::Float(5.0));
    }

    #[test]
    fn custom_scale_and_range_check() {
        let ok = rec(json!({"response": "r", "judge_score": 4, "reference_score": 5, "max_score": 5}));
        // default tolerance is 10% of 5
        let out = JudgeMetaConverter.convert(&ok).unwrap();
        assert_eq!(out[0].answer, AnswerValue::Text("too harsh".into()));

        let bad = rec(json!({"response": "r", "judge_score": 12, "human_score": 5}));
        assert!(matches!(
            JudgeMetaConverter.convert(&bad),
            Err(ConversionError::InvalidField { field, .. }) if field == "judge_score"
        ));
    }

    #[test]
    fn missing_response_is_rejected() {
        let r = rec(json!({"judge_score": 3, "human_score": 3}));
        assert!(matches!(
            JudgeMetaConverter.convert(&r),
            Err(ConversionError::MissingField(_))
        ));
    }
}
