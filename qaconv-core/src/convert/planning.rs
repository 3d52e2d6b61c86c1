use serde_json::Value;

use super::answer::classify_answer;
use super::{DomainConverter, Expansion, choices, field, object, record_id, text, value_text};
use crate::domain::{AnswerValue, CanonicalQaEntry, DomainFamily, MetaValue, Metadata, RawRecord};
use crate::error::ConversionError;

/// Catch-all for question/answer objects, optionally with a goal and a plan.
pub struct GenericPlanningConverter;

impl DomainConverter for GenericPlanningConverter {
    fn name(&self) -> &'static str {
        "generic-planning"
    }

    fn family(&self) -> DomainFamily {
        DomainFamily::GenericPlanning
    }

    fn expansion(&self) -> Expansion {
        Expansion::PerRecord(1)
    }

    fn can_handle(&self, record: &RawRecord) -> bool {
        record.as_object().is_some_and(|o| {
            field(o, &["question", "prompt", "task"]).is_some() && field(o, &["answer", "expected"]).is_some()
        })
    }

    fn convert(&self, record: &RawRecord) -> Result<Vec<CanonicalQaEntry>, ConversionError> {
        let obj = object(record)?;
        let question = text(obj, &["question", "prompt", "task"])?;
        let answer = match field(obj, &["answer", "expected"]) {
            Some((_, Value::Bool(b))) => AnswerValue::Boolean(*b),
            Some((_, Value::Number(n))) => match n.as_i64() {
                Some(i) => AnswerValue::Integer(i),
                None => AnswerValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Some(_) => {
                let raw = text(obj, &["answer", "expected"])?;
                classify_answer(&raw).to_value()
            }
            None => return Err(ConversionError::MissingField("answer".into())),
        };

        let mut meta = Metadata::new();
        if let Some(id) = record_id(obj) {
            meta.insert("scenario_id".into(), MetaValue::Text(id));
        }
        meta.insert("domain".into(), "generic_planning".into());
        if let Some((_, g)) = field(obj, &["goal"]) {
            meta.insert("goal".into(), value_text(g).into());
        }
        match field(obj, &["steps", "plan"]) {
            Some((_, Value::Array(steps))) => {
                meta.insert("step_count".into(), steps.len().into());
            }
            Some((name, _)) => return Err(ConversionError::invalid(name, "expected a list of steps")),
            None => {}
        }

        let entry = CanonicalQaEntry::new(question, answer, choices(obj)?, meta)?;
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
    fn plan_metadata() {
        let r = rec(json!({
            "id": "p-3",
            "goal": "make tea",
            "steps": ["boil water", "steep", "pour"],
            "question": "What comes first?",
            "answer": "boil water",
            "options": ["pour", "boil water"]
        }));
        let e = &GenericPlanningConverter.convert(&r).unwrap()[0];
        assert_eq!(e.answer, AnswerValue::Text("boil water".into()));
        assert_eq!(e.answer_choice_index(), Some(1));
        assert_eq!(e.meta_text("goal"), Some("make tea"));
        assert_eq!(e.meta_text("scenario_id"), Some("p-3"));
        assert_eq!(e.metadata["step_count"], MetaValue::Int(3));
    }

    #[test]
    fn typed_json_answers_pass_through() {
        let r = rec(json!({"task": "Is the plan feasible?", "answer": true}));
        assert_eq!(
            GenericPlanningConverter.convert(&r).unwrap()[0].answer,
            AnswerValue::Boolean(true)
        );
        let n = rec(json!({"question": "How many moves?", "answer": 7}));
        assert_eq!(GenericPlanningConverter.convert(&n).unwrap()[0].answer, AnswerValue::Integer(7));
    }

    #[test]
    fn rejects_records_without_question() {
        let r = rec(json!({"answer": "x"}));
        assert!(!GenericPlanningConverter.can_handle(&r));
        assert!(matches!(
            GenericPlanningConverter.convert(&r),
            Err(ConversionError::MissingField(_))
        ));
    }
}
