use std::collections::BTreeMap;

use super::answer::classify_answer;
use super::{DomainConverter, Expansion};
use crate::config::ScenarioSchema;
use crate::domain::{CanonicalQaEntry, DomainFamily, MetaValue, Metadata, RawRecord, RecordBody};
use crate::error::ConversionError;

/// Scenario tables: each row describes one scenario and carries a fixed set
/// of question/answer column pairs. Every row yields one entry per pair.
pub struct TabularScenarioConverter {
    schema: ScenarioSchema,
}

impl TabularScenarioConverter {
    pub fn new(schema: ScenarioSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &ScenarioSchema {
        &self.schema
    }

    fn required<'r>(
        row: &BTreeMap<&str, &'r str>,
        column: &str,
        row_index: usize,
    ) -> Result<&'r str, ConversionError> {
        let cell = row
            .get(column)
            .ok_or_else(|| ConversionError::MissingField(column.to_string()))?;
        if cell.trim().is_empty() {
            return Err(ConversionError::invalid(column, format!("empty in row {row_index}")));
        }
        Ok(*cell)
    }

    fn convert_row(
        &self,
        row: &BTreeMap<&str, &str>,
        row_index: usize,
    ) -> Result<Vec<CanonicalQaEntry>, ConversionError> {
        let scenario_id = Self::required(row, &self.schema.id_column, row_index)?;

        let mut context = Metadata::new();
        context.insert("scenario_id".into(), scenario_id.into());
        context.insert("domain".into(), "tabular_scenario".into());
        context.insert("row_index".into(), row_index.into());
        for col in &self.schema.context_columns {
            // scenario "domain" column is kept apart from the converter family
            let key = if col == "domain" { "scenario_domain" } else { col.as_str() };
            if let Some(v) = row.get(col.as_str()).filter(|v| !v.trim().is_empty()) {
                context.insert(key.to_string(), MetaValue::from(*v));
            }
        }

        let mut out = Vec::with_capacity(self.schema.sub_questions.len());
        for (i, (qcol, acol)) in self.schema.sub_questions.iter().enumerate() {
            let question = Self::required(row, qcol, row_index)?;
            let answer = Self::required(row, acol, row_index)?;
            let mut meta = context.clone();
            meta.insert("sub_question".into(), (i + 1).into());
            let shape = classify_answer(answer);
            meta.insert("answer_shape".into(), shape.label().into());
            out.push(CanonicalQaEntry::new(question.trim(), shape.to_value(), None, meta)?);
        }
        Ok(out)
    }
}

impl DomainConverter for TabularScenarioConverter {
    fn name(&self) -> &'static str {
        "tabular-scenario"
    }

    fn family(&self) -> DomainFamily {
        DomainFamily::TabularScenario
    }

    fn expansion(&self) -> Expansion {
        Expansion::PerRow(self.schema.sub_questions.len())
    }

    fn can_handle(&self, record: &RawRecord) -> bool {
        match &record.body {
            RecordBody::Tabular { headers, .. } => {
                let has = |c: &str| headers.iter().any(|h| h == c);
                has(&self.schema.id_column) && self.schema.sub_questions.iter().any(|(q, _)| has(q))
            }
            RecordBody::Json(_) => false,
        }
    }

    fn convert(&self, record: &RawRecord) -> Result<Vec<CanonicalQaEntry>, ConversionError> {
        let rows = record
            .tabular_rows()
            .ok_or_else(|| ConversionError::invalid("record", "expected tabular rows"))?;
        let mut out = Vec::with_capacity(rows.len() * self.schema.sub_questions.len());
        for (i, row) in rows.iter().enumerate() {
            out.extend(self.convert_row(row, i)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::dispatch;
    use crate::domain::AnswerValue;
    use std::sync::Arc;

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawRecord {
        RawRecord {
            ordinal: 3,
            body: RecordBody::Tabular {
                headers: Arc::new(headers.iter().map(|s| s.to_string()).collect()),
                rows: rows
                    .iter()
                    .map(|r| r.iter().map(|s| s.to_string()).collect())
                    .collect(),
            },
        }
    }

    const HEADERS: &[&str] = &[
        "scenario_id",
        "scenario",
        "domain",
        "question_1",
        "answer_1",
        "question_2",
        "answer_2",
        "question_3",
        "answer_3",
        "question_4",
        "answer_4",
    ];

    #[test]
    fn one_row_expands_to_four_entries() {
        let rec = table(
            HEADERS,
            &[&[
                "s-1", "A warehouse ships crates", "logistics", "How many crates?", "1,200", "On time?",
                "yes", "Cost per crate?", "$4.50", "Who signs off?", "the manager",
            ]],
        );
        let conv = TabularScenarioConverter::new(ScenarioSchema::default());
        assert!(conv.can_handle(&rec));
        let out = dispatch(&conv, &rec).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].answer, AnswerValue::Integer(1200));
        assert_eq!(out[1].answer, AnswerValue::Boolean(true));
        assert_eq!(out[2].answer, AnswerValue::Float(4.5));
        assert_eq!(out[3].answer, AnswerValue::Text("the manager".into()));
        for (i, e) in out.iter().enumerate() {
            assert_eq!(e.meta_text("scenario_id"), Some("s-1"));
            assert_eq!(e.meta_text("scenario_domain"), Some("logistics"));
            assert_eq!(e.metadata["sub_question"], MetaValue::Int(i as i64 + 1));
        }
    }

    #[test]
    fn empty_answer_cell_fails_loudly() {
        let rec = table(
            HEADERS,
            &[&["s-2", "x", "d", "q1", "1", "q2", "2", "q3", " ", "q4", "4"]],
        );
        let conv = TabularScenarioConverter::new(ScenarioSchema::default());
        assert!(matches!(
            conv.convert(&rec),
            Err(ConversionError::InvalidField { field, .. }) if field == "answer_3"
        ));
    }

    #[test]
    fn missing_column_is_missing_field() {
        let rec = table(&["scenario_id", "question_1", "answer_1"], &[&["s", "q", "a"]]);
        let conv = TabularScenarioConverter::new(ScenarioSchema::default());
        assert_eq!(
            conv.convert(&rec).unwrap_err(),
            ConversionError::MissingField("question_2".into())
        );
    }

    #[test]
    fn grouped_rows_scale_the_expansion() {
        let schema = ScenarioSchema {
            id_column: "id".into(),
            context_columns: vec![],
            sub_questions: vec![("q".into(), "a".into())],
        };
        let rec = table(&["id", "q", "a"], &[&["g", "q1", "1"], &["g", "q2", "2"]]);
        let conv = TabularScenarioConverter::new(schema);
        assert_eq!(conv.expansion().expected(&rec), 2);
        let out = dispatch(&conv, &rec).unwrap();
        assert_eq!(out[1].metadata["row_index"], MetaValue::Int(1));
    }
}
