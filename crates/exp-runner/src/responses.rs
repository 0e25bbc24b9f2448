use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{EngineError, ResumeError};
use crate::navigation::COMMAND_FIELD;
use crate::Row;

pub const USERNAME: &str = "Exp_Username";
pub const SESSION_ID: &str = "Exp_ID";
pub const EXPERIMENT_NAME: &str = "Exp_Name";
pub const DATE: &str = "Exp_Date";
pub const TIMESTAMP: &str = "Exp_Timestamp";
pub const TRIAL_NUMBER: &str = "Exp_Trial_Number";
pub const PROC_INDEX: &str = "Exp_Proc_Index";
pub const NEXT_PROC_INDEX: &str = "Exp_Next_Proc_Index";

/// Rows exactly as a rendered trial produced them.
pub type RawResponseSet = Vec<Map<String, Value>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub username: String,
    pub id: String,
    pub experiment: String,
}

/// Bookkeeping for one completed trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub trial_number: usize,
    pub position: usize,
    pub next_position: usize,
}

/// Finalized responses of one trial. Values are text and never change after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseSet {
    #[serde(skip)]
    transition: Transition,
    rows: Vec<Row>,
}

impl ResponseSet {
    pub fn finalize(raw: RawResponseSet, transition: Transition, participant: &Participant) -> Self {
        Self::finalize_at(raw, transition, participant, Local::now())
    }

    pub fn finalize_at(
        raw: RawResponseSet,
        transition: Transition,
        participant: &Participant,
        at: DateTime<Local>,
    ) -> Self {
        let info = added_info(transition, participant, at);
        let mut raw = raw;
        if raw.is_empty() {
            raw.push(Map::new());
        }
        let rows = raw
            .into_iter()
            .map(|row| {
                let mut out: Row = row
                    .into_iter()
                    .map(|(column, value)| (column, stringify(value)))
                    .collect();
                for (column, value) in &info {
                    out.insert(column.to_string(), value.clone());
                }
                out
            })
            .collect();
        Self { transition, rows }
    }

    /// Rebuilds a set from rows recorded by an earlier session.
    pub fn from_recorded(rows: Vec<Row>) -> Result<Self, ResumeError> {
        let first = rows.first().ok_or(ResumeError::MissingField {
            field: TRIAL_NUMBER,
        })?;
        let transition = Transition {
            trial_number: recorded_number(first, TRIAL_NUMBER)?,
            position: recorded_number(first, PROC_INDEX)?,
            next_position: recorded_number(first, NEXT_PROC_INDEX)?,
        };
        Ok(Self { transition, rows })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn trial_number(&self) -> usize {
        self.transition.trial_number
    }

    pub fn position(&self) -> usize {
        self.transition.position
    }

    pub fn next_position(&self) -> usize {
        self.transition.next_position
    }

    pub fn first_value(&self, column: &str) -> Option<&str> {
        self.rows.first()?.get(column).map(String::as_str)
    }

    pub fn column_values(&self, column: &str) -> Vec<Option<&str>> {
        self.rows
            .iter()
            .map(|row| row.get(column).map(String::as_str))
            .collect()
    }
}

fn added_info(
    transition: Transition,
    participant: &Participant,
    at: DateTime<Local>,
) -> [(&'static str, String); 8] {
    let timestamp = at.timestamp_micros() as f64 / 1000.0;
    [
        (USERNAME, participant.username.clone()),
        (SESSION_ID, participant.id.clone()),
        (EXPERIMENT_NAME, participant.experiment.clone()),
        (DATE, at.format("%Y-%m-%d").to_string()),
        (TIMESTAMP, timestamp.to_string()),
        (TRIAL_NUMBER, transition.trial_number.to_string()),
        (PROC_INDEX, transition.position.to_string()),
        (NEXT_PROC_INDEX, transition.next_position.to_string()),
    ]
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn recorded_number(row: &Row, field: &'static str) -> Result<usize, ResumeError> {
    let value = row.get(field).ok_or(ResumeError::MissingField { field })?;
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ResumeError::BadNumber {
            field,
            value: value.clone(),
        })
}

/// Parses a trial submission: either one object or an array of objects.
pub fn parse_submission(json: &str) -> Result<RawResponseSet, EngineError> {
    let value: Value = serde_json::from_str(json).map_err(EngineError::Submission)?;
    match value {
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                _ => Err(EngineError::SubmissionShape),
            })
            .collect(),
        _ => Err(EngineError::SubmissionShape),
    }
}

/// Navigation command of a submission, read from its first row.
pub fn submitted_command(raw: &RawResponseSet) -> Option<String> {
    raw.first()?.get(COMMAND_FIELD).cloned().map(stringify)
}

/// Groups recorded rows into response sets keyed by trial number.
pub fn group_recorded(rows: Vec<Row>) -> Result<Vec<ResponseSet>, ResumeError> {
    let mut by_trial: BTreeMap<usize, Vec<Row>> = BTreeMap::new();
    for row in rows {
        let trial_number = recorded_number(&row, TRIAL_NUMBER)?;
        by_trial.entry(trial_number).or_default().push(row);
    }
    by_trial.into_values().map(ResponseSet::from_recorded).collect()
}

/// Where a session continues after the recorded responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumePoint {
    pub trial_number: usize,
    pub position: usize,
}

impl ResumePoint {
    pub fn after(responses: &[ResponseSet]) -> Self {
        match responses.last() {
            None => Self::default(),
            Some(last) => Self {
                trial_number: last.trial_number() + 1,
                position: last.next_position(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn participant() -> Participant {
        Participant {
            username: "ana".to_string(),
            id: "s1".to_string(),
            experiment: "Memory".to_string(),
        }
    }

    #[test]
    fn finalize_stamps_and_stringifies_every_row() {
        let raw = parse_submission(
            &json!([
                {"Response": "dog", "RT": 512.5, "Correct": true},
                {"Response": null, "Choices": [1, 2]}
            ])
            .to_string(),
        )
        .expect("parse");
        let at = Local.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
        let transition = Transition {
            trial_number: 4,
            position: 7,
            next_position: 8,
        };
        let set = ResponseSet::finalize_at(raw, transition, &participant(), at);

        assert_eq!(set.rows().len(), 2);
        let first = &set.rows()[0];
        assert_eq!(first["RT"], "512.5");
        assert_eq!(first["Correct"], "true");
        assert_eq!(first[USERNAME], "ana");
        assert_eq!(first[SESSION_ID], "s1");
        assert_eq!(first[EXPERIMENT_NAME], "Memory");
        assert_eq!(first[DATE], "2024-03-09");
        assert_eq!(first[TRIAL_NUMBER], "4");
        assert_eq!(first[PROC_INDEX], "7");
        assert_eq!(first[NEXT_PROC_INDEX], "8");
        let second = &set.rows()[1];
        assert_eq!(second["Response"], "null");
        assert_eq!(second["Choices"], "[1,2]");
        assert_eq!(second[TRIAL_NUMBER], "4");
    }

    #[test]
    fn bookkeeping_overrides_trial_columns() {
        let raw = parse_submission(r#"{"Exp_Trial_Number": "spoofed"}"#).expect("parse");
        let transition = Transition {
            trial_number: 0,
            position: 0,
            next_position: 1,
        };
        let set = ResponseSet::finalize(raw, transition, &participant());
        assert_eq!(set.first_value(TRIAL_NUMBER), Some("0"));
    }

    #[test]
    fn empty_submission_still_records_bookkeeping() {
        let raw = parse_submission("[]").expect("parse");
        let transition = Transition {
            trial_number: 2,
            position: 2,
            next_position: 3,
        };
        let set = ResponseSet::finalize(raw, transition, &participant());
        assert_eq!(set.rows().len(), 1);
        assert_eq!(set.first_value(NEXT_PROC_INDEX), Some("3"));
    }

    #[test]
    fn submission_shape_is_checked() {
        assert!(matches!(
            parse_submission("[1, 2]"),
            Err(EngineError::SubmissionShape)
        ));
        assert!(matches!(
            parse_submission("not json"),
            Err(EngineError::Submission(_))
        ));
    }

    #[test]
    fn command_is_read_from_first_row() {
        let raw = parse_submission(
            r#"[{"Exp_Command": "mod proc index: r-1"}, {"Exp_Command": "ignored"}]"#,
        )
        .expect("parse");
        assert_eq!(
            submitted_command(&raw).as_deref(),
            Some("mod proc index: r-1")
        );
        assert_eq!(submitted_command(&vec![Map::new()]), None);
    }

    fn recorded(trial: &str, next: &str) -> Row {
        [
            (TRIAL_NUMBER, trial),
            (PROC_INDEX, "0"),
            (NEXT_PROC_INDEX, next),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn resume_point_follows_last_recorded_trial() {
        assert_eq!(ResumePoint::after(&[]), ResumePoint::default());

        let sets = group_recorded(vec![
            recorded("1", "5"),
            recorded("0", "1"),
            recorded("1", "5"),
        ])
        .expect("group");
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].rows().len(), 2);
        assert_eq!(
            ResumePoint::after(&sets),
            ResumePoint {
                trial_number: 2,
                position: 5
            }
        );
    }

    #[test]
    fn unparseable_recorded_rows_fail() {
        let err = group_recorded(vec![recorded("one", "1")]).expect_err("bad number");
        assert_eq!(
            err,
            ResumeError::BadNumber {
                field: TRIAL_NUMBER,
                value: "one".to_string()
            }
        );
    }
}
