//! Compilation of raw procedure rows into the flat trial sequence.
//!
//! A raw row may describe several consecutive trials. Columns named
//! `Post <level> <field>` belong to the trial at that level; untagged columns
//! belong to level 0. Later levels inherit any column they leave out from the
//! level before them, but only within the same raw row.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use crate::Row;

pub const TRIAL_TYPE: &str = "Trial Type";
pub const ROW_NUMBER: &str = "Row_Number";
pub const POST_LEVEL: &str = "Post_Level";
pub const STIMULI: &str = "Stimuli";

const POST_PREFIX: &str = "Post ";

/// One compiled trial, after inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialDescriptor {
    trial_type: Option<String>,
    row_number: usize,
    post_level: u32,
    columns: BTreeMap<String, String>,
}

impl TrialDescriptor {
    fn seeded(row_number: usize, post_level: u32) -> Self {
        Self {
            trial_type: None,
            row_number,
            post_level,
            columns: BTreeMap::new(),
        }
    }

    fn set(&mut self, column: &str, value: &str) {
        if column == TRIAL_TYPE {
            self.trial_type = Some(value.to_string());
        } else {
            self.columns.insert(column.to_string(), value.to_string());
        }
    }

    fn inherit_from(&mut self, earlier: &TrialDescriptor) {
        if self.trial_type.is_none() {
            self.trial_type = earlier.trial_type.clone();
        }
        for (column, value) in &earlier.columns {
            self.columns
                .entry(column.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn trial_type(&self) -> Option<&str> {
        self.trial_type.as_deref()
    }

    /// Index of the raw row this trial was compiled from.
    pub fn row_number(&self) -> usize {
        self.row_number
    }

    pub fn post_level(&self) -> u32 {
        self.post_level
    }

    pub fn stimuli(&self) -> Option<&str> {
        self.columns.get(STIMULI).map(String::as_str)
    }

    /// Domain columns, without the reserved ones.
    pub fn columns(&self) -> &BTreeMap<String, String> {
        &self.columns
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        match column {
            TRIAL_TYPE => self.trial_type(),
            _ => self.columns.get(column).map(String::as_str),
        }
    }

    /// Prefix of the spreadsheet columns this trial was read from.
    pub fn column_prefix(&self) -> String {
        if self.post_level == 0 {
            String::new()
        } else {
            format!("{}{} ", POST_PREFIX, self.post_level)
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = self.columns.clone();
        if let Some(trial_type) = &self.trial_type {
            row.insert(TRIAL_TYPE.to_string(), trial_type.clone());
        }
        row.insert(ROW_NUMBER.to_string(), self.row_number.to_string());
        row.insert(POST_LEVEL.to_string(), self.post_level.to_string());
        row
    }
}

impl Serialize for TrialDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_row().serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Procedure {
    trials: Vec<TrialDescriptor>,
}

impl Procedure {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&TrialDescriptor> {
        self.trials.get(position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrialDescriptor> {
        self.trials.iter()
    }

    /// Distinct trial types in order of first appearance.
    pub fn used_trial_types(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for trial_type in self.trials.iter().filter_map(TrialDescriptor::trial_type) {
            if !seen.contains(&trial_type) {
                seen.push(trial_type);
            }
        }
        seen
    }
}

impl<'a> IntoIterator for &'a Procedure {
    type Item = &'a TrialDescriptor;
    type IntoIter = std::slice::Iter<'a, TrialDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.trials.iter()
    }
}

pub fn compile(raw_rows: &[Row]) -> Procedure {
    let mut trials = Vec::new();
    for (row_number, row) in raw_rows.iter().enumerate() {
        trials.extend(split_row_into_trials(row, row_number));
    }
    Procedure { trials }
}

fn split_row_into_trials(row: &Row, row_number: usize) -> Vec<TrialDescriptor> {
    let mut levels: BTreeMap<u32, TrialDescriptor> = BTreeMap::new();
    for (raw_header, value) in row {
        let (level, header) = parse_header(raw_header);
        levels
            .entry(level)
            .or_insert_with(|| TrialDescriptor::seeded(row_number, level))
            .set(header, value);
    }

    let mut trials: Vec<TrialDescriptor> = Vec::with_capacity(levels.len());
    for (_, mut trial) in levels {
        if let Some(previous) = trials.last() {
            trial.inherit_from(previous);
        }
        trials.push(trial);
    }
    trials.retain(|trial| trial.trial_type() != Some(""));
    trials
}

/// Splits `Post <level> <field>` into its level and field; anything else is level 0.
fn parse_header(raw_header: &str) -> (u32, &str) {
    let Some(rest) = raw_header.strip_prefix(POST_PREFIX) else {
        return (0, raw_header);
    };
    let Some((digits, field)) = rest.split_once(' ') else {
        return (0, raw_header);
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (0, raw_header);
    }
    match digits.parse::<u32>() {
        Ok(level) => (level, field.trim()),
        Err(_) => (0, raw_header),
    }
}

/// Resolves a stimuli range expression such as `2, 5::7` into 0-based table
/// indices. Spreadsheet row numbers are offset by the header row.
pub fn stimulus_indices(range: &str) -> Vec<usize> {
    let mut numbers: Vec<i64> = Vec::new();
    for item in range.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once("::") {
            Some((start, end)) => {
                let (Ok(start), Ok(end)) = (start.trim().parse::<i64>(), end.trim().parse::<i64>())
                else {
                    continue;
                };
                if start <= end {
                    numbers.extend(start..=end);
                } else {
                    numbers.extend((end..=start).rev());
                }
            }
            None => {
                if let Ok(n) = item.parse::<i64>() {
                    numbers.push(n);
                }
            }
        }
    }
    numbers
        .into_iter()
        .filter_map(|n| usize::try_from(n - 2).ok())
        .collect()
}
