use thiserror::Error;

use crate::catalog::TrialTypeCatalog;
use crate::procedure::{stimulus_indices, Procedure, TrialDescriptor};
use crate::Row;

/// Spreadsheet rows are 1-based and follow a header row.
const SPREADSHEET_ROW_OFFSET: usize = 2;

/// A procedure reference that does not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Missing the required \"Trial Type\" column")]
    MissingTrialTypeColumn,
    #[error(
        "In row {row}, under column \"{prefix}Trial Type\", the type \"{trial_type}\" does not exist."
    )]
    UnknownTrialType {
        row: usize,
        prefix: String,
        trial_type: String,
    },
    #[error("In row {row}, in the \"{prefix}Stimuli\" column, the stimuli row {index} does not exist.")]
    MissingStimulus {
        row: usize,
        prefix: String,
        index: usize,
    },
}

/// Cross-checks the procedure against the catalog and stimuli table.
pub fn check(
    procedure: &Procedure,
    catalog: &TrialTypeCatalog,
    stimuli: &[Row],
) -> Vec<IntegrityError> {
    let Some(first) = procedure.get(0) else {
        return Vec::new();
    };
    if first.trial_type().is_none() {
        return vec![IntegrityError::MissingTrialTypeColumn];
    }

    let mut errors = Vec::new();
    for trial in procedure {
        check_trial(trial, catalog, stimuli, &mut errors);
    }
    errors
}

fn check_trial(
    trial: &TrialDescriptor,
    catalog: &TrialTypeCatalog,
    stimuli: &[Row],
    errors: &mut Vec<IntegrityError>,
) {
    let row = trial.row_number() + SPREADSHEET_ROW_OFFSET;
    let prefix = trial.column_prefix();
    let trial_type = trial.trial_type().unwrap_or_default();
    if !catalog.contains(trial_type) {
        errors.push(IntegrityError::UnknownTrialType {
            row,
            prefix: prefix.clone(),
            trial_type: trial_type.to_string(),
        });
    }
    if let Some(range) = trial.stimuli() {
        for index in stimulus_indices(range) {
            if index >= stimuli.len() {
                errors.push(IntegrityError::MissingStimulus {
                    row,
                    prefix: prefix.clone(),
                    index,
                });
            }
        }
    }
}

/// Human readable findings; empty when the procedure is consistent.
pub fn validate(procedure: &Procedure, catalog: &TrialTypeCatalog, stimuli: &[Row]) -> Vec<String> {
    check(procedure, catalog, stimuli)
        .iter()
        .map(ToString::to_string)
        .collect()
}
