use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::catalog::{TrialType, TrialTypeCatalog, END_OF_EXPERIMENT};
use crate::config::Condition;
use crate::error::EngineError;
use crate::navigation::{self, KeyPress, Shortcut, COMMAND_FIELD};
use crate::procedure::{self, stimulus_indices, Procedure, TrialDescriptor};
use crate::responses::{
    group_recorded, parse_submission, submitted_command, Participant, ResponseSet, ResumePoint,
    Transition,
};
use crate::source::TabularSource;
use crate::submission::{Drained, Submitter};
use crate::validator;
use crate::Row;

const STIMULI_DIR: &str = "stimuli";
const PROCEDURES_DIR: &str = "procedures";

/// Everything loaded once at session start.
#[derive(Debug, Clone)]
pub struct ExperimentData {
    condition: Condition,
    stimuli: Vec<Row>,
    procedure: Procedure,
    responses: Vec<ResponseSet>,
}

impl ExperimentData {
    pub fn load(
        source: &dyn TabularSource,
        condition: Condition,
        shuffle_seed: Option<&str>,
        recorded: Vec<Row>,
    ) -> Result<Self, EngineError> {
        let stim_seed = shuffle_seed.map(|seed| format!("{}-stim", seed));
        let proc_seed = shuffle_seed.map(|seed| format!("{}-proc", seed));
        let stimuli = source.fetch(
            &format!("{}/{}", STIMULI_DIR, condition.stimuli()?),
            stim_seed.as_deref(),
        )?;
        let raw_procedure = source.fetch(
            &format!("{}/{}", PROCEDURES_DIR, condition.procedure()?),
            proc_seed.as_deref(),
        )?;
        Ok(Self {
            condition,
            stimuli,
            procedure: procedure::compile(&raw_procedure),
            responses: group_recorded(recorded)?,
        })
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn stimuli(&self) -> &[Row] {
        &self.stimuli
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub fn responses(&self) -> &[ResponseSet] {
        &self.responses
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub allow_keyboard_shortcuts_to_change_trial: bool,
}

impl Settings {
    /// Submission payload for an experimenter shortcut, when enabled.
    pub fn shortcut_submission(&self, press: KeyPress) -> Option<String> {
        if !self.allow_keyboard_shortcuts_to_change_trial {
            return None;
        }
        let shortcut = Shortcut::from_key(press)?;
        Some(json!({ COMMAND_FIELD: shortcut.command() }).to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialValues<'a> {
    pub procedure: &'a TrialDescriptor,
    pub stimuli: Vec<&'a Row>,
}

/// What the renderer shows next. `values` is `None` at the end of the experiment.
#[derive(Debug, Clone)]
pub struct TrialView<'a> {
    pub position: usize,
    pub trial_number: usize,
    pub trial_type: &'a str,
    pub definition: Option<&'a TrialType>,
    pub values: Option<TrialValues<'a>>,
}

impl TrialView<'_> {
    pub fn is_end(&self) -> bool {
        self.values.is_none()
    }
}

pub trait TrialRenderer {
    /// Shows a trial and returns the participant's raw responses as JSON.
    fn present(&mut self, trial: &TrialView<'_>) -> Result<String, EngineError>;

    fn finish(&mut self, trial: &TrialView<'_>) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub trials_completed: usize,
    pub position: usize,
}

pub struct Experiment {
    data: ExperimentData,
    catalog: TrialTypeCatalog,
    participant: Participant,
    settings: Settings,
    submitter: Submitter,
    position: usize,
    trial_number: usize,
    diagnostics: Vec<String>,
}

impl Experiment {
    pub fn new(
        data: ExperimentData,
        catalog: TrialTypeCatalog,
        participant: Participant,
        settings: Settings,
        submitter: Submitter,
    ) -> Self {
        let resume = ResumePoint::after(data.responses());
        let diagnostics = validator::validate(data.procedure(), &catalog, data.stimuli());
        if !diagnostics.is_empty() {
            error!(
                procedure = data.condition().get("Procedure").unwrap_or_default(),
                count = diagnostics.len(),
                "errors found in the procedure file:\n\n{}",
                diagnostics.join("\n")
            );
        }
        Self {
            data,
            catalog,
            participant,
            settings,
            submitter,
            position: resume.position,
            trial_number: resume.trial_number,
            diagnostics,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn trial_number(&self) -> usize {
        self.trial_number
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.data.procedure().len()
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn data(&self) -> &ExperimentData {
        &self.data
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn used_trial_types(&self) -> Vec<&str> {
        self.data.procedure().used_trial_types()
    }

    /// `None` for any position outside the procedure.
    pub fn trial_values(&self, position: usize) -> Option<TrialValues<'_>> {
        let trial = self.data.procedure().get(position)?;
        let stimuli = trial
            .stimuli()
            .map(stimulus_indices)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|index| self.data.stimuli().get(index))
            .collect();
        Some(TrialValues {
            procedure: trial,
            stimuli,
        })
    }

    pub fn current_trial(&self) -> TrialView<'_> {
        let values = self.trial_values(self.position);
        let trial_type = values
            .as_ref()
            .map_or(Some(END_OF_EXPERIMENT), |v| v.procedure.trial_type())
            .unwrap_or_default();
        TrialView {
            position: self.position,
            trial_number: self.trial_number,
            trial_type,
            definition: self.catalog.get(trial_type),
            values,
        }
    }

    /// Finalizes a trial's responses, queues them for delivery and moves to
    /// the next position. Returns the new position.
    pub fn receive_trial_submission(&mut self, json: &str) -> Result<usize, EngineError> {
        let raw = parse_submission(json)?;
        let command = submitted_command(&raw);
        let length = self.data.procedure().len();
        let next_position = navigation::advance(self.position, command.as_deref(), length)?;
        let transition = Transition {
            trial_number: self.trial_number,
            position: self.position,
            next_position,
        };
        let responses = ResponseSet::finalize(raw, transition, &self.participant);
        self.submitter.enqueue(responses.clone());
        self.data.responses.push(responses);
        self.position = next_position;
        self.trial_number += 1;
        Ok(next_position)
    }

    /// Shortcuts stop working once the experiment has ended.
    pub fn shortcut_submission(&self, press: KeyPress) -> Option<String> {
        if self.is_finished() {
            return None;
        }
        self.settings.shortcut_submission(press)
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// First-row value of `column` in the most recent response set.
    pub fn last_response_value(&self, column: &str) -> &str {
        self.data
            .responses()
            .last()
            .and_then(|set| set.first_value(column))
            .unwrap_or_default()
    }

    pub fn last_response_values(&self, column: &str) -> Vec<Option<&str>> {
        self.data
            .responses()
            .last()
            .map(|set| set.column_values(column))
            .unwrap_or_default()
    }

    pub fn on_submissions_drained(&self) -> Drained {
        self.submitter.on_drained()
    }

    /// Runs trials until the end of the procedure.
    pub fn begin(&mut self, renderer: &mut dyn TrialRenderer) -> Result<RunSummary, EngineError> {
        info!(
            participant = %self.participant.username,
            session = %self.participant.id,
            trials = self.data.procedure().len(),
            position = self.position,
            trial_number = self.trial_number,
            "experiment started"
        );
        loop {
            let raw = {
                let view = self.current_trial();
                if view.is_end() {
                    renderer.finish(&view)?;
                    break;
                }
                renderer.present(&view)?
            };
            self.receive_trial_submission(&raw)?;
        }
        info!(
            trials_completed = self.trial_number,
            pending = self.submitter.pending(),
            "experiment finished"
        );
        Ok(RunSummary {
            trials_completed: self.trial_number,
            position: self.position,
        })
    }

    /// Stops delivery and returns the number of undelivered response sets.
    pub fn close(self) -> usize {
        self.submitter.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TrialType;
    use crate::error::TransportError;
    use crate::navigation::Key;
    use crate::responses::{NEXT_PROC_INDEX, TRIAL_NUMBER};
    use crate::source::MemorySource;
    use crate::submission::{Backoff, DeliveryRequest, Transport};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[derive(Clone, Default)]
    struct Recorder {
        rows: Arc<Mutex<Vec<Row>>>,
    }

    impl Transport for Recorder {
        fn deliver(&mut self, request: &DeliveryRequest<'_>) -> Result<(), TransportError> {
            let mut rows = self.rows.lock().expect("lock");
            rows.extend(request.rows.iter().map(|r| (*r).clone()));
            Ok(())
        }
    }

    fn source() -> MemorySource {
        MemorySource::new()
            .with_document(
                "stimuli/words.csv",
                vec![row(&[("Cue", "sun")]), row(&[("Cue", "cat")])],
            )
            .with_document(
                "procedures/main.csv",
                vec![
                    row(&[("Trial Type", "instruct")]),
                    row(&[
                        ("Trial Type", "study"),
                        ("Stimuli", "2::3"),
                        ("Post 1 Trial Type", "recall"),
                    ]),
                    row(&[("Trial Type", "missing-type"), ("Stimuli", "9")]),
                ],
            )
    }

    fn catalog() -> TrialTypeCatalog {
        ["instruct", "study", "recall", END_OF_EXPERIMENT]
            .into_iter()
            .map(|name| (name, TrialType::with_display(format!("<p>{}</p>", name))))
            .collect()
    }

    fn participant() -> Participant {
        Participant {
            username: "ana".to_string(),
            id: "s1".to_string(),
            experiment: "Memory".to_string(),
        }
    }

    fn experiment(recorded: Vec<Row>, settings: Settings) -> (Experiment, Recorder) {
        let data = ExperimentData::load(
            &source(),
            Condition::new("main.csv", "words.csv"),
            Some("seed"),
            recorded,
        )
        .expect("load");
        let recorder = Recorder::default();
        let submitter = Submitter::spawn(recorder.clone(), participant(), Backoff::default());
        (
            Experiment::new(data, catalog(), participant(), settings, submitter),
            recorder,
        )
    }

    #[test]
    fn load_compiles_and_validates() {
        let (exp, _) = experiment(Vec::new(), Settings::default());
        assert_eq!(exp.data().procedure().len(), 4);
        assert_eq!(
            exp.used_trial_types(),
            vec!["instruct", "study", "recall", "missing-type"]
        );
        assert_eq!(exp.diagnostics().len(), 2);
        assert!(exp.diagnostics()[0].contains("\"missing-type\" does not exist"));
        assert!(exp.diagnostics()[1].contains("stimuli row 7 does not exist"));
        exp.close();
    }

    #[test]
    fn trial_values_resolve_stimuli_and_end_is_none() {
        let (exp, _) = experiment(Vec::new(), Settings::default());
        let study = exp.trial_values(1).expect("study");
        assert_eq!(study.procedure.trial_type(), Some("study"));
        let cues: Vec<&str> = study.stimuli.iter().map(|r| r["Cue"].as_str()).collect();
        assert_eq!(cues, vec!["sun", "cat"]);
        assert_eq!(exp.trial_values(3).expect("missing").stimuli.len(), 0);
        assert!(exp.trial_values(4).is_none());
        exp.close();
    }

    #[test]
    fn submissions_navigate_and_record() {
        let (mut exp, recorder) = experiment(Vec::new(), Settings::default());
        assert_eq!(exp.current_trial().trial_type, "instruct");

        assert_eq!(exp.receive_trial_submission(r#"{"Response": "ok"}"#).expect("t0"), 1);
        assert_eq!(
            exp.receive_trial_submission(r#"[{"Exp_Command": "mod proc index: r-1"}]"#)
                .expect("t1"),
            0
        );
        assert_eq!(exp.last_response_value(NEXT_PROC_INDEX), "0");
        assert_eq!(exp.last_response_value("Nope"), "");
        assert_eq!(
            exp.receive_trial_submission(r#"{"Exp_Command": "mod proc index: 99"}"#)
                .expect("t2"),
            4
        );
        assert!(exp.is_finished());
        let end = exp.current_trial();
        assert!(end.is_end());
        assert_eq!(end.trial_type, END_OF_EXPERIMENT);
        assert!(end.definition.is_some());

        assert!(exp
            .on_submissions_drained()
            .wait_timeout(Duration::from_secs(5)));
        let delivered = recorder.rows.lock().expect("lock").clone();
        let numbers: Vec<&str> = delivered.iter().map(|r| r[TRIAL_NUMBER].as_str()).collect();
        assert_eq!(numbers, vec!["0", "1", "2"]);
        assert_eq!(exp.close(), 0);
    }

    #[test]
    fn bad_command_aborts_transition() {
        let (mut exp, _) = experiment(Vec::new(), Settings::default());
        let err = exp
            .receive_trial_submission(r#"{"Exp_Command": "mod proc index:"}"#)
            .expect_err("syntax error");
        assert!(matches!(err, EngineError::Command(_)));
        assert_eq!(exp.position(), 0);
        assert_eq!(exp.trial_number(), 0);
        assert!(exp.data().responses().is_empty());
        exp.close();
    }

    #[test]
    fn resumes_from_recorded_responses() {
        let recorded = vec![row(&[
            ("Exp_Trial_Number", "4"),
            ("Exp_Proc_Index", "1"),
            ("Exp_Next_Proc_Index", "2"),
            ("Response", "cat"),
        ])];
        let (exp, _) = experiment(recorded, Settings::default());
        assert_eq!(exp.position(), 2);
        assert_eq!(exp.trial_number(), 5);
        assert_eq!(exp.last_response_value("Response"), "cat");
        assert_eq!(exp.last_response_values("Response"), vec![Some("cat")]);
        exp.close();
    }

    #[test]
    fn shortcuts_only_when_enabled() {
        let press = KeyPress {
            ctrl: true,
            alt: true,
            key: Key::ArrowLeft,
        };
        let (exp, _) = experiment(Vec::new(), Settings::default());
        assert_eq!(exp.shortcut_submission(press), None);
        exp.close();

        let settings = Settings {
            allow_keyboard_shortcuts_to_change_trial: true,
        };
        let (exp, _) = experiment(Vec::new(), settings);
        assert_eq!(
            exp.shortcut_submission(press).as_deref(),
            Some(r#"{"Exp_Command":"mod proc index: r-1"}"#)
        );
        exp.close();
    }
}
