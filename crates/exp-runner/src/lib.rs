use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod navigation;
pub mod procedure;
pub mod responses;
pub mod session;
pub mod source;
pub mod submission;
pub mod validator;

/// One spreadsheet row keyed by column header.
pub type Row = BTreeMap<String, String>;

pub use catalog::{TrialType, TrialTypeCatalog, END_OF_EXPERIMENT};
pub use config::{Condition, ExperimentConfig};
pub use engine::{Experiment, ExperimentData, RunSummary, Settings, TrialRenderer, TrialView};
pub use error::{EngineError, SessionError, SourceError, TransportError};
pub use navigation::{Key, KeyPress};
pub use procedure::{Procedure, TrialDescriptor};
pub use responses::{Participant, ResponseSet};
pub use session::SessionRecord;
pub use source::{CsvDirectory, MemorySource, TabularSource};
pub use submission::{Backoff, FileTransport, HttpTransport, MirroredTransport, Submitter, Transport};

pub const DATA_DIR: &str = "data";
pub const TRIAL_TYPES_DIR: &str = "trial-types";

pub fn participant_dir(experiment_dir: &Path, username: &str) -> PathBuf {
    experiment_dir.join(DATA_DIR).join(username)
}

/// Local record of one session id: `data/<user>/<id>-responses.jsonl`.
pub fn responses_file(experiment_dir: &Path, username: &str, id: &str) -> PathBuf {
    participant_dir(experiment_dir, username).join(format!("{}-responses.jsonl", id))
}

pub fn responses_path(experiment_dir: &Path, participant: &Participant) -> PathBuf {
    responses_file(experiment_dir, &participant.username, &participant.id)
}
