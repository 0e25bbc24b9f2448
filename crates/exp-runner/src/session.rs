//! Per-participant session record kept in `data/<user>/session.json`.
//!
//! The record pins the condition and shuffle seed chosen on the first run and
//! lists every session id the participant has used, so a later run resumes
//! the same procedure in the same order no matter which flags it was given.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::SessionError;
use crate::responses::Participant;
use crate::submission::FileTransport;
use crate::{participant_dir, responses_file, Row};

pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub condition_index: usize,
    pub shuffle_seed: String,
    pub ids: Vec<String>,
}

impl SessionRecord {
    pub fn path(experiment_dir: &Path, username: &str) -> PathBuf {
        participant_dir(experiment_dir, username).join(SESSION_FILE)
    }

    pub fn load(experiment_dir: &Path, username: &str) -> Result<Option<Self>, SessionError> {
        let path = Self::path(experiment_dir, username);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;
        let record = serde_json::from_str(&raw).map_err(|source| SessionError::Json {
            path: path.clone(),
            source,
        })?;
        Ok(Some(record))
    }

    pub fn save(&self, experiment_dir: &Path, username: &str) -> Result<(), SessionError> {
        let path = Self::path(experiment_dir, username);
        let io_err = |source: std::io::Error| SessionError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| SessionError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_file_name(format!(
            ".{}.tmp.{}.{}",
            SESSION_FILE,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    /// Loads the participant's record, or creates one from the requested
    /// condition and seed. An existing record wins over the request; the
    /// participant's id is added to it when new.
    pub fn open(
        experiment_dir: &Path,
        participant: &Participant,
        condition_index: Option<usize>,
        shuffle_seed: Option<&str>,
    ) -> Result<Self, SessionError> {
        let username = participant.username.as_str();
        let Some(mut record) = Self::load(experiment_dir, username)? else {
            let record = Self {
                condition_index: condition_index.unwrap_or(0),
                shuffle_seed: shuffle_seed
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}-{}", username, participant.id)),
                ids: vec![participant.id.clone()],
            };
            record.save(experiment_dir, username)?;
            info!(
                participant = %username,
                condition = record.condition_index,
                seed = %record.shuffle_seed,
                "session record created"
            );
            return Ok(record);
        };

        if condition_index.is_some_and(|c| c != record.condition_index) {
            warn!(
                participant = %username,
                requested = ?condition_index,
                recorded = record.condition_index,
                "ignoring requested condition, participant already has one"
            );
        }
        if shuffle_seed.is_some_and(|s| s != record.shuffle_seed) {
            warn!(
                participant = %username,
                recorded = %record.shuffle_seed,
                "ignoring requested shuffle seed, participant already has one"
            );
        }
        if !record.ids.contains(&participant.id) {
            record.ids.push(participant.id.clone());
            record.save(experiment_dir, username)?;
        }
        Ok(record)
    }

    /// Response rows recorded under every id of this participant.
    pub fn recorded_rows(&self, experiment_dir: &Path, username: &str) -> Result<Vec<Row>, SessionError> {
        let mut rows = Vec::new();
        for id in &self.ids {
            rows.extend(FileTransport::read_rows(&responses_file(
                experiment_dir,
                username,
                id,
            ))?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responses::{ResponseSet, Transition};
    use crate::responses_path;
    use crate::submission::{DeliveryRequest, Transport};
    use serde_json::{Map, Value};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "exp_session_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn participant(id: &str) -> Participant {
        Participant {
            username: "ana".to_string(),
            id: id.to_string(),
            experiment: "Memory".to_string(),
        }
    }

    fn record_trial(dir: &Path, participant: &Participant, trial_number: usize) {
        let mut row = Map::new();
        row.insert("Response".to_string(), Value::from(format!("t{}", trial_number)));
        let set = ResponseSet::finalize(
            vec![row],
            Transition {
                trial_number,
                position: trial_number,
                next_position: trial_number + 1,
            },
            participant,
        );
        let request = DeliveryRequest {
            participant,
            rows: set.rows().iter().collect(),
        };
        FileTransport::new(responses_path(dir, participant))
            .deliver(&request)
            .expect("deliver");
    }

    #[test]
    fn first_open_records_requested_condition_and_seed() {
        let dir = temp_dir("first");
        let record = SessionRecord::open(&dir, &participant("s1"), Some(1), None).expect("open");
        assert_eq!(record.condition_index, 1);
        assert_eq!(record.shuffle_seed, "ana-s1");
        assert_eq!(record.ids, vec!["s1"]);
        assert_eq!(
            SessionRecord::load(&dir, "ana").expect("load"),
            Some(record)
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reopening_keeps_recorded_choices_over_new_flags() {
        let dir = temp_dir("mismatch");
        SessionRecord::open(&dir, &participant("s1"), Some(0), Some("first")).expect("open");
        let again =
            SessionRecord::open(&dir, &participant("s1"), Some(2), Some("second")).expect("reopen");
        assert_eq!(again.condition_index, 0);
        assert_eq!(again.shuffle_seed, "first");
        assert_eq!(again.ids, vec!["s1"]);

        let next = SessionRecord::open(&dir, &participant("s2"), None, None).expect("new id");
        assert_eq!(next.ids, vec!["s1", "s2"]);
        assert_eq!(next.shuffle_seed, "first");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn recorded_rows_span_every_session_id() {
        let dir = temp_dir("merge");
        let first = participant("s1");
        let second = participant("s2");
        SessionRecord::open(&dir, &first, None, None).expect("open");
        record_trial(&dir, &first, 0);
        let record = SessionRecord::open(&dir, &second, None, None).expect("open");
        record_trial(&dir, &second, 1);

        let rows = record.recorded_rows(&dir, "ana").expect("rows");
        let responses: Vec<&str> = rows.iter().map(|r| r["Response"].as_str()).collect();
        assert_eq!(responses, vec!["t0", "t1"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_record_is_reported() {
        let dir = temp_dir("bad");
        let path = SessionRecord::path(&dir, "ana");
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            SessionRecord::load(&dir, "ana"),
            Err(SessionError::Json { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }
}
