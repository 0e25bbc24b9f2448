use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::SourceError;

/// Trial type rendered when the position reaches the end of the procedure.
pub const END_OF_EXPERIMENT: &str = "end-of-experiment";

const DISPLAY_FILE: &str = "display.html";
const SCRIPT_FILE: &str = "script.js";
const STYLE_FILE: &str = "style.css";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrialType {
    pub display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl TrialType {
    pub fn with_display(display: impl Into<String>) -> Self {
        Self {
            display: display.into(),
            ..Self::default()
        }
    }
}

/// Registered trial types by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TrialTypeCatalog {
    types: BTreeMap<String, TrialType>,
}

impl TrialTypeCatalog {
    /// Loads every sub-directory of `dir` that has a `display.html`.
    pub fn load(dir: &Path) -> Result<Self, SourceError> {
        let io_err = |path: &Path, source: std::io::Error| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut catalog = Self::default();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                SourceError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let type_dir = entry.path();
            let display_path = type_dir.join(DISPLAY_FILE);
            if !display_path.is_file() {
                continue;
            }
            let read_optional = |name: &str| -> Result<Option<String>, SourceError> {
                let path = type_dir.join(name);
                if !path.is_file() {
                    return Ok(None);
                }
                fs::read_to_string(&path)
                    .map(Some)
                    .map_err(|source| io_err(&path, source))
            };
            let trial_type = TrialType {
                display: fs::read_to_string(&display_path)
                    .map_err(|source| io_err(&display_path, source))?,
                script: read_optional(SCRIPT_FILE)?,
                style: read_optional(STYLE_FILE)?,
            };
            let name = entry.file_name().to_string_lossy().to_string();
            catalog.types.insert(name, trial_type);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, name: impl Into<String>, trial_type: TrialType) {
        self.types.insert(name.into(), trial_type);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&TrialType> {
        self.types.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, TrialType)> for TrialTypeCatalog {
    fn from_iter<I: IntoIterator<Item = (S, TrialType)>>(iter: I) -> Self {
        Self {
            types: iter
                .into_iter()
                .map(|(name, trial_type)| (name.into(), trial_type))
                .collect(),
        }
    }
}
