use std::path::PathBuf;
use thiserror::Error;

/// Malformed `mod proc index` navigation command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandSyntaxError {
    #[error(
        "the command 'mod proc index' must be in the format 'mod proc index: X', \
         where X is the value to use, such as 'r-1' (received \"{command}\")"
    )]
    MissingArgument { command: String },
    #[error(
        "the command 'mod proc index' was given an invalid input; it may start with 'r' \
         but must otherwise be a whole number, optionally negative, such as '2', '-1', \
         'r4' or 'r-1' (received \"{command}\")"
    )]
    BadNumber { command: String },
}

impl CommandSyntaxError {
    pub fn command(&self) -> &str {
        match self {
            CommandSyntaxError::MissingArgument { command }
            | CommandSyntaxError::BadNumber { command } => command,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown document '{0}'")]
    UnknownDocument(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed record in {path} line {line}: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Any non-success outcome of a single delivery attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected submission (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode responses: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The per-participant session record could not be read or written.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed session record {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Responses(#[from] SourceError),
}

/// Recorded response rows that cannot be used to resume a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("recorded response is missing the '{field}' column")]
    MissingField { field: &'static str },
    #[error("recorded response has non-numeric '{field}' value \"{value}\"")]
    BadNumber { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CommandSyntaxError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("condition is missing the '{0}' column")]
    Condition(&'static str),
    #[error("trial submission is not valid JSON: {0}")]
    Submission(#[source] serde_json::Error),
    #[error("trial submission must be an object or an array of objects")]
    SubmissionShape,
    #[error("renderer failed: {0}")]
    Render(String),
}
