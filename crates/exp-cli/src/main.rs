use anyhow::{anyhow, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use exp_runner::config::Condition;
use exp_runner::engine::TrialValues;
use exp_runner::navigation::COMMAND_FIELD;
use exp_runner::{
    responses_path, CsvDirectory, EngineError, Experiment, ExperimentConfig, ExperimentData,
    FileTransport, HttpTransport, Key, KeyPress, MirroredTransport, Participant, SessionRecord,
    Settings, Submitter, TrialRenderer, TrialTypeCatalog, TrialView, TRIAL_TYPES_DIR,
};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "exp", version = "0.3.0", about = "Experiment engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a participant session in the terminal.
    Run {
        experiment: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: Option<String>,
        /// Used on a participant's first run only.
        #[arg(long)]
        condition: Option<usize>,
        /// Used on a participant's first run only.
        #[arg(long)]
        seed: Option<String>,
        #[arg(long, default_value_t = 60)]
        drain_timeout_seconds: u64,
        #[arg(long)]
        json: bool,
    },
    Validate {
        experiment: PathBuf,
        #[arg(long, default_value_t = 0)]
        condition: usize,
        #[arg(long)]
        json: bool,
    },
    Describe {
        experiment: PathBuf,
        #[arg(long, default_value_t = 0)]
        condition: usize,
        #[arg(long)]
        seed: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("exp=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            user,
            id,
            condition,
            seed,
            drain_timeout_seconds,
            json,
        } => {
            let config = ExperimentConfig::load(&experiment)?;
            let participant = Participant {
                username: user,
                id: id.unwrap_or_else(|| Local::now().format("%Y%m%d%H%M%S").to_string()),
                experiment: config.title.clone(),
            };
            let record = SessionRecord::open(&experiment, &participant, condition, seed.as_deref())?;
            let data = ExperimentData::load(
                &CsvDirectory::new(&experiment),
                config.condition(record.condition_index)?.clone(),
                Some(&record.shuffle_seed),
                record.recorded_rows(&experiment, &participant.username)?,
            )?;
            let catalog = TrialTypeCatalog::load(&experiment.join(TRIAL_TYPES_DIR))?;
            let local = FileTransport::new(responses_path(&experiment, &participant));
            let submitter = match &config.submit_url {
                Some(url) => {
                    info!(
                        url = %url,
                        mirror = %local.path().display(),
                        "submitting responses over HTTP"
                    );
                    Submitter::spawn(
                        MirroredTransport::new(
                            HttpTransport::new(url.as_str(), config.request_timeout())?,
                            local,
                        ),
                        participant.clone(),
                        config.backoff(),
                    )
                }
                None => {
                    info!(path = %local.path().display(), "recording responses locally");
                    Submitter::spawn(local, participant.clone(), config.backoff())
                }
            };
            let settings = Settings {
                allow_keyboard_shortcuts_to_change_trial: config
                    .allow_keyboard_shortcuts_to_change_trial,
            };
            let mut session = Experiment::new(data, catalog, participant.clone(), settings, submitter);
            let integrity_errors = session.diagnostics().len();
            if integrity_errors > 0 {
                warn!(
                    count = integrity_errors,
                    "running despite procedure errors; see `exp validate` for details"
                );
            }

            let out: Box<dyn Write> = if json {
                Box::new(io::stderr())
            } else {
                Box::new(io::stdout())
            };
            let stdin = io::stdin();
            let mut renderer = TerminalRenderer {
                input: stdin.lock(),
                out,
                settings,
            };
            let outcome = session.begin(&mut renderer);

            // Sets from an interrupted run still get their chance to be delivered.
            let drained = session
                .on_submissions_drained()
                .wait_timeout(Duration::from_secs(drain_timeout_seconds));
            if !drained {
                warn!(
                    timeout_secs = drain_timeout_seconds,
                    "gave up waiting for response delivery"
                );
            }
            let undelivered = session.close();
            let summary = outcome?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "participant": participant,
                    "condition": record.condition_index,
                    "seed": record.shuffle_seed,
                    "trials_completed": summary.trials_completed,
                    "position": summary.position,
                    "integrity_errors": integrity_errors,
                    "undelivered": undelivered,
                })));
            }
            println!("trials_completed: {}", summary.trials_completed);
            if undelivered > 0 {
                println!("undelivered_response_sets: {}", undelivered);
            }
            Ok(None)
        }
        Commands::Validate {
            experiment,
            condition,
            json,
        } => {
            let loaded = load_for_inspection(&experiment, condition, None)?;
            let errors = exp_runner::validator::validate(
                loaded.data.procedure(),
                &loaded.catalog,
                loaded.data.stimuli(),
            );
            if json {
                return Ok(Some(json!({
                    "ok": errors.is_empty(),
                    "command": "validate",
                    "procedure": loaded.condition.get("Procedure"),
                    "errors": errors,
                })));
            }
            if errors.is_empty() {
                println!("ok: procedure is consistent");
                return Ok(None);
            }
            for error in &errors {
                println!("{}", error);
            }
            Err(anyhow!("{} integrity error(s)", errors.len()))
        }
        Commands::Describe {
            experiment,
            condition,
            seed,
            json,
        } => {
            let loaded = load_for_inspection(&experiment, condition, seed.as_deref())?;
            let procedure = loaded.data.procedure();
            let used = procedure.used_trial_types();
            let missing: Vec<&str> = used
                .iter()
                .copied()
                .filter(|name| !loaded.catalog.contains(name))
                .collect();
            if json {
                let trials: Vec<Value> = procedure
                    .iter()
                    .enumerate()
                    .map(|(position, trial)| {
                        json!({
                            "position": position,
                            "trial_type": trial.trial_type(),
                            "row": trial.row_number(),
                            "post_level": trial.post_level(),
                            "stimuli": trial.stimuli(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "title": loaded.title,
                    "condition": condition_to_json(&loaded.condition),
                    "stimuli_rows": loaded.data.stimuli().len(),
                    "trials": trials,
                    "used_trial_types": used,
                    "missing_trial_types": missing,
                })));
            }
            println!("title: {}", loaded.title);
            println!("condition: {}", condition_to_json(&loaded.condition));
            println!("stimuli_rows: {}", loaded.data.stimuli().len());
            println!("trials: {}", procedure.len());
            for (position, trial) in procedure.iter().enumerate() {
                println!(
                    "  {:>3}  row {:<4} {}{}",
                    position,
                    trial.row_number(),
                    trial.column_prefix(),
                    trial.trial_type().unwrap_or_default()
                );
            }
            println!("used_trial_types: {}", used.join(", "));
            if !missing.is_empty() {
                println!("missing_trial_types: {}", missing.join(", "));
            }
            Ok(None)
        }
    }
}

struct Inspection {
    title: String,
    condition: Condition,
    data: ExperimentData,
    catalog: TrialTypeCatalog,
}

fn load_for_inspection(experiment: &Path, condition: usize, seed: Option<&str>) -> Result<Inspection> {
    let config = ExperimentConfig::load(experiment)?;
    let condition = config.condition(condition)?.clone();
    let data = ExperimentData::load(
        &CsvDirectory::new(experiment),
        condition.clone(),
        seed,
        Vec::new(),
    )?;
    let catalog = TrialTypeCatalog::load(&experiment.join(TRIAL_TYPES_DIR))?;
    Ok(Inspection {
        title: config.title,
        condition,
        data,
        catalog,
    })
}

fn condition_to_json(condition: &Condition) -> Value {
    json!({
        "procedure": condition.get("Procedure"),
        "stimuli": condition.get("Stimuli"),
    })
}

/// Line-oriented renderer: each input line answers one trial.
///
/// `:back` and `:next` act like the experimenter shortcuts, `:jump N` moves to
/// procedure position N. Everything else is recorded as the `Response` column.
struct TerminalRenderer<R> {
    input: R,
    out: Box<dyn Write>,
    settings: Settings,
}

impl<R: BufRead> TerminalRenderer<R> {
    fn write_trial(&mut self, trial: &TrialView<'_>) -> io::Result<()> {
        writeln!(
            self.out,
            "\n[trial {} | position {}] {}",
            trial.trial_number, trial.position, trial.trial_type
        )?;
        if let Some(definition) = trial.definition {
            writeln!(self.out, "{}", definition.display.trim())?;
        }
        if let Some(TrialValues { procedure, stimuli }) = &trial.values {
            for (column, value) in procedure.columns() {
                if !value.is_empty() {
                    writeln!(self.out, "  {}: {}", column, value)?;
                }
            }
            for (i, row) in stimuli.iter().enumerate() {
                let cells: Vec<String> = row.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                writeln!(self.out, "  stimulus {}: {}", i + 1, cells.join(", "))?;
            }
        }
        write!(self.out, "> ")?;
        self.out.flush()
    }

    fn submission_for(&self, line: &str) -> Option<String> {
        let shortcut = |key| {
            self.settings.shortcut_submission(KeyPress {
                ctrl: true,
                alt: true,
                key,
            })
        };
        match line {
            ":back" => shortcut(Key::ArrowLeft),
            ":next" => shortcut(Key::ArrowRight),
            _ => {
                if !self.settings.allow_keyboard_shortcuts_to_change_trial {
                    return None;
                }
                let target: i64 = line.strip_prefix(":jump ")?.trim().parse().ok()?;
                Some(
                    json!({ COMMAND_FIELD: format!("mod proc index: {}", target) }).to_string(),
                )
            }
        }
    }
}

impl<R: BufRead> TrialRenderer for TerminalRenderer<R> {
    fn present(&mut self, trial: &TrialView<'_>) -> Result<String, EngineError> {
        self.write_trial(trial)
            .map_err(|e| EngineError::Render(e.to_string()))?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .map_err(|e| EngineError::Render(e.to_string()))?;
        if read == 0 {
            return Err(EngineError::Render("input closed before the experiment ended".to_string()));
        }
        let line = line.trim();
        Ok(self
            .submission_for(line)
            .unwrap_or_else(|| json!({ "Response": line }).to_string()))
    }

    fn finish(&mut self, trial: &TrialView<'_>) -> Result<(), EngineError> {
        let message = trial
            .definition
            .map(|definition| definition.display.trim().to_string())
            .unwrap_or_else(|| "The experiment is complete. Thank you!".to_string());
        writeln!(self.out, "\n{}", message).map_err(|e| EngineError::Render(e.to_string()))
    }
}

/// Printed when a result cannot be encoded; keeps `--json` output parseable.
const ENCODE_FAILURE: &str =
    r#"{"ok":false,"error":{"code":"encode_failed","message":"exp could not encode its result as JSON","details":{}}}"#;

fn emit_json(value: &Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|_| ENCODE_FAILURE.to_string());
    println!("{}", line);
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}
