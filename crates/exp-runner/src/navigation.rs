use tracing::debug;

use crate::error::CommandSyntaxError;

/// Response column carrying navigation commands.
pub const COMMAND_FIELD: &str = "Exp_Command";

const MOD_PROC_INDEX: &str = "mod proc index";
const SUBMIT_TRIAL: &str = "submit trial";
const PREVIOUS_TRIAL: &str = "mod proc index: r-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavCommand {
    Advance,
    Relative(i64),
    Absolute(i64),
}

impl NavCommand {
    /// Unrecognised commands advance by one.
    pub fn parse(command: Option<&str>) -> Result<Self, CommandSyntaxError> {
        match command {
            Some(command) if command.starts_with(MOD_PROC_INDEX) => parse_mod_proc_index(command),
            _ => Ok(NavCommand::Advance),
        }
    }

    pub fn target(self, current: usize, length: usize) -> usize {
        let current = i64::try_from(current).unwrap_or(i64::MAX);
        let next = match self {
            NavCommand::Advance => current.saturating_add(1),
            NavCommand::Relative(offset) => current.saturating_add(offset),
            NavCommand::Absolute(index) => index,
        };
        clamp(next, length)
    }
}

/// The argument is the text between the first and second colon.
fn parse_mod_proc_index(command: &str) -> Result<NavCommand, CommandSyntaxError> {
    let Some(argument) = command.split(':').nth(1) else {
        return Err(CommandSyntaxError::MissingArgument {
            command: command.to_string(),
        });
    };
    let argument = argument.trim();
    if argument.is_empty() {
        return Err(CommandSyntaxError::MissingArgument {
            command: command.to_string(),
        });
    }
    let (relative, number) = match argument.strip_prefix('r') {
        Some(rest) => (true, rest.trim()),
        None => (false, argument),
    };
    let value = number
        .parse::<i64>()
        .map_err(|_| CommandSyntaxError::BadNumber {
            command: command.to_string(),
        })?;
    Ok(if relative {
        NavCommand::Relative(value)
    } else {
        NavCommand::Absolute(value)
    })
}

fn clamp(next: i64, length: usize) -> usize {
    if next <= 0 {
        return 0;
    }
    usize::try_from(next).map_or(length, |next| next.min(length))
}

/// Computes the position after `current`, clamped to `[0, length]`.
pub fn advance(
    current: usize,
    command: Option<&str>,
    length: usize,
) -> Result<usize, CommandSyntaxError> {
    let parsed = NavCommand::parse(command)?;
    let next = parsed.target(current, length);
    debug!(current, next, length, command = ?parsed, "navigation transition");
    Ok(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    ArrowLeft,
    ArrowRight,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub ctrl: bool,
    pub alt: bool,
    pub key: Key,
}

/// Experimenter shortcut bound to Ctrl+Alt+arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    NextTrial,
    PreviousTrial,
}

impl Shortcut {
    pub fn from_key(press: KeyPress) -> Option<Self> {
        if !(press.ctrl && press.alt) {
            return None;
        }
        match press.key {
            Key::ArrowRight => Some(Shortcut::NextTrial),
            Key::ArrowLeft => Some(Shortcut::PreviousTrial),
            Key::Other => None,
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            Shortcut::NextTrial => SUBMIT_TRIAL,
            Shortcut::PreviousTrial => PREVIOUS_TRIAL,
        }
    }
}
