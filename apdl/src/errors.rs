//! This module defines the error taxonomy for the client: local validation
//! failures, solver-reported errors scraped from response text, and
//! transport-level failures.

use core::fmt::Display;
use std::error::Error;
use std::io;

/// One-line hint appended to solver-reported conditions that can be
/// suppressed instead of raised.
pub(crate) const SUPPRESS_HINT: &str =
  "(set ignore_errors on the session to suppress these)";

/// Everything that can go wrong while driving a solver session.
#[derive(Debug)]
#[non_exhaustive]
pub enum ApdlError {
  /// The command is known to be unsupported in interactive mode. Raised
  /// locally, before any round trip. Carries a remediation hint.
  InvalidCommand {
    /// The offending command text.
    command: String,
    /// How to work around the restriction.
    hint: &'static str
  },
  /// A multi-line string was passed where a single command was expected.
  MultilineCommand,
  /// An empty string was passed as a command.
  EmptyCommand,
  /// A buffering scope was entered while another one was active.
  NestedBatch,
  /// Chained commands were requested while the solver runs in
  /// distributed-memory mode, which cannot handle condensed input.
  DistributedChaining,
  /// The solver response contained an error banner that did not match any
  /// permitted pattern.
  Solver {
    /// Name of the solver instance that produced the error.
    instance: String,
    /// The captured error message, banner included.
    message: String
  },
  /// The solver reported it could not open a file.
  FileNotFound(String),
  /// The solver reported the command is not recognized in the currently
  /// active routine.
  InvalidRoutine(String),
  /// The solver reported it ignored the command.
  CommandIgnored(String),
  /// A parameter name failed local validation.
  ParameterName(String),
  /// A parameter value was rejected locally (bad type, embedded spaces,
  /// over-long string, that sort of thing).
  ParameterValue(String),
  /// The solver has no parameter under the requested name.
  MissingParameter(String),
  /// An array read-back could not be parsed out of the response text.
  ArrayParse(String),
  /// A value the session expected in the response text was absent.
  MissingValue(String),
  /// The transport layer failed to complete a round trip.
  Transport(String),
  /// An I/O error while staging temporary files.
  Io(io::Error)
}

impl Display for ApdlError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return match self {
      ApdlError::InvalidCommand { command, hint } => write!(
        f,
        "invalid interactive command \"{}\": {}",
        command,
        hint
      ),
      ApdlError::MultilineCommand => write!(
        f,
        "run() takes a single command; use a non-interactive batch for \
        multi-line input"
      ),
      ApdlError::EmptyCommand => write!(f, "cannot run an empty command"),
      ApdlError::NestedBatch => write!(
        f,
        "a command-buffering scope is already active; batches cannot nest"
      ),
      ApdlError::DistributedChaining => write!(
        f,
        "chained commands are not permitted when the solver runs in \
        distributed-memory mode"
      ),
      ApdlError::Solver { instance, message } => write!(
        f,
        "error in solver instance {}:\n{}",
        instance,
        message
      ),
      ApdlError::FileNotFound(text) => write!(
        f,
        "solver could not open a file:\n{}\n{}",
        text,
        SUPPRESS_HINT
      ),
      ApdlError::InvalidRoutine(text) => write!(
        f,
        "command not valid in the active routine:\n{}\n{}",
        text,
        SUPPRESS_HINT
      ),
      ApdlError::CommandIgnored(text) => write!(
        f,
        "solver ignored the command:\n{}\n{}",
        text,
        SUPPRESS_HINT
      ),
      ApdlError::ParameterName(msg) => write!(
        f,
        "invalid parameter name: {}",
        msg
      ),
      ApdlError::ParameterValue(msg) => write!(
        f,
        "invalid parameter value: {}",
        msg
      ),
      ApdlError::MissingParameter(name) => write!(
        f,
        "no parameter named \"{}\" in the solver",
        name
      ),
      ApdlError::ArrayParse(msg) => write!(
        f,
        "could not parse array from solver output: {}",
        msg
      ),
      ApdlError::MissingValue(what) => write!(
        f,
        "solver response did not contain {}",
        what
      ),
      ApdlError::Transport(msg) => write!(f, "transport failure: {}", msg),
      ApdlError::Io(e) => write!(f, "i/o error: {}", e)
    };
  }
}

impl Error for ApdlError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    return match self {
      ApdlError::Io(e) => Some(e),
      _ => None
    };
  }
}

impl From<io::Error> for ApdlError {
  fn from(e: io::Error) -> Self {
    return Self::Io(e);
  }
}
