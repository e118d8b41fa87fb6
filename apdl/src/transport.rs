//! This module defines the boundary between the session logic and whatever
//! actually carries bytes to a running solver instance (a piped console
//! process, a socket, anything with request/response semantics).

use std::path::Path;

use crate::errors::ApdlError;

/// How a session talks to a live solver. Every round trip is synchronous
/// and blocking; the solver executes commands strictly in the order they
/// are handed to it.
pub trait Transport {
  /// Sends a single command and returns the raw response text. `mute` is a
  /// hint that the caller will discard the response; transports may use it
  /// to skip output collection, or ignore it entirely.
  fn run_command(&mut self, command: &str, mute: bool)
    -> Result<String, ApdlError>;

  /// Has the solver execute an input script and returns the immediate
  /// console response (not the redirected output, which the session reads
  /// back itself). The path is local; remote transports ship it over first.
  fn input_file(&mut self, path: &Path) -> Result<String, ApdlError>;

  /// Reads a text file back from the solver's working storage.
  fn read_file(&mut self, path: &Path) -> Result<String, ApdlError>;

  /// Makes a local file available to the solver under its base name. A
  /// no-op for transports sharing a filesystem with the solver.
  fn upload(&mut self, path: &Path) -> Result<(), ApdlError>;

  /// The directory the solver resolves relative filenames against.
  fn directory(&self) -> std::path::PathBuf;

  /// Whether the solver shares a filesystem with this process.
  fn is_local(&self) -> bool;

  /// Whether the solver runs in distributed-memory mode. Chained commands
  /// are refused up front when it does.
  fn is_distributed(&self) -> bool;

  /// A name identifying this instance, quoted in raised solver errors.
  fn name(&self) -> &str;
}
