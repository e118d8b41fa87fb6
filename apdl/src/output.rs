//! This module implements the response post-processing layer: scanning
//! solver text output for error banners, capturing their messages, and
//! classifying them into the error taxonomy. The scraping logic is fragile
//! by nature, so it all lives here, behind plain functions that take text
//! and return results -- no transport in sight.

use std::sync::LazyLock;

use log::warn;
use regex::Regex;

use crate::errors::ApdlError;

/// The literal banner the solver prints at the start of an error message.
pub const ERROR_HEADER: &str = "*** ERROR ***";

/// How many lines past a banner are considered when capturing its message.
/// Messages longer than this get truncated rather than risk runaway capture.
const ERROR_WINDOW: usize = 20;

/// Error banners matching any of these are known-benign solver complaints:
/// logged as warnings, never raised. The list is deliberately closed; it
/// mirrors exactly the conditions observed to be harmless in practice.
static PERMITTED_ERRORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
  return [
    r"(\*\*\* ERROR \*\*\*).*(?:[\r\n]+.*)+highly distorted",
    r"(\*\*\* ERROR \*\*\*).*[\r\n]+.*is turning inside out",
    r"(\*\*\* ERROR \*\*\*).*[\r\n]+.*distributed memory parallel solution does not support KRYLOV method"
  ].iter()
    .map(|p| Regex::new(p).expect("static regex must compile"))
    .collect();
});

/// Captures one error message out of a window of lines starting at a
/// banner: everything from the banner line up to the next banner-ish line
/// or a blank-line boundary, empty lines dropped.
fn capture_error_message(window: &[&str]) -> String {
  let mut captured: Vec<&str> = vec![window[0]];
  for line in &window[1..] {
    if line.trim().is_empty() || line.contains("***") {
      break;
    }
    captured.push(line);
  }
  return captured.join("\n");
}

/// Scans a response for error banners. The first banner whose captured
/// message matches no permitted pattern is raised as a solver error,
/// annotated with the instance name; permitted ones are logged at warning
/// level and scanning continues.
pub fn scan_output_errors(
  response: &str,
  instance: &str
) -> Result<(), ApdlError> {
  let lines: Vec<&str> = response.lines().collect();
  for (index, line) in lines.iter().enumerate() {
    if !line.contains(ERROR_HEADER) {
      continue;
    }
    let window_end = (index + ERROR_WINDOW).min(lines.len());
    let message = capture_error_message(&lines[index..window_end]);
    if PERMITTED_ERRORS.iter().any(|p| p.is_match(&message)) {
      warn!("permitted solver error: {}", message);
      continue;
    }
    return Err(ApdlError::Solver {
      instance: instance.to_string(),
      message
    });
  }
  return Ok(());
}

/// Classifies non-banner failure phrasings in a response into taxonomy
/// variants. These are conditions the solver reports conversationally
/// rather than through an error banner. Checks run against the response
/// flattened to one line, so phrasing split across a line break still hits.
pub fn classify_response(response: &str) -> Result<(), ApdlError> {
  let flat = response
    .lines()
    .map(str::trim)
    .collect::<Vec<&str>>()
    .join(" ");
  if flat.contains("unable to open file")
    || (flat.contains("unable to open") && flat.contains("file")) {
    return Err(ApdlError::FileNotFound(response.to_string()));
  }
  if flat.contains("is not a recognized") {
    let text = response.replace("This command will be ignored.", "");
    return Err(ApdlError::InvalidRoutine(text));
  }
  if flat.contains("command is ignored")
    || flat.contains("is not part of the currently active set.")
    || flat.contains("No nodes defined.") {
    return Err(ApdlError::CommandIgnored(response.to_string()));
  }
  return Ok(());
}
