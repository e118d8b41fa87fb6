//! This module implements small helpers that don't warrant modules of their
//! own: random suffixes for temporary names and short-command extraction.

use uuid::Uuid;

/// Returns a random lowercase-hex string of the given length (at most 32),
/// for temporary file and component names.
pub(crate) fn random_string(len: usize) -> String {
  let s = Uuid::new_v4().simple().to_string();
  return s[..len.min(s.len())].to_string();
}

/// Takes any solver command and returns its short form: the first field,
/// truncated to four characters and upcased. This is how the solver itself
/// abbreviates command names.
///
/// ```
/// # use apdl::util::parse_to_short_cmd;
/// assert_eq!(parse_to_short_cmd("K,,1,0,0,"), "K");
/// assert_eq!(parse_to_short_cmd("VPLOT, ALL"), "VPLO");
/// ```
pub fn parse_to_short_cmd(command: &str) -> String {
  let field = command.split(',').next().unwrap_or("");
  return field.chars().take(4).collect::<String>().to_uppercase();
}
