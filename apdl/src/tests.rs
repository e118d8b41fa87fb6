use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ApdlError;
use crate::output::{classify_response, scan_output_errors};
use crate::params::{
  ApdlArray, ParamInfo, ParamValue, check_parameter_name, interp_star_status
};
use crate::session::{Routine, Session, SessionConfig};
use crate::transport::Transport;

/// What the fake solver says when a plot command runs with no device.
const DEVICE_UNSET_MSG: &str =
  "Display device has not yet been specified with the /SHOW command";

/// A parameter as stored by the fake solver.
#[derive(Clone, Debug)]
enum FakeParam {
  Scalar(f64),
  Character(String),
  Array(ApdlArray)
}

/// An in-process stand-in for a solver: executes the handful of directives
/// the session core actually emits (parameter store, array dump/read,
/// routine switching, output redirection) and records everything sent.
struct FakeSolver {
  /// Stands in for the solver's working directory.
  dir: tempfile::TempDir,
  /// Every command that reached the wire, scripts included, in order.
  sent: Vec<String>,
  /// The command lines of each flushed input script, in order.
  scripts: Vec<Vec<String>>,
  /// Files handed to upload().
  uploads: Vec<PathBuf>,
  /// The parameter store.
  params: BTreeMap<String, FakeParam>,
  /// Exact-command response overrides.
  canned: BTreeMap<String, String>,
  /// Name of an array awaiting its *MWRITE format line.
  pending_mwrite: Option<String>,
  /// Array name and staging file awaiting a *VREAD format line.
  pending_vread: Option<(String, String)>,
  /// Whether /SHOW has configured a display device.
  device_set: bool,
  /// The active routine code.
  routine: u32,
  /// Reported distributed-memory mode.
  distributed: bool
}

impl FakeSolver {
  fn new() -> Self {
    return Self {
      dir: tempfile::tempdir().unwrap(),
      sent: Vec::new(),
      scripts: Vec::new(),
      uploads: Vec::new(),
      params: BTreeMap::new(),
      canned: BTreeMap::new(),
      pending_mwrite: None,
      pending_vread: None,
      device_set: false,
      routine: 0,
      distributed: false
    };
  }

  /// Executes one wire-level command, splitting chained ones.
  fn execute(&mut self, command: &str) -> String {
    self.sent.push(command.to_string());
    if let Some(r) = self.canned.get(command) {
      return r.clone();
    }
    if command.contains('$') && !command.to_uppercase().starts_with("/COM") {
      return command
        .split('$')
        .map(|c| self.execute_single(c))
        .collect::<Vec<String>>()
        .join("\n");
    }
    return self.execute_single(command);
  }

  /// Executes one directive.
  fn execute_single(&mut self, command: &str) -> String {
    let command = command.trim();
    let up = command.to_uppercase();
    // a bare format line completes a pending *MWRITE or *VREAD
    if up.starts_with('(') {
      if let Some(name) = self.pending_mwrite.take() {
        return self.mwrite_dump(&name, command);
      }
      if let Some((name, file)) = self.pending_vread.take() {
        self.vread_fill(&name, &file);
        return String::new();
      }
      return String::new();
    }
    if up.starts_with("/SHOW") {
      self.device_set = true;
      return String::new();
    }
    const PLOTS: [&str; 8] = [
      "NPLO", "EPLO", "KPLO", "LPLO", "APLO", "VPLO", "PLNS", "PLES"
    ];
    if PLOTS.iter().any(|p| up.starts_with(p)) {
      if !self.device_set {
        return DEVICE_UNSET_MSG.to_string();
      }
      return "PLOT COMPLETE".to_string();
    }
    if up.starts_with("*SET,") {
      let parts: Vec<&str> = command.splitn(3, ',').collect();
      let name = parts[1].trim().to_uppercase();
      if parts.len() < 3 || parts[2].trim().is_empty() {
        self.params.remove(&name);
      } else {
        let lit = parts[2].trim();
        if lit.starts_with('\'') {
          let value = lit.trim_matches('\'').to_string();
          self.params.insert(name, FakeParam::Character(value));
        } else {
          let value = lit.parse::<f64>().unwrap_or(0.0);
          self.params.insert(name, FakeParam::Scalar(value));
        }
      }
      return String::new();
    }
    if up.starts_with("*DIM,") {
      let parts: Vec<&str> = command.split(',').collect();
      let name = parts[1].trim().to_uppercase();
      let dim = |ix: usize| -> usize {
        parts.get(ix).and_then(|t| t.trim().parse().ok()).unwrap_or(1)
      };
      let shape = (dim(3), dim(4), dim(5));
      let zeros = vec![0.0; shape.0 * shape.1 * shape.2];
      let arr = ApdlArray::from_values(shape, zeros).unwrap();
      self.params.insert(name, FakeParam::Array(arr));
      return String::new();
    }
    if up.starts_with("*VREAD,") {
      let parts: Vec<&str> = command.split(',').collect();
      let target = parts[1].trim();
      let name = target[..target.find('(').unwrap_or(target.len())]
        .to_uppercase();
      // commas inside the target's index parentheses shift the file field
      let mut file_ix = 2;
      if target.contains('(') && !target.contains(')') {
        while file_ix < parts.len() && !parts[file_ix - 1].contains(')') {
          file_ix += 1;
        }
      }
      let file = parts[file_ix].trim().to_string();
      self.pending_vread = Some((name, file));
      return String::new();
    }
    if up.starts_with("*MWRITE,") {
      let parts: Vec<&str> = command.split(',').collect();
      self.pending_mwrite = Some(parts[1].trim().to_uppercase());
      return String::new();
    }
    if up.starts_with("*STATUS") {
      let filter = command
        .split(',')
        .nth(1)
        .map(|s| s.trim().to_uppercase());
      return self.status_listing(filter.as_deref());
    }
    if up.starts_with("*GET,") && up.contains("ACTIVE") && up.contains("ROUT") {
      return format!("VALUE= {}", self.routine as f64);
    }
    match up.split(',').next().unwrap_or("") {
      "/PREP7" => self.routine = 17,
      "/SOLU" => self.routine = 21,
      "/POST1" => self.routine = 31,
      "/POST26" => self.routine = 36,
      "FINISH" => self.routine = 0,
      _ => {}
    }
    // element assignment or deletion: NAME(i,j,k)=v or NAME=
    if let Some(eq) = command.find('=') {
      let (lhs, rhs) = (command[..eq].trim(), command[eq + 1..].trim());
      if lhs.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        if let Some(open) = lhs.find('(') {
          let name = lhs[..open].to_uppercase();
          let inner = lhs[open + 1..].trim_end_matches(')');
          let ix: Vec<usize> = inner
            .split(',')
            .filter_map(|t| t.trim().parse().ok())
            .collect();
          if let (Some(FakeParam::Array(arr)), Ok(v), 3) =
            (self.params.get_mut(&name), rhs.parse::<f64>(), ix.len()) {
            arr.set(ix[0] - 1, ix[1] - 1, ix[2] - 1, v);
          }
        } else if rhs.is_empty() {
          self.params.remove(&lhs.to_uppercase());
        }
      }
    }
    return String::new();
  }

  /// Renders a *STATUS listing for one parameter or all of them.
  fn status_listing(&self, filter: Option<&str>) -> String {
    let mut out = String::from(
      "PARAMETER STATUS-\n\n NAME                              VALUE  \
      TYPE  DIMENSIONS\n"
    );
    let mut any = false;
    for (name, p) in &self.params {
      if filter.is_some_and(|f| f != name) {
        continue;
      }
      any = true;
      match p {
        FakeParam::Scalar(v) => {
          out.push_str(&format!(" {:<32} {:>20.8}  SCALAR\n", name, v));
        }
        FakeParam::Character(s) => {
          out.push_str(&format!(" {:<32} {}  CHARACTER\n", name, s));
        }
        FakeParam::Array(a) => {
          let (i, j, k) = a.shape();
          out.push_str(&format!(" {:<32} ARRAY {} {} {}\n", name, i, j, k));
        }
      }
    }
    if !any {
      return "There are no parameters defined.".to_string();
    }
    return out;
  }

  /// Dumps an array in a fixed-width format, with Fortran-style asterisk
  /// overflow when a value does not fit its field.
  fn mwrite_dump(&self, name: &str, format_line: &str) -> String {
    let width: usize = format_line
      .chars()
      .skip_while(|c| *c != 'F')
      .skip(1)
      .take_while(|c| c.is_ascii_digit())
      .collect::<String>()
      .parse()
      .unwrap_or(20);
    let mut out = String::new();
    if let Some(FakeParam::Array(arr)) = self.params.get(name) {
      for v in arr.values() {
        let field = format!("{:>w$.12}", v, w = width);
        if field.len() > width {
          out.push_str(&"*".repeat(width));
        } else {
          out.push_str(&field);
        }
        out.push('\n');
      }
    }
    return out;
  }

  /// Fills a dimensioned array from a staging file, first index fastest.
  fn vread_fill(&mut self, name: &str, file: &str) {
    let path = self.dir.path().join(file);
    let text = fs::read_to_string(path).unwrap_or_default();
    let values: Vec<f64> = text
      .split_whitespace()
      .filter_map(|t| t.parse().ok())
      .collect();
    if let Some(FakeParam::Array(arr)) = self.params.get_mut(name) {
      let (idim, jdim, kdim) = arr.shape();
      let mut it = values.into_iter();
      for k in 0..kdim {
        for j in 0..jdim {
          for i in 0..idim {
            if let Some(v) = it.next() {
              arr.set(i, j, k, v);
            }
          }
        }
      }
    }
  }
}

impl Transport for FakeSolver {
  fn run_command(&mut self, command: &str, _mute: bool)
    -> Result<String, ApdlError> {
    return Ok(self.execute(command));
  }

  fn input_file(&mut self, path: &Path) -> Result<String, ApdlError> {
    let script = fs::read_to_string(path)?;
    let lines: Vec<String> = script.lines().map(String::from).collect();
    self.scripts.push(lines.clone());
    let mut redirect: Option<PathBuf> = None;
    let mut captured = String::new();
    let mut immediate = String::new();
    for line in lines {
      if line.to_uppercase().starts_with("/OUTPUT") {
        match line.split(',').nth(1) {
          Some(dest) => redirect = Some(PathBuf::from(dest.trim())),
          None => {
            if let Some(dest) = redirect.take() {
              fs::write(dest, &captured)?;
            }
          }
        }
        continue;
      }
      let response = self.execute(&line);
      if redirect.is_some() {
        captured.push_str(&line);
        captured.push('\n');
        if !response.is_empty() {
          captured.push_str(&response);
          captured.push('\n');
        }
      } else {
        immediate.push_str(&response);
      }
    }
    return Ok(immediate);
  }

  fn read_file(&mut self, path: &Path) -> Result<String, ApdlError> {
    return Ok(fs::read_to_string(path)?);
  }

  fn upload(&mut self, path: &Path) -> Result<(), ApdlError> {
    self.uploads.push(path.to_path_buf());
    return Ok(());
  }

  fn directory(&self) -> PathBuf {
    return self.dir.path().to_path_buf();
  }

  fn is_local(&self) -> bool {
    return true;
  }

  fn is_distributed(&self) -> bool {
    return self.distributed;
  }

  fn name(&self) -> &str {
    return "fake";
  }
}

/// Shorthand for a default-config session over a fresh fake solver.
fn fake_session() -> Session<FakeSolver> {
  return Session::new(FakeSolver::new());
}

#[test]
fn test_check_parameter_name() {
  let ok = |n: &str| assert!(check_parameter_name(n).is_ok(), "{}", n);
  let bad = |n: &str| {
    assert!(
      matches!(check_parameter_name(n), Err(ApdlError::ParameterName(_))),
      "{}",
      n
    );
  };
  ok("ABC");
  ok("A3X");
  ok("TOP_END");
  ok("par_");
  ok("ARR(1,2)");
  ok("ARR(1, 2, 3)");
  ok("_LEAD_"); // trailing underscore exempts the leading one
  ok("ARG"); // no digits, not a reserved macro argument
  bad("2BAD"); // leading digit
  bad("BAD-NAME"); // disallowed character
  bad("AB(1"); // unbalanced parenthesis
  bad("AB(1)X"); // text after closing parenthesis
  bad("_BAD"); // reserved leading underscore
  bad("ARG1");
  bad("arg12");
  bad("AR999");
  bad("ar1");
  bad("THIS_NAME_IS_FAR_TOO_LONG_TO_BE_A_PARAMETER");
}

#[test]
fn test_interp_star_status() {
  let listing = "PARAMETER STATUS-  (5 PARAMETERS DEFINED)\n\
    NAME                              VALUE                        TYPE\n\
    EMPTYSTR                          CHARACTER\n\
    PARM_STR                          string  CHARACTER\n\
    PARM_FLOAT                        20.00000000  SCALAR\n\
    ARR                               ARRAY 3 1 1\n\
    TAB                               TABLE 2 2 1\n\
    some random ruler ----- ------ ----- ----- ------ here\n";
  let parms = interp_star_status(listing);
  assert_eq!(parms.len(), 5);
  assert_eq!(parms["EMPTYSTR"], ParamInfo::Character(String::new()));
  assert_eq!(parms["PARM_STR"], ParamInfo::Character("string".to_string()));
  assert_eq!(parms["PARM_FLOAT"], ParamInfo::Scalar(20.0));
  assert_eq!(parms["ARR"], ParamInfo::Array { shape: (3, 1, 1) });
  assert_eq!(parms["TAB"], ParamInfo::Table { shape: (2, 2, 1) });
  // idempotence: same text, same map
  assert_eq!(parms, interp_star_status(listing));
  // no parameters at all
  assert!(interp_star_status("There are no parameters defined.").is_empty());
  // garbage never panics, just yields nothing
  assert!(interp_star_status("a b c d e f g\n\n(1F20.12)").is_empty());
}

#[test]
fn test_scan_output_errors() {
  // permitted: logged, not raised
  let benign = "*** ERROR ***\nelement 4 is highly distorted ...";
  assert!(scan_output_errors(benign, "t").is_ok());
  let benign2 = "*** ERROR ***\nvolume 2 is turning inside out.";
  assert!(scan_output_errors(benign2, "t").is_ok());
  // anything else raises, message and instance captured
  let fatal = "*** ERROR ***\nSomething else";
  match scan_output_errors(fatal, "inst1") {
    Err(ApdlError::Solver { instance, message }) => {
      assert_eq!(instance, "inst1");
      assert!(message.contains("Something else"));
    }
    other => panic!("expected a solver error, got {:?}", other)
  }
  // capture stops at a blank-line boundary
  let bounded = "*** ERROR ***\nbad thing\n\nunrelated trailing text";
  match scan_output_errors(bounded, "t") {
    Err(ApdlError::Solver { message, .. }) => {
      assert!(message.contains("bad thing"));
      assert!(!message.contains("unrelated"));
    }
    other => panic!("expected a solver error, got {:?}", other)
  }
  // first unpermitted error wins, even after a permitted one
  let mixed = "*** ERROR ***\nit is highly distorted\n\n\
    *** ERROR ***\nreal failure";
  match scan_output_errors(mixed, "t") {
    Err(ApdlError::Solver { message, .. }) => {
      assert!(message.contains("real failure"));
    }
    other => panic!("expected a solver error, got {:?}", other)
  }
  assert!(scan_output_errors("all quiet", "t").is_ok());
}

#[test]
fn test_classify_response() {
  let fnf = "The solver was unable to open\nfile something.dat";
  assert!(matches!(
    classify_response(fnf),
    Err(ApdlError::FileNotFound(_))
  ));
  let routine = "*XYZ is not a recognized\nBEGIN command. \
    This command will be ignored.";
  match classify_response(routine) {
    Err(ApdlError::InvalidRoutine(text)) => {
      assert!(!text.contains("This command will be ignored."));
    }
    other => panic!("expected an invalid routine error, got {:?}", other)
  }
  assert!(matches!(
    classify_response("The K command is ignored here"),
    Err(ApdlError::CommandIgnored(_))
  ));
  assert!(matches!(
    classify_response("Entity 4 is not part of the currently active set."),
    Err(ApdlError::CommandIgnored(_))
  ));
  assert!(classify_response("everything is fine").is_ok());
}

#[test]
fn test_run_validation() {
  let mut s = fake_session();
  assert!(matches!(
    s.run("K,1\nK,2"),
    Err(ApdlError::MultilineCommand)
  ));
  assert!(matches!(s.run("   "), Err(ApdlError::EmptyCommand)));
  assert!(matches!(
    s.run("*VWRITE,A(1)"),
    Err(ApdlError::InvalidCommand { .. })
  ));
  assert!(matches!(
    s.run("/EOF"),
    Err(ApdlError::InvalidCommand { .. })
  ));
  // nothing was transmitted for any of those
  assert!(s.transport().sent.is_empty());
  // soft-invalid commands turn into comments
  s.run("/NOPR").unwrap();
  assert!(s.transport().sent.last().unwrap().starts_with("/COM,"));
  // /CLEAR is rewritten to keep the input level intact
  s.run("/CLEAR").unwrap();
  assert_eq!(s.transport().sent.last().unwrap(), "/CLE,NOSTART");
  // parameter definitions get their names vetted locally
  assert!(matches!(
    s.run("2BAD=5"),
    Err(ApdlError::ParameterName(_))
  ));
  // but comments and titles are exempt from the "=" heuristic
  assert!(s.run("/COM, note that par=1234 here").is_ok());
}

#[test]
fn test_muted_commands_skip_scanning() {
  let mut s = fake_session();
  s.transport_mut().canned.insert(
    "BADCMD".to_string(),
    "*** ERROR ***\nSomething broke".to_string()
  );
  assert!(s.run_muted("BADCMD").is_ok());
  assert!(matches!(s.run("BADCMD"), Err(ApdlError::Solver { .. })));
  // and suppression works too
  s.set_ignore_errors(true);
  assert!(s.run("BADCMD").is_ok());
}

#[test]
fn test_non_interactive_commit_and_cancel() {
  let mut s = fake_session();
  s.non_interactive(|s| {
    assert_eq!(s.run("/PREP7")?, None); // buffered, nothing sent yet
    s.run("K,1,0,0,0")?;
    s.run("K,2,1,0,0")?;
    return Ok(());
  }).unwrap();
  assert_eq!(s.transport().scripts.len(), 1);
  let script = &s.transport().scripts[0];
  // output redirect wraps the batch, order preserved in between
  assert!(script.first().unwrap().starts_with("/OUTPUT,"));
  assert_eq!(script.last().unwrap(), "/OUTPUT");
  assert_eq!(&script[1..4], &["/PREP7", "K,1,0,0,0", "K,2,1,0,0"]);
  assert!(s.last_response().unwrap().contains("K,2,1,0,0"));

  // an error inside the scope cancels the batch: nothing is ever sent
  let mut s = fake_session();
  let out: Result<(), ApdlError> = s.non_interactive(|s| {
    s.run("K,1,0,0,0")?;
    return Err(ApdlError::EmptyCommand);
  });
  assert!(out.is_err());
  assert!(s.transport().sent.is_empty());
  assert!(s.transport().scripts.is_empty());
  // and the buffer was discarded: a later run goes straight out
  s.run("K,9").unwrap();
  assert_eq!(s.transport().sent, vec!["K,9".to_string()]);
}

#[test]
fn test_nested_batches_refused() {
  let mut s = fake_session();
  let out: Result<(), ApdlError> = s.non_interactive(|s| {
    return s.non_interactive(|_| Ok(()));
  });
  assert!(matches!(out, Err(ApdlError::NestedBatch)));
  assert!(s.transport().sent.is_empty());
}

#[test]
fn test_chain_commands() {
  let mut s = fake_session();
  s.transport_mut().distributed = true;
  let out: Result<(), ApdlError> = s.chain_commands(|_| Ok(()));
  assert!(matches!(out, Err(ApdlError::DistributedChaining)));

  let mut s = fake_session();
  let commands: Vec<String> =
    (0..40).map(|i| format!("K,{},{:030},0,0", i, i)).collect();
  s.chain_commands(|s| {
    for c in &commands {
      s.run(c)?;
    }
    return Ok(());
  }).unwrap();
  // every physical command respects the length ceiling, uses the $
  // separator, and no command was lost or reordered
  let mut recovered: Vec<String> = Vec::new();
  for chained in &s.transport().sent {
    assert!(chained.len() <= 600, "chunk too long: {}", chained.len());
    recovered.extend(chained.split('$').map(String::from));
  }
  assert_eq!(recovered, commands);
  assert!(s.transport().sent.len() > 1);
}

#[test]
fn test_plot_device_retry() {
  let mut s = fake_session();
  let out = s.run("NPLOT").unwrap();
  assert_eq!(out.as_deref(), Some("PLOT COMPLETE"));
  assert_eq!(
    s.transport().sent,
    vec!["NPLOT".to_string(), "/SHOW,PNG".to_string(), "NPLOT".to_string()]
  );
  // the session tracks the device configured by /SHOW
  s.run("/SHOW,X11").unwrap();
  assert_eq!(s.config().file_type_for_plots, "X11");
}

#[test]
fn test_scalar_roundtrip() {
  let mut s = fake_session();
  s.parameters().set("PARM_FLOAT", 20.0).unwrap();
  assert_eq!(s.parameters().get("PARM_FLOAT").unwrap(), 20.0.into());
  s.parameters().set("PARM_STR", "string").unwrap();
  assert_eq!(s.parameters().get("PARM_STR").unwrap(), "string".into());
  // names are case-insensitive on the way in and out
  assert_eq!(s.parameters().get("parm_float").unwrap(), 20.0.into());
}

#[test]
fn test_scalar_set_rejected_locally() {
  let mut s = fake_session();
  let before = s.transport().sent.len();
  assert!(matches!(
    s.parameters().set("PARM", "a b"),
    Err(ApdlError::ParameterValue(_))
  ));
  let long = "x".repeat(40);
  assert!(matches!(
    s.parameters().set("PARM", long.as_str()),
    Err(ApdlError::ParameterValue(_))
  ));
  assert!(matches!(
    s.parameters().set("ARG7", 1.0),
    Err(ApdlError::ParameterName(_))
  ));
  // all of it rejected before any round trip
  assert_eq!(s.transport().sent.len(), before);
}

#[test]
fn test_scalar_overwrites_array() {
  let mut s = fake_session();
  s.parameters().set("X", vec![1.0, 2.0]).unwrap();
  s.parameters().set("X", 5.0).unwrap();
  assert_eq!(s.parameters().get("X").unwrap(), 5.0.into());
}

#[test]
fn test_array_chain_roundtrip() {
  let mut s = fake_session();
  s.parameters().set("ARR", vec![1.0, 2.0, 3.0]).unwrap();
  // small arrays go element-wise inside one batch: no uploads, one script
  // for the store
  assert!(s.transport().uploads.is_empty());
  let stored = &s.transport().scripts[0];
  assert!(stored.iter().any(|c| c.starts_with("*DIM,ARR")));
  assert!(stored.iter().any(|c| c == "ARR(1,1,1)=1"));
  match s.parameters().get("ARR").unwrap() {
    ParamValue::Array(arr) => {
      assert_eq!(arr.shape(), (3, 1, 1));
      assert_eq!(arr.values(), &[1.0, 2.0, 3.0]);
    }
    other => panic!("expected an array, got {:?}", other)
  }
}

#[test]
fn test_array_file_roundtrip() {
  let mut s = fake_session();
  let values: Vec<f64> = (0..1200).map(|i| i as f64 * 0.5).collect();
  s.parameters().set("BIG", values.clone()).unwrap();
  // large arrays take the staging-file path
  let stored = &s.transport().scripts[0];
  assert!(stored.iter().any(|c| c.starts_with("*VREAD,BIG(1,1)")));
  assert!(!stored.iter().any(|c| c.contains("BIG(1,1,1)=")));
  match s.parameters().get("BIG").unwrap() {
    ParamValue::Array(arr) => {
      assert_eq!(arr.shape(), (1200, 1, 1));
      assert_eq!(arr.values(), values.as_slice());
    }
    other => panic!("expected an array, got {:?}", other)
  }
}

#[test]
fn test_array_multidimensional_roundtrip() {
  let mut s = fake_session();
  let arr = ApdlArray::from_values(
    (2, 3, 1),
    vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
  ).unwrap();
  s.parameters().set("MAT", arr.clone()).unwrap();
  assert_eq!(s.parameters().get("MAT").unwrap(), ParamValue::Array(arr));
}

#[test]
fn test_array_width_escalation() {
  let mut s = fake_session();
  // 1e12 at 12 decimals does not fit a 20-wide field: the first dump
  // overflows and the read is retried with a wider format
  let values = vec![1.0e12, 2.0, 3.0];
  s.parameters().set("WIDE", values.clone()).unwrap();
  match s.parameters().get("WIDE").unwrap() {
    ParamValue::Array(arr) => assert_eq!(arr.values(), values.as_slice()),
    other => panic!("expected an array, got {:?}", other)
  }
  // one script stored it; at least two more were flushed for the dumps
  assert!(s.transport().scripts.len() >= 3);
}

#[test]
fn test_parameter_delete_and_contains() {
  let mut s = fake_session();
  s.parameters().set("KEEP", 1.0).unwrap();
  assert!(s.parameters().contains("KEEP").unwrap());
  s.parameters().delete("KEEP").unwrap();
  assert!(!s.parameters().contains("KEEP").unwrap());
  assert!(matches!(
    s.parameters().delete("GONE"),
    Err(ApdlError::MissingParameter(_))
  ));
  assert!(matches!(
    s.parameters().get("GONE"),
    Err(ApdlError::MissingParameter(_))
  ));
}

#[test]
fn test_save_selection() {
  let mut s = fake_session();
  s.save_selection(|s| {
    s.run("NSEL,S,LOC,X,0")?;
    return Ok(());
  }).unwrap();
  let sent = &s.transport().sent;
  let count = |prefix: &str| sent.iter().filter(|c| c.starts_with(prefix)).count();
  assert_eq!(count("CM,_"), 6);
  assert_eq!(count("CMSEL,S,_"), 6);
  assert_eq!(count("CMDELE,_"), 6);
  // the user command ran between save and restore
  let save_end = sent.iter().rposition(|c| c.starts_with("CM,_")).unwrap();
  let user = sent.iter().position(|c| c == "NSEL,S,LOC,X,0").unwrap();
  let restore = sent.iter().position(|c| c.starts_with("CMSEL,")).unwrap();
  assert!(save_end < user && user < restore);

  // the restore runs even when the closure fails
  let mut s = fake_session();
  let out: Result<(), ApdlError> = s.save_selection(|_| {
    return Err(ApdlError::EmptyCommand);
  });
  assert!(out.is_err());
  assert_eq!(
    s.transport().sent.iter().filter(|c| c.starts_with("CMSEL,")).count(),
    6
  );
}

#[test]
fn test_run_as_routine() {
  let mut s = fake_session();
  assert_eq!(s.active_routine().unwrap(), Routine::BeginLevel);
  s.run_as_routine(Routine::Prep7, |s| {
    s.run("K,1,0,0,0")?;
    assert_eq!(s.transport().routine, 17);
    return Ok(());
  }).unwrap();
  // back at the begin level afterwards
  assert_eq!(s.transport().routine, 0);
  assert_eq!(s.active_routine().unwrap(), Routine::BeginLevel);
}

#[test]
fn test_session_config() {
  let config = SessionConfig {
    ignore_errors: true,
    ..SessionConfig::default()
  };
  let s = Session::with_config(FakeSolver::new(), config);
  assert!(s.ignore_errors());
  assert_eq!(s.config().file_type_for_plots, "PNG");
  assert!(s.config().check_parameter_names);
}

#[test]
fn test_apdl_array() {
  assert!(ApdlArray::from_values((2, 2, 1), vec![1.0]).is_err());
  assert!(ApdlArray::from_values((0, 1, 1), vec![]).is_err());
  let mut arr = ApdlArray::from_values(
    (2, 2, 1),
    vec![1.0, 2.0, 3.0, 4.0]
  ).unwrap();
  assert_eq!(arr.get(0, 1, 0), Some(2.0));
  assert_eq!(arr.get(2, 0, 0), None);
  arr.set(1, 0, 0, 9.0);
  assert_eq!(arr.get(1, 0, 0), Some(9.0));
  // column-major ravel puts the first index fastest
  assert_eq!(arr.ravel_fortran(), vec![1.0, 9.0, 2.0, 4.0]);
  let v = ApdlArray::vector(vec![1.0, 2.0, 3.0]);
  assert_eq!(v.shape(), (3, 1, 1));
  assert_eq!(v.size(), 3);
}

#[test]
fn test_last_response() {
  let mut s = fake_session();
  s.transport_mut().canned.insert(
    "WHO".to_string(),
    "some response".to_string()
  );
  let out = s.run("WHO").unwrap();
  assert_eq!(out.as_deref(), Some("some response"));
  assert_eq!(s.last_response(), Some("some response"));
}
