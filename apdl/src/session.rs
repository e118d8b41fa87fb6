//! This module implements the session: the single entry point through which
//! every command reaches the solver. It owns the local validation tables,
//! the buffered (non-interactive and chained) execution modes, and the
//! scoped helpers that save/restore solver-side state around a block of
//! commands.

use std::fs;
use std::mem;
use std::sync::LazyLock;

use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ApdlError;
use crate::output::{classify_response, scan_output_errors};
use crate::params::{Parameters, check_parameter_name};
use crate::transport::Transport;
use crate::util::{parse_to_short_cmd, random_string};

/// Commands that cannot be run interactively, with a hint on what to do
/// instead. Matched as prefixes of the upcased command, the way the solver
/// itself abbreviates them.
const INVAL_COMMANDS: [(&str, &str); 10] = [
  ("*VWR", "run *VWRITE inside a non-interactive batch, followed by its \
    format line"),
  ("*CFO", "run CFOPEN inside a non-interactive batch"),
  ("*CRE", "build the macro client-side, or run *CREATE inside a \
    non-interactive batch"),
  ("*END", "build the macro client-side, or run *END inside a \
    non-interactive batch"),
  ("/EOF", "unsupported; drop the session to stop the solver"),
  ("*ASK", "unsupported; prompt on the client side instead"),
  ("*IF", "branch on the client side, or run inside a non-interactive \
    batch"),
  ("CMAT", "run CMAT inside a non-interactive batch"),
  ("*REP", "run *REPEAT inside a non-interactive batch"),
  ("LSRE", "run LSREAD inside a non-interactive batch")
];

/// Commands that are not rejected but quietly rewritten into comments, with
/// the reason logged. Matched against the upcased first field.
const INVAL_COMMANDS_SILENT: [(&str, &str); 1] = [
  ("/NOPR", "suppressing console output breaks response scanning; mute \
    individual commands instead")
];

/// Short forms of the plotting commands, which get one bounded retry when
/// the solver reports that no display device is configured.
const PLOT_COMMANDS: [&str; 8] = [
  "NPLO", "EPLO", "KPLO", "LPLO", "APLO", "VPLO", "PLNS", "PLES"
];

/// What the solver says when a plot command runs before any `/SHOW`.
const DEVICE_UNSET: &str =
  "Display device has not yet been specified with the /SHOW command";

/// The hard ceiling for one physical chained command. The solver truncates
/// somewhere above 620 characters, so stay well clear of it.
const MAX_COMMAND_LENGTH: usize = 600;

/// Case-insensitive ASCII prefix test that never panics on short or
/// non-ASCII input.
fn starts_with_ci(command: &str, prefix: &str) -> bool {
  return command
    .get(..prefix.len())
    .is_some_and(|s| s.eq_ignore_ascii_case(prefix));
}

/// The upcased first comma-separated field of a command.
fn first_field(command: &str) -> String {
  return command.split(',').next().unwrap_or("").trim().to_uppercase();
}

/// Matches the `VALUE=` readout a `*GET` prints to the console.
static GET_VALUE: LazyLock<Regex> = LazyLock::new(|| {
  return Regex::new(r"VALUE\s*=\s*([-+]?[0-9]*\.?[0-9]+(?:[eEdD][-+]?[0-9]+)?)")
    .expect("static regex must compile");
});

/// The solver's processors ("routines"). Commands valid in one routine may
/// be rejected in another, so scoped switching matters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Routine {
  /// The top ("begin") level, outside any processor.
  BeginLevel,
  /// The preprocessor.
  Prep7,
  /// The solution processor.
  Solution,
  /// The general postprocessor.
  Post1,
  /// The time-history postprocessor.
  Post26,
  /// Binary file manipulation.
  Aux2,
  /// Results file editing.
  Aux3,
  /// Radiation matrix generation.
  Aux12,
  /// Result file translation.
  Aux15
}

impl Routine {
  /// Decodes the routine from the numeric code `*GET,ACTIVE,0,ROUT` yields.
  pub fn from_code(code: u32) -> Option<Self> {
    return match code {
      0 => Some(Self::BeginLevel),
      17 => Some(Self::Prep7),
      21 => Some(Self::Solution),
      31 => Some(Self::Post1),
      36 => Some(Self::Post26),
      52 => Some(Self::Aux2),
      53 => Some(Self::Aux3),
      62 => Some(Self::Aux12),
      65 => Some(Self::Aux15),
      _ => None
    };
  }

  /// The name the solver knows this routine by.
  pub fn name(&self) -> &'static str {
    return match self {
      Self::BeginLevel => "Begin level",
      Self::Prep7 => "PREP7",
      Self::Solution => "SOLU",
      Self::Post1 => "POST1",
      Self::Post26 => "POST26",
      Self::Aux2 => "AUX2",
      Self::Aux3 => "AUX3",
      Self::Aux12 => "AUX12",
      Self::Aux15 => "AUX15"
    };
  }
}

/// Session-wide knobs. These map one-to-one onto solver-visible behavior;
/// transport configuration (addresses, executables) lives with the
/// transport instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
  /// When set, solver-reported errors in responses are not raised.
  pub ignore_errors: bool,
  /// When set, `/COM` command payloads are echoed to the log.
  pub print_com: bool,
  /// When unset, parameter names go to the solver unvalidated.
  pub check_parameter_names: bool,
  /// The display device to configure when a plot command finds none.
  pub file_type_for_plots: String
}

impl Default for SessionConfig {
  fn default() -> Self {
    return Self {
      ignore_errors: false,
      print_com: false,
      check_parameter_names: true,
      file_type_for_plots: "PNG".to_string()
    };
  }
}

/// A live conversation with one solver instance. All mutable conversation
/// state (buffering flags, pending commands, last response) lives here; the
/// solver's own parameter store and selection state are process-wide on its
/// side, so one session per solver instance is the assumed model.
pub struct Session<T: Transport> {
  /// The wire.
  transport: T,
  /// Session-wide knobs.
  config: SessionConfig,
  /// When set, commands are buffered rather than sent.
  store_commands: bool,
  /// The pending buffered commands, in submission order.
  stored_commands: Vec<String>,
  /// The last textual response, single command or aggregate batch.
  last_response: Option<String>
}

impl<T: Transport> Session<T> {
  /// Opens a session over the given transport with default configuration.
  pub fn new(transport: T) -> Self {
    return Self::with_config(transport, SessionConfig::default());
  }

  /// Opens a session with explicit configuration.
  pub fn with_config(transport: T, config: SessionConfig) -> Self {
    return Self {
      transport,
      config,
      store_commands: false,
      stored_commands: Vec::new(),
      last_response: None
    };
  }

  /// Borrows the transport.
  pub fn transport(&self) -> &T {
    return &self.transport;
  }

  /// Borrows the transport mutably.
  pub fn transport_mut(&mut self) -> &mut T {
    return &mut self.transport;
  }

  /// Borrows the configuration.
  pub fn config(&self) -> &SessionConfig {
    return &self.config;
  }

  /// Borrows the configuration mutably.
  pub fn config_mut(&mut self) -> &mut SessionConfig {
    return &mut self.config;
  }

  /// Whether solver-reported errors are currently suppressed.
  pub fn ignore_errors(&self) -> bool {
    return self.config.ignore_errors;
  }

  /// Turns suppression of solver-reported errors on or off.
  pub fn set_ignore_errors(&mut self, value: bool) {
    self.config.ignore_errors = value;
  }

  /// The last response text, if any. After a batch this is the aggregate
  /// captured output of the whole batch.
  pub fn last_response(&self) -> Option<&str> {
    return self.last_response.as_deref();
  }

  /// Access to the solver's named parameters.
  pub fn parameters(&mut self) -> Parameters<'_, T> {
    return Parameters::new(self);
  }

  /// Runs a single command. Returns `None` while buffering (nothing was
  /// sent yet) and the trimmed response text otherwise.
  pub fn run(&mut self, command: &str) -> Result<Option<String>, ApdlError> {
    return self.run_inner(command, false);
  }

  /// Runs a single command, discarding the response. Muted commands skip
  /// response scanning entirely.
  pub fn run_muted(&mut self, command: &str) -> Result<(), ApdlError> {
    self.run_inner(command, true)?;
    return Ok(());
  }

  /// The dispatcher proper. See the crate docs for the full contract; in
  /// short: validate locally, buffer or send, post-process the response.
  fn run_inner(
    &mut self,
    command: &str,
    mute: bool
  ) -> Result<Option<String>, ApdlError> {
    if command.contains('\n') || command.contains('\r') {
      return Err(ApdlError::MultilineCommand);
    }
    // buffering suspends transmission entirely; validation happens when the
    // batch is flushed and the solver sees the commands
    if self.store_commands {
      self.stored_commands.push(command.to_string());
      return Ok(None);
    }
    let mut command = command.trim().to_string();
    if command.is_empty() {
      return Err(ApdlError::EmptyCommand);
    }
    // the solver mishandles /CLEAR,START under an active /INPUT level
    if starts_with_ci(&command, "/CLE") {
      command = "/CLE,NOSTART".to_string();
    }
    // track the configured display device
    if starts_with_ci(&command, "/SHO") && command.contains(',') {
      if let Some(dev) = command.split(',').nth(1) {
        self.config.file_type_for_plots = dev.trim().to_uppercase();
      }
    }
    for (cmd, reason) in INVAL_COMMANDS_SILENT {
      if first_field(&command) == cmd {
        let msg = format!("{} is ignored: {}", cmd, reason);
        info!("{}", msg);
        command = format!("/COM, {}", msg);
        break;
      }
    }
    let upcased = command.to_uppercase();
    for (prefix, hint) in INVAL_COMMANDS {
      if upcased.starts_with(prefix) {
        return Err(ApdlError::InvalidCommand {
          command: command.clone(),
          hint
        });
      }
    }
    // a "name = value" command defines a parameter: vet the name locally
    if let Some(eq) = command.find('=') {
      let field = first_field(&command);
      let is_comment = field.starts_with("/COM") || field.starts_with("/TIT");
      if !is_comment && self.config.check_parameter_names {
        check_parameter_name(command[..eq].trim())?;
      }
    }
    if self.config.print_com && first_field(&command).starts_with("/COM") {
      let payload = command.splitn(2, ',').nth(1).unwrap_or("").trim();
      info!("{}", payload);
    }
    let short_cmd = parse_to_short_cmd(&command);
    let mut text = self.transport.run_command(&command, mute)?;
    // plot command before any /SHOW: set the device and resend once
    if text.contains(DEVICE_UNSET)
      && PLOT_COMMANDS.contains(&short_cmd.as_str()) {
      debug!("no display device configured, setting one and resending");
      let show = format!("/SHOW,{}", self.config.file_type_for_plots);
      self.run_inner(&show, true)?;
      text = self.transport.run_command(&command, mute)?;
    }
    if mute {
      return Ok(None);
    }
    let text = text
      .replace("\\r\\n", "\n")
      .replace("\\n", "\n")
      .trim()
      .to_string();
    if text.is_empty() {
      self.last_response = None;
      return Ok(None);
    }
    self.last_response = Some(text.clone());
    if !self.config.ignore_errors {
      classify_response(&text)?;
      scan_output_errors(&text, self.transport.name())?;
    }
    return Ok(Some(text));
  }

  /// Runs the closure with command buffering on. Commands issued inside it
  /// are not sent; on `Ok` they are flushed as one input script and the
  /// captured output becomes the aggregate response. On `Err` the pending
  /// batch is discarded untransmitted and the error propagates.
  pub fn non_interactive<R, F>(&mut self, f: F) -> Result<R, ApdlError>
  where F: FnOnce(&mut Self) -> Result<R, ApdlError> {
    let out = self.buffered(f)?;
    self.flush_stored()?;
    return Ok(out);
  }

  /// Like [`Session::non_interactive`], but flushes by joining the buffered
  /// commands with `$` into physical commands of bounded length instead of
  /// an input script. Refused when the solver runs distributed, which
  /// cannot handle condensed input.
  pub fn chain_commands<R, F>(&mut self, f: F) -> Result<R, ApdlError>
  where F: FnOnce(&mut Self) -> Result<R, ApdlError> {
    if self.transport.is_distributed() {
      return Err(ApdlError::DistributedChaining);
    }
    let out = self.buffered(f)?;
    self.chain_stored()?;
    return Ok(out);
  }

  /// The shared buffering scaffold: set the flag, run the closure, clear
  /// the flag. A closure error discards the pending buffer.
  fn buffered<R, F>(&mut self, f: F) -> Result<R, ApdlError>
  where F: FnOnce(&mut Self) -> Result<R, ApdlError> {
    if self.store_commands {
      return Err(ApdlError::NestedBatch);
    }
    debug!("entering command-buffering mode");
    self.store_commands = true;
    let out = f(self);
    self.store_commands = false;
    match out {
      Ok(r) => return Ok(r),
      Err(e) => {
        debug!(
          "buffering scope failed; discarding {} pending commands",
          self.stored_commands.len()
        );
        self.stored_commands.clear();
        return Err(e);
      }
    }
  }

  /// Flushes the pending buffer as one input script wrapped in an output
  /// redirect, then reads the captured output back as the aggregate
  /// response.
  fn flush_stored(&mut self) -> Result<(), ApdlError> {
    debug!("flushing {} stored commands", self.stored_commands.len());
    let dir = tempfile::tempdir()?;
    let suffix = random_string(10);
    let tmp_out = dir.path().join(format!("tmp_{}.out", suffix));
    let tmp_inp = dir.path().join(format!("tmp_{}.inp", suffix));
    let mut commands = mem::take(&mut self.stored_commands);
    commands.insert(0, format!("/OUTPUT,{}", tmp_out.display()));
    commands.push("/OUTPUT".to_string());
    fs::write(&tmp_inp, commands.join("\n"))?;
    let immediate = self.transport.input_file(&tmp_inp)?;
    if !self.config.ignore_errors {
      classify_response(&immediate)?;
      scan_output_errors(&immediate, self.transport.name())?;
    }
    let captured = self.transport.read_file(&tmp_out)?;
    self.last_response = Some(format!("\n{}", captured));
    return Ok(());
  }

  /// Flushes the pending buffer as `$`-joined chained commands, splitting
  /// whenever a chunk would exceed the physical command length limit.
  fn chain_stored(&mut self) -> Result<(), ApdlError> {
    debug!("chaining {} stored commands", self.stored_commands.len());
    let stored = mem::take(&mut self.stored_commands);
    let mut chunks: Vec<String> = Vec::new();
    let mut chunk: Vec<String> = Vec::new();
    let mut length = 0;
    for command in stored {
      let len_command = command.len() + 1; // counts the separator
      if length + len_command > MAX_COMMAND_LENGTH && !chunk.is_empty() {
        chunks.push(chunk.join("$"));
        chunk.clear();
        length = 0;
      }
      length += len_command;
      chunk.push(command);
    }
    chunks.push(chunk.join("$"));
    let mut responses = Vec::with_capacity(chunks.len());
    for chained in chunks {
      responses.push(self.transport.run_command(&chained, false)?);
    }
    self.last_response = Some(responses.join("\n"));
    return Ok(());
  }

  /// Saves the current selection (nodes, elements, keypoints, lines,
  /// areas, volumes) into temporary named components before the closure
  /// runs, and restores it afterwards on both exit paths.
  pub fn save_selection<R, F>(&mut self, f: F) -> Result<R, ApdlError>
  where F: FnOnce(&mut Self) -> Result<R, ApdlError> {
    const ENTITIES: [&str; 6] = ["KP", "LINE", "AREA", "VOLU", "NODE", "ELEM"];
    let tag = random_string(10);
    debug!("saving selection under tag {}", tag);
    // empty selections make CM complain; that is fine here
    let prev = self.config.ignore_errors;
    self.config.ignore_errors = true;
    for entity in ENTITIES {
      self.run_muted(&format!("CM,_{}_{}_,{}", tag, entity, entity))?;
    }
    self.config.ignore_errors = prev;
    let out = f(self);
    debug!("restoring selection under tag {}", tag);
    let prev = self.config.ignore_errors;
    self.config.ignore_errors = true;
    for entity in ENTITIES {
      let cmp = format!("_{}_{}_", tag, entity);
      self.run_muted(&format!("CMSEL,S,{},{}", cmp, entity))?;
      self.run_muted(&format!("CMDELE,{}", cmp))?;
    }
    self.config.ignore_errors = prev;
    return out;
  }

  /// Runs the closure inside the given routine, then reverts to whichever
  /// routine was active before, on both exit paths.
  pub fn run_as_routine<R, F>(
    &mut self,
    routine: Routine,
    f: F
  ) -> Result<R, ApdlError>
  where F: FnOnce(&mut Self) -> Result<R, ApdlError> {
    let cached = self.active_routine()?;
    debug!("caching routine {}", cached.name());
    if cached != routine {
      self.enter_routine(routine)?;
    }
    let out = f(self);
    debug!("restoring routine {}", cached.name());
    self.enter_routine(cached)?;
    return out;
  }

  /// Queries the solver for the currently active routine.
  pub fn active_routine(&mut self) -> Result<Routine, ApdlError> {
    let code = self.get_value("ACTIVE", "0", "ROUT")?;
    return Routine::from_code(code as u32).ok_or_else(|| {
      ApdlError::MissingValue(format!("a known routine code (got {})", code))
    });
  }

  /// Switches the solver into a routine. The begin level is entered by
  /// finishing the current processor rather than by a slash command.
  fn enter_routine(&mut self, routine: Routine) -> Result<(), ApdlError> {
    return match routine {
      Routine::BeginLevel => self.run_muted("FINISH"),
      other => self.run_muted(&format!("/{}", other.name()))
    };
  }

  /// Fetches a scalar via `*GET`, parsing the `VALUE=` readout from the
  /// response text.
  pub fn get_value(
    &mut self,
    entity: &str,
    entnum: &str,
    item1: &str
  ) -> Result<f64, ApdlError> {
    let cmd = format!(
      "*GET,__FLOATPARAMETER__,{},{},{}",
      entity,
      entnum,
      item1
    );
    let response = self.run(&cmd)?.ok_or_else(|| {
      ApdlError::MissingValue("a response to *GET".to_string())
    })?;
    let cap = GET_VALUE.captures(&response).ok_or_else(|| {
      ApdlError::MissingValue("a VALUE= readout".to_string())
    })?;
    let raw = cap[1].replace(['d', 'D'], "e");
    return raw.parse::<f64>().map_err(|_| {
      ApdlError::MissingValue(format!("a parseable VALUE= (got {})", &cap[1]))
    });
  }

  /// Warns about any commands still buffered. The buffer is dropped with
  /// the session; anything left in it was never transmitted.
  fn warn_pending(&self) {
    if !self.stored_commands.is_empty() {
      warn!(
        "session dropped with {} never-transmitted buffered commands",
        self.stored_commands.len()
      );
    }
  }
}

impl<T: Transport> Drop for Session<T> {
  fn drop(&mut self) {
    self.warn_pending();
  }
}
