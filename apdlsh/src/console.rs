//! This module implements the console transport: a solver launched as a
//! child process and driven over its standard streams, the way one would
//! use it in a terminal. Only viable for local, shared-memory instances.

use std::fs;
use std::io::{Read, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use apdl::errors::ApdlError;
use apdl::transport::Transport;
use log::{debug, info, warn};
use regex::Regex;
use subprocess::{Popen, PopenConfig, Redirection};

/// How long to wait for the first prompt after launching the solver.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the solver to die after being told to exit.
const EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// The things the solver's console output can end with, besides more
/// output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Event {
  /// A routine prompt: the solver is idle and ready for a command.
  Ready,
  /// A yes/no/continuous question the solver wants answered.
  Continue,
  /// A "should this really be executed?" warning prompt.
  Warning,
  /// The "should input processing be suspended?" error prompt.
  Error,
  /// A format prompt: the command wanted interactive input we can't give.
  Prompt
}

/// The console markers, each paired with what it means. Scanned in order;
/// the earliest match in the pending output wins.
static EVENTS: LazyLock<Vec<(Regex, Event)>> = LazyLock::new(|| {
  return [
    (
      r"(BEGIN|PREP7|SOLU_LS[0-9]+|POST1|POST26|RUNSTAT|AUX2|AUX3|AUX12|AUX15):",
      Event::Ready
    ),
    (r"YES,NO OR CONTINUOUS\)=", Event::Continue),
    (r"executed\?", Event::Warning),
    (r"SHOULD INPUT PROCESSING BE SUSPENDED\?", Event::Error),
    (r"ENTER FORMAT for", Event::Prompt)
  ].iter()
    .map(|(p, e)| (Regex::new(p).expect("static regex must compile"), *e))
    .collect();
});

/// Launch-time options for a console-driven solver.
#[derive(Clone, Debug)]
pub struct ConsoleOptions {
  /// Path to the solver executable.
  pub exec_file: PathBuf,
  /// Working directory for the run.
  pub run_location: PathBuf,
  /// The job name, which prefixes every file the solver writes.
  pub jobname: String,
  /// Processor count for the shared-memory solve.
  pub nproc: u32,
  /// Extra switches appended to the command line verbatim.
  pub switches: Vec<String>
}

/// A solver instance owned as a child process and spoken to over pipes.
pub struct ConsoleTransport {
  /// The child process itself.
  process: Popen,
  /// Its standard input.
  stdin: fs::File,
  /// Its standard output, standard error merged in.
  stdout: fs::File,
  /// Output received but not yet consumed by an event scan.
  pending: String,
  /// The run directory, where the solver reads and writes its files.
  run_location: PathBuf,
  /// Instance name, for logs and error reports.
  name: String
}

impl ConsoleTransport {
  /// Launches the solver and waits for its first routine prompt, answering
  /// the "press enter to continue" licence notice if one shows up.
  pub fn launch(options: &ConsoleOptions) -> Result<Self, ApdlError> {
    let mut argv: Vec<String> = vec![
      options.exec_file.display().to_string(),
      "-j".to_string(),
      options.jobname.clone(),
      "-np".to_string(),
      options.nproc.to_string()
    ];
    argv.extend(options.switches.iter().cloned());
    info!("launching solver: {}", argv.join(" "));
    let mut process = Popen::create(&argv, PopenConfig {
      stdin: Redirection::Pipe,
      stdout: Redirection::Pipe,
      stderr: Redirection::Merge,
      cwd: Some(options.run_location.clone().into_os_string()),
      ..PopenConfig::default()
    }).map_err(|e| ApdlError::Transport(format!("launch failed: {}", e)))?;
    let stdin = process.stdin.take().ok_or_else(|| {
      ApdlError::Transport("no pipe to the solver's stdin".to_string())
    })?;
    let stdout = process.stdout.take().ok_or_else(|| {
      ApdlError::Transport("no pipe to the solver's stdout".to_string())
    })?;
    let name = format!("console_pid_{}", process.pid().unwrap_or_default());
    let mut transport = Self {
      process,
      stdin,
      stdout,
      pending: String::new(),
      run_location: options.run_location.clone(),
      name
    };
    transport.wait_for_start()?;
    return Ok(transport);
  }

  /// Waits for the first `BEGIN:` prompt, pressing enter through any
  /// continue notice on the way.
  fn wait_for_start(&mut self) -> Result<(), ApdlError> {
    let deadline = Instant::now() + START_TIMEOUT;
    loop {
      if self.pending.contains("BEGIN:") {
        debug!("solver is up");
        self.pending.clear();
        return Ok(());
      }
      if self.pending.contains("CONTINUE") {
        debug!("answering the continue notice");
        self.pending.clear();
        self.send_line("")?;
      }
      if Instant::now() > deadline {
        return Err(ApdlError::Transport(format!(
          "solver produced no prompt within {}s: {}",
          START_TIMEOUT.as_secs(),
          self.pending
        )));
      }
      self.fill_pending()?;
    }
  }

  /// Writes one line down the solver's stdin.
  fn send_line(&mut self, line: &str) -> Result<(), ApdlError> {
    self.stdin.write_all(line.as_bytes())?;
    self.stdin.write_all(b"\n")?;
    self.stdin.flush()?;
    return Ok(());
  }

  /// Blocks until more output arrives and appends it to the pending text.
  /// A zero-byte read means the solver hung up.
  fn fill_pending(&mut self) -> Result<(), ApdlError> {
    let mut chunk = [0u8; 4096];
    let n = self.stdout.read(&mut chunk)?;
    if n == 0 {
      return Err(ApdlError::Transport(
        "the solver process exited".to_string()
      ));
    }
    self.pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
    return Ok(());
  }

  /// The earliest event marker in the pending output, if any.
  fn next_event(&self) -> Option<(Event, usize, usize)> {
    let mut best: Option<(Event, usize, usize)> = None;
    for (pattern, event) in EVENTS.iter() {
      if let Some(m) = pattern.find(&self.pending) {
        if best.is_none_or(|(_, start, _)| m.start() < start) {
          best = Some((*event, m.start(), m.end()));
        }
      }
    }
    return best;
  }

  /// Consumes pending output up to and including an event marker,
  /// returning the text before it and the marker itself.
  fn consume(&mut self, start: usize, end: usize) -> (String, String) {
    let rest = self.pending.split_off(end);
    let mut chunk = mem::replace(&mut self.pending, rest);
    let marker = chunk.split_off(start);
    return (chunk, marker);
  }

  /// Reads output until the solver is ready for the next command,
  /// answering yes/no prompts affirmatively along the way. Everything
  /// printed before the final prompt is the response.
  fn expect_ready(&mut self) -> Result<String, ApdlError> {
    let mut response = String::new();
    loop {
      let Some((event, start, end)) = self.next_event() else {
        self.fill_pending()?;
        continue;
      };
      let (before, marker) = self.consume(start, end);
      response.push_str(&before);
      match event {
        Event::Ready => return Ok(response),
        Event::Continue => {
          debug!("answering a continue prompt: {}", marker);
          self.send_line("y")?;
        }
        Event::Warning => {
          warn!("confirming a warning prompt: {}", marker);
          self.send_line("y")?;
        }
        Event::Error => {
          // decline suspension so the session stays usable, then report
          self.send_line("no")?;
          return Err(ApdlError::Transport(format!(
            "the solver suspended input processing: {}",
            response
          )));
        }
        Event::Prompt => {
          return Err(ApdlError::Transport(
            "the command wants interactive input; run it inside a \
            non-interactive batch with its input as the following line"
              .to_string()
          ));
        }
      }
    }
  }

  /// Whether the child process is still running.
  fn alive(&mut self) -> bool {
    return self.process.poll().is_none();
  }

  /// Tells the solver to exit cleanly and waits a little for it to die,
  /// killing it if it doesn't.
  pub fn exit(&mut self) -> Result<(), ApdlError> {
    debug!("asking the solver to exit");
    if self.alive() {
      let _ = self.send_line("FINISH");
      let _ = self.send_line("EXIT");
    }
    let died = self
      .process
      .wait_timeout(EXIT_TIMEOUT)
      .map_err(|e| ApdlError::Transport(e.to_string()))?;
    if died.is_none() {
      warn!("solver did not exit in time, killing it");
      self.process.kill()?;
    }
    return Ok(());
  }
}

impl Transport for ConsoleTransport {
  fn run_command(&mut self, command: &str, _mute: bool)
    -> Result<String, ApdlError> {
    if !self.alive() {
      return Err(ApdlError::Transport(
        "the solver process exited".to_string()
      ));
    }
    debug!("sending command: {}", command);
    self.send_line(command)?;
    return self.expect_ready();
  }

  fn input_file(&mut self, path: &Path) -> Result<String, ApdlError> {
    return self.run_command(&format!("/INPUT,'{}'", path.display()), false);
  }

  fn read_file(&mut self, path: &Path) -> Result<String, ApdlError> {
    return Ok(fs::read_to_string(path)?);
  }

  fn upload(&mut self, path: &Path) -> Result<(), ApdlError> {
    let file_name = path.file_name().ok_or_else(|| {
      ApdlError::Transport(format!("{} has no file name", path.display()))
    })?;
    fs::copy(path, self.run_location.join(file_name))?;
    return Ok(());
  }

  fn directory(&self) -> PathBuf {
    return self.run_location.clone();
  }

  fn is_local(&self) -> bool {
    return true;
  }

  fn is_distributed(&self) -> bool {
    // the console drives a shared-memory instance only
    return false;
  }

  fn name(&self) -> &str {
    return &self.name;
  }
}

impl Drop for ConsoleTransport {
  fn drop(&mut self) {
    if self.alive() {
      if let Err(e) = self.exit() {
        warn!("could not stop the solver cleanly: {}", e);
      }
    }
  }
}
