//! Interactive shell and script runner over a console-driven solver
//! instance: launches the solver, dispatches commands through a session,
//! and prints responses.

#![allow(clippy::needless_return)] // i'll never forgive rust for this

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use apdl::prelude::*;
use clap::Parser;
use log::{LevelFilter, error, info};

mod console;

use crate::console::{ConsoleOptions, ConsoleTransport};

#[derive(Parser)]
#[command(author, version)]
struct Cli {
  /// Path to the solver executable.
  exec_file: PathBuf,
  /// Working directory for the run (defaults to the current directory).
  #[arg(short = 'd', long)]
  run_location: Option<PathBuf>,
  /// Job name, which prefixes every file the solver writes.
  #[arg(short, long, default_value = "file")]
  jobname: String,
  /// Processor count for the shared-memory solve.
  #[arg(short, long, default_value_t = 2)]
  nproc: u32,
  /// Extra switch passed to the solver command line (repeatable).
  #[arg(short, long)]
  switch: Vec<String>,
  /// Script of commands to run instead of an interactive prompt.
  #[arg(short, long)]
  input: Option<PathBuf>,
  /// Keep going when the solver reports errors.
  #[arg(long)]
  ignore_errors: bool,
  /// Output extra/debug info.
  #[arg(short, long)]
  verbose: bool
}

fn main() -> io::Result<()> {
  // init cli stuff
  let args = Cli::parse();
  let log_level = if args.verbose {
    LevelFilter::Debug
  } else {
    LevelFilter::Info
  };
  env_logger::builder().filter_level(log_level).init();
  // launch the solver
  let run_location = match args.run_location {
    Some(dir) => dir,
    None => std::env::current_dir()?
  };
  if !args.exec_file.is_file() {
    error!("Provided solver path either does not exist or is not a file!");
    std::process::exit(1);
  }
  let options = ConsoleOptions {
    exec_file: args.exec_file,
    run_location,
    jobname: args.jobname,
    nproc: args.nproc,
    switches: args.switch
  };
  let transport = match ConsoleTransport::launch(&options) {
    Ok(t) => t,
    Err(e) => {
      error!("Could not launch the solver: {}", e);
      std::process::exit(1);
    }
  };
  let config = SessionConfig {
    ignore_errors: args.ignore_errors,
    ..SessionConfig::default()
  };
  let mut session = Session::with_config(transport, config);
  info!("Solver is up.");
  // run a script, or talk to the user
  let failed = match args.input {
    Some(script) => run_script(&mut session, &script)?,
    None => repl(&mut session)?
  };
  if let Err(e) = session.transport_mut().exit() {
    error!("Solver shutdown failed: {}", e);
  }
  if failed {
    std::process::exit(1);
  }
  return Ok(());
}

/// Runs every line of a script through the session, stopping at the first
/// error. Returns whether anything failed.
fn run_script<T: Transport>(
  session: &mut Session<T>,
  script: &Path
) -> io::Result<bool> {
  let text = std::fs::read_to_string(script)?;
  for (number, line) in text.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') {
      continue;
    }
    match session.run(line) {
      Ok(Some(response)) => println!("{}", response),
      Ok(None) => {}
      Err(e) => {
        error!("Line {}: {}", number + 1, e);
        return Ok(true);
      }
    }
  }
  info!("Script done.");
  return Ok(false);
}

/// Reads commands from the user until end-of-input or an exit command,
/// printing each response. Solver-reported errors are printed and the
/// prompt continues. Returns whether anything failed fatally.
fn repl<T: Transport>(session: &mut Session<T>) -> io::Result<bool> {
  let stdin = io::stdin();
  let mut lines = stdin.lock().lines();
  loop {
    print!("apdl> ");
    io::stdout().flush()?;
    let Some(line) = lines.next() else {
      break;
    };
    let line = line?;
    let command = line.trim();
    if command.is_empty() {
      continue;
    }
    if command.eq_ignore_ascii_case("exit")
      || command.eq_ignore_ascii_case("quit") {
      break;
    }
    match session.run(command) {
      Ok(Some(response)) => println!("{}", response),
      Ok(None) => {}
      Err(e @ ApdlError::Transport(_)) => {
        error!("{}", e);
        return Ok(true);
      }
      Err(e) => error!("{}", e)
    }
  }
  return Ok(false);
}
