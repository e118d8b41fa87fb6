//! This library implements a client for driving MAPDL-like finite element
//! solvers over their text-based command interface.
//!
//! The solver itself is an external process, treated as an opaque
//! request/response peer behind the [`transport::Transport`] trait. What this
//! library owns is the conversation with it: single-command dispatch with
//! local validation, buffered (non-interactive and chained) execution,
//! marshalling of named scalar and array parameters in and out of the
//! solver's parameter store, and the classification of error banners the
//! solver embeds in its text output.
//!
//! It does not attempt to reproduce the solver's numerics, its command
//! language, or any plotting/visualization. Per-command convenience wrappers
//! are also out of scope -- everything here speaks raw command strings
//! through [`session::Session::run`].

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![allow(clippy::needless_return)]

pub mod errors;
pub mod output;
pub mod params;
pub mod prelude;
pub mod session;
pub mod transport;
pub mod util;

#[cfg(test)]
mod tests;
