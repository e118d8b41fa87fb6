//! This module implements marshalling of named parameters between this
//! process and the solver's parameter store. The solver always owns the
//! values; everything here is command round-trips: `*SET`/`*DIM` going in,
//! `*STATUS` listings and `*MWRITE` dumps coming back.

use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use itertools::Itertools;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::ApdlError;
use crate::session::Session;
use crate::transport::Transport;

/// Arrays below this element count are set with one assignment command per
/// element inside a single batch; at or above it, they go through a payload
/// file and one bulk `*VREAD`. Many small commands are faster and more
/// stable than a file transfer up to roughly this size.
pub const ARRAY_FILE_THRESHOLD: usize = 1000;

/// Field widths tried, in order, when reading an array back. A value that
/// overflows its field prints as asterisks, so the read is retried with the
/// next wider format.
const MWRITE_WIDTHS: [usize; 5] = [20, 30, 40, 64, 100];

/// The name of the staging file for bulk array transfers, relative to the
/// solver's working directory.
const ARRAY_STAGING_FILE: &str = "_tmp.dat";

/// Shape of a parameter name the solver accepts: letter or underscore
/// first, then letters, digits, underscores and index punctuation, 32
/// characters total at most.
static VALID_PARAMETER_NAME: LazyLock<Regex> = LazyLock::new(|| {
  return Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_(), ]{0,31}$")
    .expect("static regex must compile");
});

/// Names reserved for macro-local arguments.
static RESERVED_ARG_NAME: LazyLock<Regex> = LazyLock::new(|| {
  return Regex::new(r"(?i)^(AR|ARG)\d{1,3}$")
    .expect("static regex must compile");
});

/// Checks a parameter name against the solver's naming rules, locally and
/// before any round trip. Index expressions like `ARR(1,2)` are allowed;
/// the base name is then checked recursively.
pub fn check_parameter_name(name: &str) -> Result<(), ApdlError> {
  let name = name.trim();
  if !VALID_PARAMETER_NAME.is_match(name) {
    return Err(ApdlError::ParameterName(format!(
      "\"{}\": names are letters, digits and underscores, up to 32 \
      characters, and cannot start with a digit",
      name
    )));
  }
  if name.contains('(') || name.contains(')') {
    let opens = name.matches('(').count();
    let closes = name.matches(')').count();
    if opens != closes {
      return Err(ApdlError::ParameterName(format!(
        "\"{}\": unbalanced parentheses",
        name
      )));
    }
    if !name.ends_with(')') {
      return Err(ApdlError::ParameterName(format!(
        "\"{}\": nothing may follow the closing parenthesis of an index",
        name
      )));
    }
    // vet the base name and skip the underscore/reserved checks, which
    // apply to definitions rather than index expressions
    if let Some(open) = name.find('(') {
      return check_parameter_name(&name[..open]);
    }
  }
  if name.starts_with('_') && !name.ends_with('_') {
    return Err(ApdlError::ParameterName(format!(
      "\"{}\": leading-underscore names are reserved for the solver's own \
      macros and GUI",
      name
    )));
  }
  if RESERVED_ARG_NAME.is_match(name) {
    return Err(ApdlError::ParameterName(format!(
      "\"{}\": ARGxx and ARxx are reserved for macro-local arguments",
      name
    )));
  }
  return Ok(());
}

/// An up-to-three-dimensional numeric array, stored row-major (last index
/// fastest), the order `*MWRITE` emits with the KJI label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApdlArray {
  /// Extents along i, j, k. Unused trailing dimensions are 1.
  shape: (usize, usize, usize),
  /// The values, row-major.
  data: Vec<f64>
}

impl ApdlArray {
  /// Builds an array from a shape and row-major values. The value count
  /// must match the shape and no extent may be zero.
  pub fn from_values(
    shape: (usize, usize, usize),
    data: Vec<f64>
  ) -> Result<Self, ApdlError> {
    let (i, j, k) = shape;
    if i == 0 || j == 0 || k == 0 {
      return Err(ApdlError::ParameterValue(
        "array extents must all be at least 1".to_string()
      ));
    }
    if data.len() != i * j * k {
      return Err(ApdlError::ParameterValue(format!(
        "array shape ({}, {}, {}) wants {} values, got {}",
        i, j, k, i * j * k, data.len()
      )));
    }
    return Ok(Self { shape, data });
  }

  /// Builds a one-dimensional array (a vector) from values.
  pub fn vector(data: Vec<f64>) -> Self {
    let shape = (data.len().max(1), 1, 1);
    let data = if data.is_empty() { vec![0.0] } else { data };
    return Self { shape, data };
  }

  /// The array's extents.
  pub fn shape(&self) -> (usize, usize, usize) {
    return self.shape;
  }

  /// Total element count.
  pub fn size(&self) -> usize {
    return self.data.len();
  }

  /// The values in row-major order.
  pub fn values(&self) -> &[f64] {
    return &self.data;
  }

  /// Zero-based element access.
  pub fn get(&self, i: usize, j: usize, k: usize) -> Option<f64> {
    let (idim, jdim, kdim) = self.shape;
    if i >= idim || j >= jdim || k >= kdim {
      return None;
    }
    return Some(self.data[(i * jdim + j) * kdim + k]);
  }

  /// Zero-based element write. Out-of-range indices are ignored.
  pub fn set(&mut self, i: usize, j: usize, k: usize, value: f64) {
    let (idim, jdim, kdim) = self.shape;
    if i < idim && j < jdim && k < kdim {
      self.data[(i * jdim + j) * kdim + k] = value;
    }
  }

  /// The values in column-major (first index fastest) order, the order the
  /// staging file for `*VREAD` uses.
  pub fn ravel_fortran(&self) -> Vec<f64> {
    let (idim, jdim, kdim) = self.shape;
    let mut out = Vec::with_capacity(self.data.len());
    for k in 0..kdim {
      for j in 0..jdim {
        for i in 0..idim {
          out.push(self.data[(i * jdim + j) * kdim + k]);
        }
      }
    }
    return out;
  }
}

impl From<Vec<f64>> for ApdlArray {
  fn from(data: Vec<f64>) -> Self {
    return Self::vector(data);
  }
}

/// A value going into or coming out of the solver's parameter store.
#[derive(Clone, Debug, PartialEq, derive_more::From, Serialize, Deserialize)]
pub enum ParamValue {
  /// A numeric scalar.
  Float(f64),
  /// A character parameter (at most 32 characters, no spaces).
  Character(String),
  /// A numeric array.
  Array(ApdlArray)
}

impl From<&str> for ParamValue {
  fn from(v: &str) -> Self {
    return Self::Character(v.to_string());
  }
}

impl From<i64> for ParamValue {
  fn from(v: i64) -> Self {
    return Self::Float(v as f64);
  }
}

impl From<Vec<f64>> for ParamValue {
  fn from(data: Vec<f64>) -> Self {
    return Self::Array(ApdlArray::vector(data));
  }
}

/// What a `*STATUS` listing tells us about one parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ParamInfo {
  /// A character parameter and its value.
  Character(String),
  /// A numeric scalar and its value.
  Scalar(f64),
  /// An array and its extents.
  Array {
    /// Extents along i, j, k.
    shape: (usize, usize, usize)
  },
  /// A table and its extents.
  Table {
    /// Extents along i, j, k.
    shape: (usize, usize, usize)
  }
}

/// Interprets a `*STATUS` listing. Lines are classified purely by token
/// count and trailing type tag; anything that doesn't match a known shape
/// is skipped without complaint, so headers and rulers fall through
/// harmlessly. Running this twice on the same text yields the same map.
pub fn interp_star_status(status: &str) -> BTreeMap<String, ParamInfo> {
  let mut parameters = BTreeMap::new();
  if status.contains("There are no parameters defined.") {
    return parameters;
  }
  for line in status.lines() {
    let items: Vec<&str> = line.split_whitespace().collect();
    match items.len() {
      2 if items[1].eq_ignore_ascii_case("CHARACTER") => {
        // a character parameter whose value is blank
        parameters.insert(
          items[0].to_string(),
          ParamInfo::Character(String::new())
        );
      }
      3 => {
        if items[2] == "SCALAR" {
          if let Ok(value) = items[1].parse::<f64>() {
            parameters.insert(items[0].to_string(), ParamInfo::Scalar(value));
          }
        } else if items[2].eq_ignore_ascii_case("CHARACTER") {
          parameters.insert(
            items[0].to_string(),
            ParamInfo::Character(items[1].to_string())
          );
        }
      }
      5 => {
        let dims = items[2..5]
          .iter()
          .map(|t| t.parse::<usize>())
          .collect::<Result<Vec<usize>, _>>();
        if let Ok(dims) = dims {
          let shape = (dims[0], dims[1], dims[2]);
          match items[1] {
            "ARRAY" => {
              parameters.insert(
                items[0].to_string(),
                ParamInfo::Array { shape }
              );
            }
            "TABLE" => {
              parameters.insert(
                items[0].to_string(),
                ParamInfo::Table { shape }
              );
            }
            _ => {}
          }
        }
      }
      _ => {}
    }
  }
  return parameters;
}

/// A view over the solver's named parameters, borrowed from a session.
/// Values never live here; every accessor is command round-trips.
pub struct Parameters<'s, T: Transport> {
  /// The session the round trips go through.
  session: &'s mut Session<T>
}

impl<'s, T: Transport> Parameters<'s, T> {
  /// Wraps a session. Usually reached via [`Session::parameters`].
  pub(crate) fn new(session: &'s mut Session<T>) -> Self {
    return Self { session };
  }

  /// Lists every parameter the solver reports via a general `*STATUS`.
  pub fn list(&mut self) -> Result<BTreeMap<String, ParamInfo>, ApdlError> {
    let status = self.session.run("*STATUS")?.unwrap_or_default();
    return Ok(interp_star_status(&status));
  }

  /// Whether the solver has a parameter under this name.
  pub fn contains(&mut self, name: &str) -> Result<bool, ApdlError> {
    return Ok(self.list()?.contains_key(&name.trim().to_uppercase()));
  }

  /// What the listing says about one parameter, if it exists.
  pub fn info(&mut self, name: &str) -> Result<Option<ParamInfo>, ApdlError> {
    let key = name.trim().to_uppercase();
    let status = self
      .session
      .run(&format!("*STATUS,{}", key))?
      .unwrap_or_default();
    return Ok(interp_star_status(&status).remove(&key));
  }

  /// Fetches a parameter. Scalars and characters come straight off the
  /// status listing; arrays and tables are read back element-wise through
  /// `*MWRITE`, with exactly one retry on a transient parse failure.
  pub fn get(&mut self, name: &str) -> Result<ParamValue, ApdlError> {
    let key = name.trim().to_uppercase();
    let info = self
      .info(&key)?
      .ok_or_else(|| ApdlError::MissingParameter(key.clone()))?;
    return match info {
      ParamInfo::Character(value) => Ok(value.into()),
      ParamInfo::Scalar(value) => Ok(value.into()),
      ParamInfo::Array { shape } | ParamInfo::Table { shape } => {
        match self.fetch_array(&key, shape) {
          Ok(arr) => Ok(arr.into()),
          // the formatted dump occasionally comes back garbled; one
          // re-read has always been enough in practice
          Err(ApdlError::ArrayParse(_)) => {
            debug!("array read-back parse failed once, retrying");
            Ok(self.fetch_array(&key, shape)?.into())
          }
          Err(e) => Err(e)
        }
      }
    };
  }

  /// Sets a parameter. Names are vetted locally first; a pre-existing
  /// array under the same name is deleted before a scalar lands on it.
  pub fn set(
    &mut self,
    name: &str,
    value: impl Into<ParamValue>
  ) -> Result<(), ApdlError> {
    let key = name.trim().to_uppercase();
    if self.session.config().check_parameter_names {
      check_parameter_name(&key)?;
    }
    return match value.into() {
      ParamValue::Float(v) => self.set_scalar(&key, &format!("{}", v)),
      ParamValue::Character(v) => {
        if v.contains(' ') {
          return Err(ApdlError::ParameterValue(
            "the solver does not accept spaces in character parameters"
              .to_string()
          ));
        }
        if v.len() >= 32 {
          return Err(ApdlError::ParameterValue(
            "character parameters are at most 32 characters".to_string()
          ));
        }
        self.set_scalar(&key, &format!("'{}'", v))
      }
      ParamValue::Array(arr) => self.set_array(&key, &arr)
    };
  }

  /// Deletes a parameter.
  pub fn delete(&mut self, name: &str) -> Result<(), ApdlError> {
    let key = name.trim().to_uppercase();
    if !self.contains(&key)? {
      return Err(ApdlError::MissingParameter(key));
    }
    self.session.run_muted(&format!("{}=", key))?;
    return Ok(());
  }

  /// Issues the `*SET` for a scalar or character value, clearing any array
  /// previously stored under the name.
  fn set_scalar(&mut self, key: &str, literal: &str) -> Result<(), ApdlError> {
    if let Some(ParamInfo::Array { .. }) = self.info(key)? {
      self.session.run_muted(&format!("*SET,{}", key))?;
    }
    self.session.run_muted(&format!("*SET,{},{}", key, literal))?;
    return Ok(());
  }

  /// Routes an array store through the per-element or file-based strategy
  /// by size.
  fn set_array(&mut self, key: &str, arr: &ApdlArray) -> Result<(), ApdlError> {
    if arr.size() < ARRAY_FILE_THRESHOLD {
      return self.set_array_chain(key, arr);
    }
    return self.set_array_file(key, arr);
  }

  /// Stores a small array as one `*DIM` plus one assignment per element,
  /// all inside a single batch. Deterministic cost, no files involved.
  fn set_array_chain(
    &mut self,
    key: &str,
    arr: &ApdlArray
  ) -> Result<(), ApdlError> {
    let (idim, jdim, kdim) = arr.shape();
    debug!("storing {} elements of {} element-wise", arr.size(), key);
    self.session.non_interactive(|s| {
      s.run(&format!("*DIM,{},,{},{},{}", key, idim, jdim, kdim))?;
      for ((i, j), k) in (0..idim)
        .cartesian_product(0..jdim)
        .cartesian_product(0..kdim) {
        let value = arr.get(i, j, k).unwrap_or_default();
        s.run(&format!("{}({},{},{})={}", key, i + 1, j + 1, k + 1, value))?;
      }
      return Ok(());
    })?;
    return Ok(());
  }

  /// Stores a large array by staging it to a fixed-width text file and
  /// issuing one bulk `*VREAD`. The file is written column-major, which is
  /// the order `*VREAD` fills with the IJK label.
  fn set_array_file(
    &mut self,
    key: &str,
    arr: &ApdlArray
  ) -> Result<(), ApdlError> {
    let (idim, jdim, kdim) = arr.shape();
    debug!("staging {} elements of {} to a file", arr.size(), key);
    // the staging dir must outlive the upload when the solver is remote
    let mut remote_staging: Option<tempfile::TempDir> = None;
    let staging: PathBuf = if self.session.transport().is_local() {
      self.session.transport().directory().join(ARRAY_STAGING_FILE)
    } else {
      let dir = tempfile::tempdir()?;
      let path = dir.path().join(ARRAY_STAGING_FILE);
      remote_staging = Some(dir);
      path
    };
    let mut contents = String::with_capacity(arr.size() * 21);
    for value in arr.ravel_fortran() {
      contents.push_str(&format!("{:>20.12}\n", value));
    }
    fs::write(&staging, contents)?;
    if remote_staging.is_some() {
      self.session.transport_mut().upload(&staging)?;
    }
    self.session.non_interactive(|s| {
      s.run(&format!("*DIM,{},,{},{},{}", key, idim, jdim, kdim))?;
      s.run(&format!(
        "*VREAD,{}(1,1),{},,,IJK,{},{},{}",
        key, ARRAY_STAGING_FILE, idim, jdim, kdim
      ))?;
      s.run("(1F20.12)")?;
      return Ok(());
    })?;
    return Ok(());
  }

  /// Reads an array back via a formatted `*MWRITE` dump into the batch
  /// output, escalating the field width whenever a value overflows its
  /// field and prints as asterisks.
  fn fetch_array(
    &mut self,
    key: &str,
    shape: (usize, usize, usize)
  ) -> Result<ApdlArray, ApdlError> {
    for width in MWRITE_WIDTHS {
      let format_str = format!("(1F{}.12)", width);
      self.session.non_interactive(|s| {
        // KJI emits row-major, matching our storage
        s.run(&format!("*MWRITE,{},,,,KJI", key))?;
        s.run(&format_str)?;
        return Ok(());
      })?;
      let response = self.session.last_response().unwrap_or("").to_string();
      let start = match response.rfind(&format_str) {
        Some(pos) => pos + format_str.len() + 1,
        None => {
          return Err(ApdlError::ArrayParse(
            "format marker absent from the batch output".to_string()
          ));
        }
      };
      let dump = response.get(start..).unwrap_or("");
      if dump.contains("**") {
        debug!("width {} overflowed reading {}, widening", width, key);
        continue;
      }
      let values = dump
        .split_whitespace()
        .map(|t| t.parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|e| ApdlError::ArrayParse(e.to_string()))?;
      return ApdlArray::from_values(shape, values)
        .map_err(|e| ApdlError::ArrayParse(e.to_string()));
    }
    return Err(ApdlError::ArrayParse(format!(
      "the values of {} overflow every supported field width",
      key
    )));
  }
}
