//! Re-exports the types most users of this library will want in scope.

pub use crate::errors::ApdlError;
pub use crate::params::{
  ApdlArray, ParamInfo, ParamValue, Parameters, check_parameter_name,
  interp_star_status
};
pub use crate::session::{Routine, Session, SessionConfig};
pub use crate::transport::Transport;
