#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Correspondence search between a source cloud and an indexed target.
pub mod correspondence;

/// Per-point covariance estimation for generalized ICP.
pub mod covariance;

mod error;
pub use error::{EstimationError, RegistrationError};

/// Transformation estimators: point-to-point, point-to-plane, colored and generalized.
pub mod estimation;

pub mod global;

mod icp;
pub use icp::*;

/// Flat-array k-d tree for nearest neighbor queries.
pub mod kdtree;

mod multiscale;
pub use multiscale::*;

mod result;
pub use result::*;

pub mod robust;
