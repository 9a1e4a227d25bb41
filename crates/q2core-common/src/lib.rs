#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp)]

pub mod q_shared;
pub mod qfiles;
pub mod error;
pub mod cvar;
pub mod cmodel;
mod cmtrace;
pub mod pmove;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use error::{CmError, CmResult};
