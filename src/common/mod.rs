//! Shared utilities (errors, address codec, socket tuning)

pub mod error;
pub mod net;

pub use error::{DialError, Error, Result};
pub use net::{split_host_port, Address};
