//! Shared foundation for the XRootD client crates: logging, client
//! environment, status plumbing and wall-clock helpers.

pub mod env;
pub mod logging;
pub mod status;
pub mod time;
