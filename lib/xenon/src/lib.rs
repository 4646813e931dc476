//! Core networking subsystem of the XRootD client: URL resolution, message
//! framing, stream multiplexing and the post-master channel registry.

pub mod any;
pub mod channel;
pub mod inqueue;
pub mod message;
pub mod monitor;
pub mod poller;
pub mod postmaster;
pub mod protocol;
pub mod sid;
pub mod socket;
pub mod stream;
pub mod task;
pub mod transport;
pub mod url;

pub use crate::message::Message;
pub use crate::postmaster::PostMaster;
pub use crate::url::URL;
pub use photon::status::{Code, Severity, Status};
