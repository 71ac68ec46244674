//! gvshim shared types
//!
//! This crate contains the task-control wire types, the error taxonomy and
//! the event payloads used by both the shim (`gvshim`) and clients of its
//! control socket.

pub mod api;
pub mod constants;
pub mod errors;
pub mod events;
pub mod transport;

pub use errors::{ErrorKind, ShimError, ShimResult};
pub use events::TaskEvent;
pub use transport::Transport;

// Task-control protocol
pub use api::*;
