//! Keeps one process alive behind a Unix socket so clients can come and go.
//!
//! `spawn` runs the daemon side; `link` is the attaching client. On connect
//! the daemon sends the process's stdout, stderr and status descriptors, and
//! the client streams [`Input`] frames back for stdin.

mod frame;
pub mod handoff;
mod link;
mod spawn;

pub use frame::{Input, read_frames, write_frame};
pub use handoff::{Handoff, Listener};
pub use link::Link;
pub use spawn::{Broker, listen};
