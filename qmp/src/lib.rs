//! Client side of the QEMU Machine Protocol spoken by qemu-storage-daemon.
//!
//! A [`QmpSession`] owns one unix socket connection. Commands are sent as
//! `{"execute": ..., "arguments": ..., "id": n}` lines and matched to their
//! reply by `id`; asynchronous events are fanned out to every subscriber of
//! the session. [`QmpTransport`] keeps one session per process alive and
//! reconnects when the daemon drops it.

pub mod command;
mod error;
pub mod event;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod query;
mod session;
mod transport;

pub use command::Command;
pub use error::{QmpError, ReplyError};
pub use event::{Event, EventStream, JobStatus};
pub use session::QmpSession;
pub use transport::{QmpTransport, Transport};
