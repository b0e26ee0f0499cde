//! Probe send/receive machinery.
//!
//! The sender and scheduler run in the session task, the listener on its own
//! thread. The two sides meet only at the shared [`tracker::ProbeTracker`].

pub mod listener;
pub mod scheduler;
pub mod sender;
pub mod tracker;
pub mod transport;

pub use listener::{FrameDisposition, ListenError, ReplyListener};
pub use scheduler::Scheduler;
pub use sender::{PreparedProbe, ProbeError, ProbeSender};
pub use tracker::{new_shared_tracker, PendingProbe, ProbeTracker, SharedTracker};
pub use transport::{FrameInjector, FrameSource, MockFrameSource, MockTransport, Transport};

#[cfg(target_os = "linux")]
pub use transport::{RawListenSocket, RawTransport};
