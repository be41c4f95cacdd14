//! Conditions that end the instance.
//!
//! Subsystems never exit the process themselves; they send a [`Fatal`] and
//! the instance run loop decides.

use std::fmt;

use tokio::sync::mpsc;

use crate::supervisor::process::{ExitInfo, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    /// A supervised process could not be brought up.
    StartFailed { reason: String },
    /// A supervised process died after it became ready.
    ProcessExited { role: Role, pid: u32, exit: ExitInfo },
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::StartFailed { reason } => write!(f, "startup failed: {reason}"),
            Fatal::ProcessExited { role, pid, exit } => {
                write!(f, "{role} (pid {pid}) exited with {exit}")
            }
        }
    }
}

pub type FatalSender = mpsc::UnboundedSender<Fatal>;
pub type FatalReceiver = mpsc::UnboundedReceiver<Fatal>;

pub fn channel() -> (FatalSender, FatalReceiver) {
    mpsc::unbounded_channel()
}
