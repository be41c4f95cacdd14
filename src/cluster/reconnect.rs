//! Reconnect bookkeeping for the cluster link.
//!
//! Pure state; the socket task owns the timer itself.

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Reconnect at this instant.
    Schedule(Instant),
    /// A reconnect is already queued; nothing new was scheduled.
    AlreadyPending,
    /// The link was closed locally; never reconnect.
    Stopped,
}

#[derive(Debug)]
pub struct Reconnector {
    delay: Duration,
    pending: Option<Instant>,
    closed_by_user: bool,
}

impl Reconnector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
            closed_by_user: false,
        }
    }

    /// The connection went away.
    pub fn on_closed(&mut self, now: Instant) -> Decision {
        if self.closed_by_user {
            return Decision::Stopped;
        }
        if self.pending.is_some() {
            return Decision::AlreadyPending;
        }
        let at = now + self.delay;
        self.pending = Some(at);
        Decision::Schedule(at)
    }

    /// The pending timer elapsed. Returns whether to connect again.
    pub fn fire(&mut self) -> bool {
        self.pending.take().is_some() && !self.closed_by_user
    }

    /// Local close: cancel anything pending and stay down.
    pub fn close(&mut self) {
        self.closed_by_user = true;
        self.pending = None;
    }

    pub fn pending(&self) -> Option<Instant> {
        self.pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed_by_user
    }
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}
