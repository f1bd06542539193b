//! Wake-up signal for the demux read loop.
//!
//! The read loop sleeps for short periods when its queues are full or the
//! source has nothing to give. Two independent reasons can cut that sleep
//! short: a decoder drained its packet queue ("room"), or the controller
//! posted a command such as a seek or shutdown ("command").

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Why [`ReadWakeup::wait_timeout`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Room,
    Command,
    Timeout,
}

#[derive(Debug, Default)]
struct Pending {
    room: bool,
    command: bool,
}

#[derive(Debug, Default)]
pub struct ReadWakeup {
    pending: Mutex<Pending>,
    cond: Condvar,
}

impl ReadWakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer drained its queue.
    pub fn notify_room(&self) {
        let mut pending = self.pending.lock();
        pending.room = true;
        self.cond.notify_all();
    }

    /// A control request is waiting for the read loop.
    pub fn notify_command(&self) {
        let mut pending = self.pending.lock();
        pending.command = true;
        self.cond.notify_all();
    }

    /// Sleep until notified or `timeout` elapses. A pending command takes
    /// precedence over pending room; both flags are consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> WakeReason {
        let mut pending = self.pending.lock();
        if !pending.room && !pending.command {
            self.cond.wait_for(&mut pending, timeout);
        }
        let reason = if pending.command {
            WakeReason::Command
        } else if pending.room {
            WakeReason::Room
        } else {
            WakeReason::Timeout
        };
        *pending = Pending::default();
        reason
    }
}
