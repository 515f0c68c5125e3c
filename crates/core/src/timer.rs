//! Timer wheel: an ordered list of absolute-deadline events.
//!
//! Insertion splices before the first entry with a strictly later
//! deadline, so equal deadlines dispatch in arm order.  Dispatch pops
//! due entries off the head one at a time, letting the handler arm or
//! cancel further timers between pops.  The population stays in the
//! tens-to-low-hundreds, so the O(n) insert/cancel of a sorted vector
//! is the right trade (a heap would fit behind the same interface).

use crate::object::ObjectId;
use std::time::{Duration, Instant};

/// Non-zero timer handle.  Ids increase monotonically and wrap past
/// zero, which is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u32);

/// What to do when a timer fires.  The reactor owns every object, so
/// events name their target rather than capturing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Drive a down console's reconnect attempt.
    Reconnect(ObjectId),
    /// The connection stayed up for the debounce interval; zero the
    /// reconnect backoff.
    ResetBackoff(ObjectId),
    /// Produce the next burst from a test console.
    TestTick(ObjectId),
    /// Write the periodic timestamp banner into every logfile.
    LogTimestamp,
    /// A reset command exceeded its time limit; kill its process group.
    KillResetCmd { pgid: i32 },
    /// Safety re-check of a pending IPMI connect in case the engine
    /// never called back.
    IpmiRecheck(ObjectId),
}

struct Timer {
    id: TimerId,
    deadline: Instant,
    event: TimerEvent,
}

pub struct TimerWheel {
    timers: Vec<Timer>,
    next_id: u32,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
        }
    }

    fn take_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    /// Arms a timer at an absolute deadline.
    pub fn arm_at(&mut self, deadline: Instant, event: TimerEvent) -> TimerId {
        let id = self.take_id();
        let pos = self
            .timers
            .iter()
            .position(|t| t.deadline > deadline)
            .unwrap_or(self.timers.len());
        self.timers.insert(
            pos,
            Timer {
                id,
                deadline,
                event,
            },
        );
        id
    }

    /// Arms a timer `delay` from now.
    pub fn arm_in(&mut self, delay: Duration, event: TimerEvent) -> TimerId {
        self.arm_at(Instant::now() + delay, event)
    }

    /// Cancels a timer.  Returns true if it was still armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|t| t.id == id) {
            Some(pos) => {
                self.timers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Pops the next due event, if any.  Call repeatedly until `None`;
    /// events armed during handling with already-passed deadlines are
    /// picked up by the same drain.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        if self.timers.first()?.deadline > now {
            return None;
        }
        Some(self.timers.remove(0).event)
    }

    /// Deadline of the next timer to fire.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.first().map(|t| t.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
