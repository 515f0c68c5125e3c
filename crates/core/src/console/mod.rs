//! Console drivers: each submodule owns one way of producing a console
//! byte stream and its reconnect discipline.

pub mod ipmi;
pub mod process;
pub mod serial;
pub mod telnet;
pub mod test_dev;
pub mod unixsock;

use crate::{MAX_CONNECT_SECS, MIN_CONNECT_SECS};
use std::time::Duration;

/// Connection state shared by the network-backed drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Down,
    Pending,
    Up,
}

/// Exponential reconnect backoff with stable-connect debounce.
///
/// Each failure consumes the current delay and doubles it up to the
/// ceiling.  Once a connection has stayed up for the debounce interval
/// the delay is reset to zero, so the next drop retries immediately;
/// a drop before the debounce fires keeps the backoff growing, which
/// stops the daemon spinning when something like a TCP wrapper closes
/// the connection right after accept.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    delay_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay_secs: MIN_CONNECT_SECS,
        }
    }

    /// Returns the delay to use for the next reconnect attempt and
    /// advances the schedule.
    pub fn advance(&mut self) -> Duration {
        let current = self.delay_secs;
        if self.delay_secs == 0 {
            self.delay_secs = MIN_CONNECT_SECS;
        } else if self.delay_secs < MAX_CONNECT_SECS {
            self.delay_secs = (self.delay_secs * 2).min(MAX_CONNECT_SECS);
        }
        Duration::from_secs(current)
    }

    /// Stable-connect debounce: the next drop reconnects immediately.
    pub fn reset(&mut self) {
        self.delay_secs = 0;
    }

    #[must_use]
    pub fn current_secs(&self) -> u64 {
        self.delay_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_ceiling() {
        let mut backoff = Backoff::new();
        let mut seen = Vec::new();
        for _ in 0..12 {
            seen.push(backoff.advance().as_secs());
        }
        assert_eq!(
            seen,
            vec![4, 8, 16, 32, 64, 128, 256, 512, 1024, 1800, 1800, 1800]
        );
    }

    #[test]
    fn debounce_reset_gives_an_immediate_retry_then_restarts() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.advance();
        }
        backoff.reset();
        assert_eq!(backoff.advance(), Duration::from_secs(0));
        assert_eq!(backoff.advance(), Duration::from_secs(4));
        assert_eq!(backoff.advance(), Duration::from_secs(8));
    }
}
