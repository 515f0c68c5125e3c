//! Synthetic test consoles for soak-testing the multiplexer.
//!
//! Entirely timer-driven: each tick optionally produces a burst of
//! printable bytes (a counter cycling 0x20..=0x7E) which the reactor
//! fans out to readers, then schedules the next tick.  A burst larger
//! than the staging buffer continues on a zero-delay timer.  The fd is
//! a write-only handle on `/dev/null` so the drain path has somewhere
//! to put client input.

use crate::object::ObjectId;
use crate::timer::TimerId;
use crate::{fdio, OBJ_BUF_SIZE};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

const FIRST_CHAR: u8 = 0x20;
const LAST_CHAR: u8 = 0x7e;
const DEFAULT_BYTES: usize = 1024;
const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// Staging bound per tick; matches the reactor's read scratch so a
/// sanitising logfile can never overflow its ring.
const BURST_MAX: usize = (OBJ_BUF_SIZE / 2) - 1;

/// `TESTOPTS`: comma-separated `X:value` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOptions {
    /// Bytes per burst (`B:`).
    pub num_bytes: usize,
    /// Maximum inter-burst delay in milliseconds (`M:`).
    pub msec_max: Option<u64>,
    /// Minimum inter-burst delay in milliseconds (`N:`).
    pub msec_min: Option<u64>,
    /// Percent probability of producing a burst per tick (`P:`).
    pub probability: u8,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            num_bytes: DEFAULT_BYTES,
            msec_max: None,
            msec_min: None,
            probability: 100,
        }
    }
}

impl TestOptions {
    pub fn parse(defaults: Self, s: &str) -> Result<Self, String> {
        let mut opts = defaults;
        for tok in s.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            let (tag, value) = match tok.split_at_checked(2) {
                Some((head, value)) if head.as_bytes()[1] == b':' => {
                    (head.as_bytes()[0].to_ascii_uppercase(), value)
                }
                _ => return Err(format!("invalid testopts value \"{tok}\"")),
            };
            let n: u64 = value
                .parse()
                .map_err(|_| format!("invalid testopts value \"{tok}\""))?;
            match tag {
                b'B' => opts.num_bytes = n as usize,
                b'M' => opts.msec_max = Some(n),
                b'N' => opts.msec_min = Some(n),
                b'P' => opts.probability = n.min(100) as u8,
                _ => return Err(format!("invalid testopts tag '{}'", tag as char)),
            }
        }
        Ok(opts)
    }
}

/// Small xorshift generator for the probability gate and delay jitter;
/// statistical quality is irrelevant here.
#[derive(Debug, Clone, Copy)]
pub struct XorShift32(u32);

impl XorShift32 {
    #[must_use]
    pub fn seeded() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x9e37_79b9, |d| d.subsec_nanos());
        Self(nanos | 1)
    }

    pub fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// Variant payload for a test console object.
pub struct TestState {
    pub opts: TestOptions,
    pub logfile: Option<ObjectId>,
    pub timer: Option<TimerId>,
    bytes_left: usize,
    last_char: u8,
    rng: XorShift32,
}

impl TestState {
    #[must_use]
    pub fn new(opts: TestOptions) -> Self {
        Self {
            opts,
            logfile: None,
            timer: None,
            bytes_left: 0,
            last_char: FIRST_CHAR,
            rng: XorShift32::seeded(),
        }
    }

    /// Produces the bytes for one tick: `None` when the probability
    /// gate skips this burst.  Also returns the delay until the next
    /// tick (zero when a burst still has bytes to continue).
    pub fn tick(&mut self) -> (Option<Vec<u8>>, Duration) {
        let burst = if self.bytes_left > 0
            || u64::from(self.opts.probability) > u64::from(self.rng.next() % 100)
        {
            if self.bytes_left == 0 {
                self.bytes_left = self.opts.num_bytes;
            }
            let n = self.bytes_left.min(BURST_MAX);
            let mut buf = Vec::with_capacity(n);
            for _ in 0..n {
                self.last_char = if self.last_char >= LAST_CHAR {
                    FIRST_CHAR + 1
                } else {
                    self.last_char + 1
                };
                buf.push(self.last_char);
            }
            self.bytes_left -= n;
            Some(buf)
        } else {
            None
        };

        let delay = if self.bytes_left > 0 {
            Duration::ZERO
        } else {
            match (self.opts.msec_min, self.opts.msec_max) {
                (_, None) => DEFAULT_DELAY,
                (None, Some(max)) => Duration::from_millis(max),
                (Some(min), Some(max)) if min >= max => Duration::from_millis(max),
                (Some(min), Some(max)) => {
                    let interval = max - min + 1;
                    Duration::from_millis(min + u64::from(self.rng.next()) % interval)
                }
            }
        };
        (burst, delay)
    }
}

/// Opens the `/dev/null` sink backing a test console's drain path.
pub fn open_sink() -> io::Result<OwnedFd> {
    let file = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    fdio::set_nonblocking(file.as_raw_fd())?;
    fdio::set_cloexec(file.as_raw_fd())?;
    Ok(file.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_all_tags() {
        let opts = TestOptions::parse(TestOptions::default(), "B:64,M:500,N:100,P:150")
            .expect("parses");
        assert_eq!(opts.num_bytes, 64);
        assert_eq!(opts.msec_max, Some(500));
        assert_eq!(opts.msec_min, Some(100));
        assert_eq!(opts.probability, 100); // clamped
    }

    #[test]
    fn options_reject_bad_tags_and_values() {
        assert!(TestOptions::parse(TestOptions::default(), "Q:1").is_err());
        assert!(TestOptions::parse(TestOptions::default(), "B:many").is_err());
        assert!(TestOptions::parse(TestOptions::default(), "B").is_err());
    }

    #[test]
    fn bursts_cycle_through_the_printable_range() {
        let opts = TestOptions {
            num_bytes: 200,
            probability: 100,
            ..TestOptions::default()
        };
        let mut state = TestState::new(opts);
        let (burst, delay) = state.tick();
        let burst = burst.expect("always produces at probability 100");
        assert_eq!(burst.len(), 200);
        assert!(burst.iter().all(|b| (FIRST_CHAR..=LAST_CHAR).contains(b)));
        assert_eq!(delay, DEFAULT_DELAY);
        // 0x21 follows the initial counter value, then wraps after 0x7e.
        assert_eq!(burst[0], FIRST_CHAR + 1);
        let wrap_at = usize::from(LAST_CHAR - FIRST_CHAR) - 1;
        assert_eq!(burst[wrap_at], LAST_CHAR);
        assert_eq!(burst[wrap_at + 1], FIRST_CHAR + 1);
    }

    #[test]
    fn oversized_bursts_continue_on_a_zero_delay() {
        let opts = TestOptions {
            num_bytes: BURST_MAX + 10,
            probability: 100,
            ..TestOptions::default()
        };
        let mut state = TestState::new(opts);
        let (burst, delay) = state.tick();
        assert_eq!(burst.expect("burst").len(), BURST_MAX);
        assert_eq!(delay, Duration::ZERO);
        let (burst, delay) = state.tick();
        assert_eq!(burst.expect("continuation").len(), 10);
        assert_ne!(delay, Duration::ZERO);
    }

    #[test]
    fn zero_probability_never_bursts() {
        let opts = TestOptions {
            probability: 0,
            ..TestOptions::default()
        };
        let mut state = TestState::new(opts);
        for _ in 0..32 {
            let (burst, _) = state.tick();
            assert!(burst.is_none());
        }
    }

    #[test]
    fn delay_jitter_stays_within_bounds() {
        let opts = TestOptions {
            num_bytes: 1,
            msec_min: Some(10),
            msec_max: Some(20),
            probability: 100,
            ..TestOptions::default()
        };
        let mut state = TestState::new(opts);
        for _ in 0..64 {
            let (_, delay) = state.tick();
            let ms = delay.as_millis();
            assert!((10..=20).contains(&ms), "delay {ms}ms out of range");
        }
    }

    #[test]
    fn dev_null_sink_accepts_writes() {
        let fd = open_sink().expect("open");
        assert_eq!(crate::fdio::write(fd.as_raw_fd(), b"xyz").expect("write"), 3);
    }
}
