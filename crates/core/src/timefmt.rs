//! Wall-clock strings for banners and informational messages.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const SHORT_FMT: &[FormatItem<'static>] = format_description!("[month]-[day] [hour]:[minute]");
const LONG_FMT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `MM-DD HH:MM`, used in join/depart/reset announcements.
#[must_use]
pub fn short_time() -> String {
    now()
        .format(&SHORT_FMT)
        .unwrap_or_else(|_| String::from("??-?? ??:??"))
}

/// `YYYY-MM-DD HH:MM:SS`, used in logfile banners.
#[must_use]
pub fn long_time() -> String {
    now()
        .format(&LONG_FMT)
        .unwrap_or_else(|_| String::from("????-??-?? ??:??:??"))
}

/// Compact elapsed-time rendering: seconds always, then each larger unit
/// only once it is non-zero (`12s`, `5m12s`, `2h5m12s`, `3d…`, `1w…`,
/// `2y…`).
#[must_use]
pub fn delta_string(elapsed_secs: u64) -> String {
    let mut n = elapsed_secs;
    let seconds = n % 60;
    n /= 60;
    let minutes = n % 60;
    n /= 60;
    let hours = n % 24;
    n /= 24;
    let days = n % 7;
    n /= 7;
    let weeks = n % 52;
    n /= 52;
    let years = n;

    if years > 0 {
        format!("{years}y{weeks}w{days}d{hours}h{minutes}m{seconds}s")
    } else if weeks > 0 {
        format!("{weeks}w{days}d{hours}h{minutes}m{seconds}s")
    } else if days > 0 {
        format!("{days}d{hours}h{minutes}m{seconds}s")
    } else if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_renders_each_magnitude() {
        assert_eq!(delta_string(0), "0s");
        assert_eq!(delta_string(59), "59s");
        assert_eq!(delta_string(60), "1m0s");
        assert_eq!(delta_string(3600 + 61), "1h1m1s");
        assert_eq!(delta_string(86400 * 3 + 2 * 3600), "3d2h0m0s");
        assert_eq!(delta_string(86400 * 7), "1w0d0h0m0s");
        assert_eq!(delta_string(86400 * 7 * 52), "1y0w0d0h0m0s");
    }

    #[test]
    fn long_time_has_date_and_clock() {
        let s = long_time();
        assert_eq!(s.len(), 19);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[13..14], ":");
    }
}
