//! Run-time arithmetic for delayed and recurring jobs.
//!
//! A [`Scheduler`] starts at "now" in a configured timezone and is moved
//! forward with calendar units. `at("HH:MM[:SS]")` pins the wall-clock time of
//! day in that timezone.
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use taskq_core::jobs::Scheduler;
//!
//! let now = Utc.with_ymd_and_hms(2024, 1, 31, 9, 15, 0).unwrap();
//! let next = Scheduler::new(now, chrono_tz::UTC).month(1).at("03:00").unwrap();
//! assert_eq!(next.time(), Utc.with_ymd_and_hms(2024, 2, 29, 3, 0, 0).unwrap());
//! ```

use chrono::{DateTime, Days, Duration, LocalResult, Months, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{QueueError, Result};
use crate::jobs::clock::Clock;

/// A point in time being built up from "now" in a timezone.
///
/// Values are cheap to clone; every enqueue works on its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduler {
    instant: DateTime<Tz>,
}

impl Scheduler {
    pub fn new(now: DateTime<Utc>, timezone: Tz) -> Self {
        Self {
            instant: now.with_timezone(&timezone),
        }
    }

    pub fn from_clock(clock: &dyn Clock, timezone: Tz) -> Self {
        Self::new(clock.now(), timezone)
    }

    pub fn timezone(&self) -> Tz {
        self.instant.timezone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Units
    // ─────────────────────────────────────────────────────────────────────────

    pub fn minute(self, n: u32) -> Self {
        self.shifted(Duration::minutes(i64::from(n)))
    }

    pub fn hour(self, n: u32) -> Self {
        self.shifted(Duration::hours(i64::from(n)))
    }

    /// Elapsed-time step; the instant is left unchanged past the calendar range.
    fn shifted(mut self, by: Duration) -> Self {
        if let Some(next) = self.instant.checked_add_signed(by) {
            self.instant = next;
        }
        self
    }

    /// Calendar days: the local wall-clock time is kept across DST changes.
    pub fn day(self, n: u32) -> Self {
        let local = self.local();
        match local.checked_add_days(Days::new(u64::from(n))) {
            Some(next) => self.relocated(next),
            None => self,
        }
    }

    pub fn week(self, n: u32) -> Self {
        self.day(n.saturating_mul(7))
    }

    /// Calendar months; the day of month is clamped to the target month's end.
    pub fn month(self, n: u32) -> Self {
        let local = self.local();
        match local.checked_add_months(Months::new(n)) {
            Some(next) => self.relocated(next),
            None => self,
        }
    }

    pub fn year(self, n: u32) -> Self {
        self.month(n.saturating_mul(12))
    }

    /// Pin the time of day, `HH:MM` or `HH:MM:SS`, in the scheduler's timezone.
    pub fn at(self, time: &str) -> Result<Self> {
        let pinned = parse_time_of_day(time)?;
        let naive = self.local().date().and_time(pinned);

        match self.timezone().from_local_datetime(&naive) {
            LocalResult::Single(instant) => Ok(Self { instant }),
            LocalResult::Ambiguous(earliest, _) => Ok(Self { instant: earliest }),
            LocalResult::None => Err(QueueError::invalid_argument(format!(
                "{} does not exist on {} in {}",
                time,
                naive.date(),
                self.timezone()
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Results
    // ─────────────────────────────────────────────────────────────────────────

    /// The scheduled instant.
    pub fn time(&self) -> DateTime<Utc> {
        self.instant.with_timezone(&Utc)
    }

    /// The scheduled instant, but never earlier than `initial`.
    pub fn period(&self, initial: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let time = self.time();
        match initial {
            Some(floor) if floor > time => floor,
            _ => time,
        }
    }

    fn local(&self) -> NaiveDateTime {
        self.instant.naive_local()
    }

    /// Re-anchor a local wall-clock time in the timezone. Times skipped by a
    /// DST gap move forward by the gap.
    fn relocated(self, naive: NaiveDateTime) -> Self {
        let tz = self.timezone();
        let resolved = match tz.from_local_datetime(&naive) {
            LocalResult::Single(instant) | LocalResult::Ambiguous(instant, _) => Some(instant),
            LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest(),
        };
        match resolved {
            Some(instant) => Self { instant },
            None => self,
        }
    }
}

fn parse_time_of_day(text: &str) -> Result<NaiveTime> {
    let invalid = || {
        QueueError::invalid_argument(format!(
            "invalid time of day '{}', expected HH:MM or HH:MM:SS",
            text
        ))
    };

    let parts: Vec<&str> = text.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid());
    }

    let mut fields = [0u32; 3];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *slot = part.parse().map_err(|_| invalid())?;
    }

    let [hour, minute, second] = fields;
    if hour > 23 || minute > 59 || second > 59 {
        return Err(invalid());
    }
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid)
}
