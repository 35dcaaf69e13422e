//! Wall-clock access and profile-local day arithmetic.
//!
//! Profiles store their timezone as `"GMT±H[:MM]"`; all timestamps are unix
//! seconds.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Timelike, Utc};

use crate::error::EngineError;

pub const MINUTE: i64 = 60;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;

pub trait Clock: Send + Sync {
    /// Current unix time in seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Parses `"GMT+8"`, `"GMT-3:30"`, `"GMT+05:45"`. An empty string is UTC.
pub fn parse_timezone(tz: &str) -> Result<FixedOffset, EngineError> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("GMT") || tz.eq_ignore_ascii_case("UTC") {
        return Ok(utc_offset());
    }
    let rest = tz
        .strip_prefix("GMT")
        .or_else(|| tz.strip_prefix("UTC"))
        .ok_or_else(|| EngineError::invalid(format!("malformed timezone: {tz:?}")))?;

    let (sign, digits) = match rest.as_bytes().first() {
        Some(b'+') => (1, &rest[1..]),
        Some(b'-') => (-1, &rest[1..]),
        _ => return Err(EngineError::invalid(format!("malformed timezone: {tz:?}"))),
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None => (digits, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| EngineError::invalid(format!("malformed timezone: {tz:?}")))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| EngineError::invalid(format!("malformed timezone: {tz:?}")))?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(EngineError::invalid(format!("timezone out of range: {tz:?}")));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| EngineError::invalid(format!("timezone out of range: {tz:?}")))
}

pub fn utc_offset() -> FixedOffset {
    Utc.fix()
}

fn local(ts: i64, tz: FixedOffset) -> DateTime<FixedOffset> {
    DateTime::from_timestamp(ts, 0)
        .unwrap_or_default()
        .with_timezone(&tz)
}

/// Unix time of 00:00 local on the day containing `ts`.
pub fn local_midnight(ts: i64, tz: FixedOffset) -> i64 {
    let day = local(ts, tz).date_naive().and_time(NaiveTime::MIN);
    day.and_utc().timestamp() - tz.local_minus_utc() as i64
}

/// Seconds since local midnight; `local_seconds(ts) / HOUR` is the local hour.
pub fn local_seconds(ts: i64, tz: FixedOffset) -> i64 {
    ts - local_midnight(ts, tz)
}

pub fn local_hour(ts: i64, tz: FixedOffset) -> u32 {
    local(ts, tz).hour()
}

pub fn same_local_day(a: i64, b: i64, tz: FixedOffset) -> bool {
    local_midnight(a, tz) == local_midnight(b, tz)
}

/// `[00:00, 24:00)` of the local day containing `ts`.
pub fn day_window(ts: i64, tz: FixedOffset) -> (i64, i64) {
    let start = local_midnight(ts, tz);
    (start, start + DAY)
}
