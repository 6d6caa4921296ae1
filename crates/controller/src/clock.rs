//! Wall-clock sources.

#[cfg(test)]
use std::sync::{Arc, Mutex};

use chrono::{Offset, TimeZone};
use chrono_tz::Tz;
#[cfg(test)]
use time::Duration;
use time::{OffsetDateTime, UtcOffset};

use crate::ports::Clock;

/// Where local wall time comes from.
///
/// `time` cannot safely query the OS offset once the runtime has spawned
/// worker threads, so the zone is named in the deployment config instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalZone {
    Fixed(UtcOffset),
    /// IANA zone; the offset follows its daylight-saving rules.
    Named(Tz),
}

impl LocalZone {
    /// Offset in effect at the instant `at`.
    pub fn offset_at(&self, at: OffsetDateTime) -> UtcOffset {
        match self {
            Self::Fixed(offset) => *offset,
            Self::Named(tz) => {
                let Some(utc) = chrono::DateTime::from_timestamp(at.unix_timestamp(), 0) else {
                    return UtcOffset::UTC;
                };
                let secs = tz
                    .offset_from_utc_datetime(&utc.naive_utc())
                    .fix()
                    .local_minus_utc();
                UtcOffset::from_whole_seconds(secs).unwrap_or(UtcOffset::UTC)
            }
        }
    }

    pub fn to_local(&self, at: OffsetDateTime) -> OffsetDateTime {
        at.to_offset(self.offset_at(at))
    }
}

/// System time in the configured zone.  The offset is looked up on every
/// call so a running controller crosses DST changes.
pub struct SystemClock {
    zone: LocalZone,
}

impl SystemClock {
    pub fn new(zone: LocalZone) -> Self {
        Self { zone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        self.zone.to_local(OffsetDateTime::now_utc())
    }
}

/// Hand-driven clock for tests.  Clones share the same instant.
#[cfg(test)]
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}
