//! Irrigation parameters, rain-delay state and the persisted schedule record.
//!
//! ## Record layout
//!
//! ```text
//! offset  field              range
//! 0       validity marker    0x00 valid, anything else invalid
//! 1       start hour         0-23
//! 2       start minute       0-59
//! 3       start second       0-59
//! 4       period hours       multiple of 6, <= 24
//! 5       duration minutes   0-255
//! ```
//!
//! Only the time-of-day, period and duration survive a restart.  Rain delay
//! is volatile.

use std::fmt;

use thiserror::Error;
use time::{Duration, OffsetDateTime, Time};
use tracing::{info, warn};

use crate::ports::RecordStore;

pub const RECORD_LEN: usize = 6;

const MARKER_VALID: u8 = 0x00;

/// Value of every byte in a never-written store.
pub const ERASED: u8 = 0xFF;

/// Compiled-in defaults, used until a valid record is restored.
pub const DEFAULT_START: Time = time::macros::time!(07:00:00);
pub const DEFAULT_PERIOD_HOURS: u8 = 12;
pub const DEFAULT_DURATION_MINUTES: u8 = 45;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record marker {0:#04x} is not valid; schedule was never saved")]
    NotSaved(u8),
    #[error("record holds invalid start time {0:02}:{1:02}:{2:02}")]
    StartTime(u8, u8, u8),
    #[error("record holds invalid period {0} h")]
    Period(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed start time '{0}' (expected HH:MM:SS)")]
pub struct StartTimeError(pub String);

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    start: Time,
    period_hours: u8,
    duration_minutes: u8,
    rain_delay_hours: u32,
    rain_delay_resume: OffsetDateTime,
}

impl ScheduleConfig {
    /// Build a config with no rain delay in effect at `now`.
    pub fn new(start: Time, period_hours: u8, duration_minutes: u8, now: OffsetDateTime) -> Self {
        Self {
            start,
            period_hours,
            duration_minutes,
            rain_delay_hours: 0,
            rain_delay_resume: now - Duration::SECOND,
        }
    }

    pub fn with_defaults(now: OffsetDateTime) -> Self {
        Self::new(
            DEFAULT_START,
            DEFAULT_PERIOD_HOURS,
            DEFAULT_DURATION_MINUTES,
            now,
        )
    }

    // -- accessors ----------------------------------------------------------

    pub fn start_time(&self) -> Time {
        self.start
    }

    pub fn period_hours(&self) -> u8 {
        self.period_hours
    }

    pub fn duration_minutes(&self) -> u8 {
        self.duration_minutes
    }

    pub fn period(&self) -> Duration {
        Duration::hours(i64::from(self.period_hours))
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn rain_delay_hours(&self) -> u32 {
        self.rain_delay_hours
    }

    pub fn rain_delay_resume(&self) -> OffsetDateTime {
        self.rain_delay_resume
    }

    // -- setters ------------------------------------------------------------

    /// Parse and store an `HH:MM:SS` time of day.  On error the previous
    /// value is kept.
    pub fn set_start_time(&mut self, hhmmss: &str) -> Result<(), StartTimeError> {
        self.start = parse_start_time(hhmmss)?;
        Ok(())
    }

    /// Stored as given.  Range checks only happen on [`restore`](Self::restore).
    pub fn set_period_hours(&mut self, hours: u8) {
        self.period_hours = hours;
    }

    /// Stored as given.  Range checks only happen on [`restore`](Self::restore).
    pub fn set_duration_minutes(&mut self, minutes: u8) {
        self.duration_minutes = minutes;
    }

    /// `0` clears the delay by moving the resume instant one second into the
    /// past.
    pub fn set_rain_delay(&mut self, hours: u32, now: OffsetDateTime) {
        self.rain_delay_hours = hours;
        self.rain_delay_resume = if hours == 0 {
            now - Duration::SECOND
        } else {
            now + Duration::hours(i64::from(hours))
        };
    }

    pub fn is_rain_delay_active(&self) -> bool {
        self.rain_delay_hours > 0
    }

    /// Drop a delay the scheduler no longer honours.  Returns `true` when a
    /// delay was actually cleared.
    pub fn expire_rain_delay(&mut self, now: OffsetDateTime) -> bool {
        if self.rain_delay_hours > 0 && !rain_delay_in_effect(self, now) {
            self.set_rain_delay(0, now);
            true
        } else {
            false
        }
    }

    /// Today's date at the configured start time.
    pub fn today_start_instant(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.replace_time(self.start)
    }

    // -- persistence ----------------------------------------------------------

    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        [
            MARKER_VALID,
            self.start.hour(),
            self.start.minute(),
            self.start.second(),
            self.period_hours,
            self.duration_minutes,
        ]
    }

    /// Apply a raw record.  The start time and the period/duration pair are
    /// validated independently; fields that fail keep their current values.
    /// Every failure is returned so the caller can log all of them.
    pub fn apply_record(&mut self, record: &[u8; RECORD_LEN]) -> Vec<RecordError> {
        let [marker, hour, minute, second, period, duration] = *record;
        if marker != MARKER_VALID {
            return vec![RecordError::NotSaved(marker)];
        }

        let mut errors = Vec::new();

        match Time::from_hms(hour, minute, second) {
            Ok(start) => self.start = start,
            Err(_) => errors.push(RecordError::StartTime(hour, minute, second)),
        }

        if period % 6 == 0 && period <= 24 {
            self.period_hours = period;
            self.duration_minutes = duration;
        } else {
            errors.push(RecordError::Period(period));
        }

        errors
    }

    pub fn persist(&self, store: &mut dyn RecordStore) -> anyhow::Result<()> {
        info!(schedule = %self, "saving schedule record");
        store.write_record(&self.to_record())
    }

    /// Load the stored record.  Never fails: unreadable or invalid data is
    /// logged and the affected fields stay at their current values.
    pub fn restore(&mut self, store: &mut dyn RecordStore) {
        let record = match store.read_record() {
            Ok(r) => r,
            Err(e) => {
                warn!("schedule record unreadable, keeping defaults: {e:#}");
                return;
            }
        };

        let errors = self.apply_record(&record);
        if errors.is_empty() {
            info!(schedule = %self, "schedule restored from store");
        }
        for e in errors {
            warn!("restore: {e}");
        }
    }
}

impl fmt::Display for ScheduleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start {}, duration {} min, period {} h, rain delay {} h",
            format_hms(self.start),
            self.duration_minutes,
            self.period_hours,
            self.rain_delay_hours
        )
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Invalidate the stored record so the next boot falls back to defaults.
pub fn erase_record(store: &mut dyn RecordStore) -> anyhow::Result<()> {
    store.write_record(&[ERASED; RECORD_LEN])
}

/// The scheduler treats a delay as over one minute before its resume
/// instant.
pub fn rain_delay_in_effect(config: &ScheduleConfig, now: OffsetDateTime) -> bool {
    now < config.rain_delay_resume - Duration::MINUTE
}

/// Strict `HH:MM:SS` parser.
pub fn parse_start_time(s: &str) -> Result<Time, StartTimeError> {
    let err = || StartTimeError(s.to_string());

    let b = s.as_bytes();
    if b.len() != 8 || b[2] != b':' || b[5] != b':' {
        return Err(err());
    }
    let field = |i: usize| -> Option<u8> {
        let (hi, lo) = (b[i], b[i + 1]);
        if hi.is_ascii_digit() && lo.is_ascii_digit() {
            Some((hi - b'0') * 10 + (lo - b'0'))
        } else {
            None
        }
    };
    let (h, m, sec) = match (field(0), field(3), field(6)) {
        (Some(h), Some(m), Some(sec)) => (h, m, sec),
        _ => return Err(err()),
    };
    Time::from_hms(h, m, sec).map_err(|_| err())
}

pub fn format_hms(t: Time) -> String {
    format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use time::macros::{datetime, time};

    const NOW: OffsetDateTime = datetime!(2024-06-01 10:15:00 UTC);

    fn config() -> ScheduleConfig {
        ScheduleConfig::with_defaults(NOW)
    }

    // -- start time -----------------------------------------------------------

    #[test]
    fn set_start_time_accepts_hh_mm_ss() {
        let mut cfg = config();
        cfg.set_start_time("21:05:09").unwrap();
        assert_eq!(cfg.start_time(), time!(21:05:09));
    }

    #[test]
    fn set_start_time_rejects_malformed_and_keeps_prior() {
        let mut cfg = config();
        for bad in ["7:00:00", "07-00-00", "24:00:00", "07:60:00", "07:00:61", "ab:cd:ef", ""] {
            assert!(cfg.set_start_time(bad).is_err(), "accepted {bad:?}");
        }
        assert_eq!(cfg.start_time(), DEFAULT_START);
    }

    #[test]
    fn setters_store_raw_values() {
        let mut cfg = config();
        cfg.set_period_hours(7);
        cfg.set_duration_minutes(255);
        assert_eq!(cfg.period_hours(), 7);
        assert_eq!(cfg.duration_minutes(), 255);
    }

    #[test]
    fn today_start_instant_keeps_date_and_offset() {
        let cfg = config();
        let now = datetime!(2024-06-01 23:59:59 -5);
        assert_eq!(cfg.today_start_instant(now), datetime!(2024-06-01 07:00:00 -5));
    }

    // -- rain delay -----------------------------------------------------------

    #[test]
    fn new_config_has_no_rain_delay() {
        let cfg = config();
        assert!(!cfg.is_rain_delay_active());
        assert!(cfg.rain_delay_resume() < NOW);
        assert!(!rain_delay_in_effect(&cfg, NOW));
    }

    #[test]
    fn set_rain_delay_computes_resume() {
        let mut cfg = config();
        cfg.set_rain_delay(24, NOW);
        assert!(cfg.is_rain_delay_active());
        assert_eq!(cfg.rain_delay_resume(), NOW + Duration::hours(24));
    }

    #[test]
    fn clearing_rain_delay_puts_resume_in_past() {
        let mut cfg = config();
        cfg.set_rain_delay(24, NOW);
        cfg.set_rain_delay(0, NOW);
        assert!(!cfg.is_rain_delay_active());
        assert_eq!(cfg.rain_delay_resume(), NOW - Duration::SECOND);
    }

    #[test]
    fn expire_rain_delay_only_after_resume_window() {
        let mut cfg = config();
        cfg.set_rain_delay(2, NOW);
        assert!(!cfg.expire_rain_delay(NOW + Duration::minutes(30)));
        assert!(cfg.is_rain_delay_active());

        assert!(cfg.expire_rain_delay(NOW + Duration::hours(2) - Duration::MINUTE));
        assert!(!cfg.is_rain_delay_active());
        assert!(!cfg.expire_rain_delay(NOW + Duration::hours(3)));
    }

    // -- record ---------------------------------------------------------------

    #[test]
    fn record_layout() {
        let mut cfg = config();
        cfg.set_start_time("05:30:15").unwrap();
        cfg.set_period_hours(6);
        cfg.set_duration_minutes(200);
        assert_eq!(cfg.to_record(), [0x00, 5, 30, 15, 6, 200]);
    }

    #[test]
    fn rain_delay_is_not_persisted() {
        let mut cfg = config();
        cfg.set_rain_delay(12, NOW);
        let mut store = MemoryStore::default();
        cfg.persist(&mut store).unwrap();

        let mut restored = config();
        restored.restore(&mut store);
        assert!(!restored.is_rain_delay_active());
    }

    #[test]
    fn erased_store_keeps_defaults() {
        let mut cfg = config();
        let errors = cfg.apply_record(&[0xFF; RECORD_LEN]);
        assert_eq!(errors, vec![RecordError::NotSaved(0xFF)]);
        assert_eq!(cfg, config());
    }

    #[test]
    fn invalid_period_keeps_prior_period_and_duration() {
        let mut cfg = config();
        let errors = cfg.apply_record(&[0x00, 6, 15, 0, 7, 30]);
        assert_eq!(errors, vec![RecordError::Period(7)]);
        assert_eq!(cfg.start_time(), time!(06:15:00));
        assert_eq!(cfg.period_hours(), DEFAULT_PERIOD_HOURS);
        assert_eq!(cfg.duration_minutes(), DEFAULT_DURATION_MINUTES);
    }

    #[test]
    fn invalid_start_time_keeps_prior_start() {
        let mut cfg = config();
        let errors = cfg.apply_record(&[0x00, 24, 0, 0, 18, 10]);
        assert_eq!(errors, vec![RecordError::StartTime(24, 0, 0)]);
        assert_eq!(cfg.start_time(), DEFAULT_START);
        assert_eq!(cfg.period_hours(), 18);
        assert_eq!(cfg.duration_minutes(), 10);
    }

    #[test]
    fn restore_with_invalid_period_does_not_panic() {
        let mut store = MemoryStore::with_record([0x00, 7, 0, 0, 7, 45]);
        let mut cfg = config();
        cfg.restore(&mut store);
        assert_eq!(cfg.period_hours(), DEFAULT_PERIOD_HOURS);
    }

    #[test]
    fn summary_line() {
        let cfg = config();
        assert_eq!(
            cfg.to_string(),
            "start 07:00:00, duration 45 min, period 12 h, rain delay 0 h"
        );
    }

    proptest! {
        #[test]
        fn persist_restore_round_trip(
            h in 0u8..24,
            m in 0u8..60,
            s in 0u8..60,
            period in prop::sample::select(vec![6u8, 12, 18, 24]),
            duration in 0u8..=255,
        ) {
            let mut cfg = config();
            cfg.set_start_time(&format!("{h:02}:{m:02}:{s:02}")).unwrap();
            cfg.set_period_hours(period);
            cfg.set_duration_minutes(duration);

            let mut store = MemoryStore::default();
            cfg.persist(&mut store).unwrap();

            let mut restored = config();
            restored.restore(&mut store);
            prop_assert_eq!(restored.start_time(), cfg.start_time());
            prop_assert_eq!(restored.period_hours(), period);
            prop_assert_eq!(restored.duration_minutes(), duration);
        }
    }
}
