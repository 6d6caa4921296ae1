//! Drip scheduler: decides whether the valve should be open right now and
//! when the controller has to look again.
//!
//! The scheduler is a pure decision engine: [`evaluate`] takes the current
//! time and the schedule and returns an [`Evaluation`].  Valve actuation,
//! notifications and display updates are dispatched by the controller; the
//! only state kept here is the single pending [`Wake`] in [`WakeTimer`].
//!
//! ## Daily timeline
//!
//! ```text
//! 00:00      first          first+dur    second       second+dur       24:00
//!   │ Scheduled │  Dripping     │ Scheduled  │  Dripping     │ Done today │
//!   └──[Start]──┘────[Stop]─────┘──[Start]───┘────[Stop]─────┘─[Reeval]───┘
//! ```
//!
//! A rain delay overrides all of the above until one minute before its
//! resume instant.  Every computed wait is floored to [`MIN_WAIT`].

use serde::Serialize;
use time::{Duration, OffsetDateTime, Time};
use tracing::debug;

use crate::schedule::{rain_delay_in_effect, ScheduleConfig};

/// Shortest wait the scheduler will ever arm.
pub const MIN_WAIT: Duration = Duration::MINUTE;

// ---------------------------------------------------------------------------
// Evaluation result
// ---------------------------------------------------------------------------

/// What to do when a [`Wake`] fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Open the valve for a scheduled window.
    Start,
    /// Close the valve and re-run the scheduler.
    Stop,
    /// Re-run the scheduler.
    Reevaluate,
}

/// The single pending re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Wake {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    RainDelay,
    BeforeFirstWindow,
    BetweenWindows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Inside a window: open now and stop after `remaining`.
    IrrigateNow { window: Window, remaining: Duration },
    Wait(WaitReason),
    /// Both windows are behind us; look again just after midnight.
    WaitUntilMidnight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: Outcome,
    pub wake: Wake,
    /// Instant the display counts down to.
    pub display_target: OffsetDateTime,
}

impl Evaluation {
    pub fn display_line(&self) -> &'static str {
        match self.outcome {
            Outcome::IrrigateNow { .. } => "Dripping",
            Outcome::Wait(WaitReason::RainDelay) => "Rain Delay",
            Outcome::Wait(_) => "Scheduled",
            Outcome::WaitUntilMidnight => "Done today",
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Decide the next step for `now`.
///
/// `suppress_manual` is set only for the evaluation that immediately follows
/// a manual stop: windows are then skipped so the valve does not reopen the
/// moment the operator closed it.
pub fn evaluate(now: OffsetDateTime, config: &ScheduleConfig, suppress_manual: bool) -> Evaluation {
    let first = config.today_start_instant(now);
    let second = first + config.period();
    let duration = config.duration();
    let resume = config.rain_delay_resume();

    let (outcome, wake, display_target) = if rain_delay_in_effect(config, now) {
        let minutes = (resume - now).whole_minutes() + 1;
        (
            Outcome::Wait(WaitReason::RainDelay),
            wake_after(now, Duration::minutes(minutes), Action::Reevaluate),
            resume,
        )
    } else if now < first {
        (
            Outcome::Wait(WaitReason::BeforeFirstWindow),
            wake_after(now, first - now, Action::Start),
            first,
        )
    } else if !suppress_manual && now < first + duration {
        irrigate(now, Window::First, first + duration)
    } else if !suppress_manual && now >= second && now < second + duration {
        irrigate(now, Window::Second, second + duration)
    } else if now < second {
        (
            Outcome::Wait(WaitReason::BetweenWindows),
            wake_after(now, second - now + Duration::SECOND, Action::Start),
            second,
        )
    } else {
        let minutes = minutes_until_midnight(now) + 1;
        (
            Outcome::WaitUntilMidnight,
            wake_after(now, Duration::minutes(minutes), Action::Reevaluate),
            first + Duration::DAY,
        )
    };

    debug!(?outcome, wake_at = %wake.at, action = ?wake.action, suppress_manual, "scheduler evaluated");

    Evaluation {
        outcome,
        wake,
        display_target,
    }
}

fn irrigate(
    now: OffsetDateTime,
    window: Window,
    window_end: OffsetDateTime,
) -> (Outcome, Wake, OffsetDateTime) {
    let remaining = at_least_min_wait(window_end - now + Duration::SECOND);
    (
        Outcome::IrrigateNow { window, remaining },
        Wake {
            at: now + remaining,
            action: Action::Stop,
        },
        window_end,
    )
}

fn wake_after(now: OffsetDateTime, wait: Duration, action: Action) -> Wake {
    Wake {
        at: now + at_least_min_wait(wait),
        action,
    }
}

/// Floor a wait to [`MIN_WAIT`] so rounding never produces a tight re-fire
/// loop.
pub fn at_least_min_wait(wait: Duration) -> Duration {
    if wait < MIN_WAIT {
        MIN_WAIT
    } else {
        wait
    }
}

/// Whole minutes left until the next local midnight.
pub fn minutes_until_midnight(now: OffsetDateTime) -> i64 {
    let midnight = now.replace_time(Time::MIDNIGHT) + Duration::DAY;
    (midnight - now).whole_minutes()
}

// ---------------------------------------------------------------------------
// Single-shot timer
// ---------------------------------------------------------------------------

/// Holds at most one pending [`Wake`].  Arming replaces whatever was pending.
#[derive(Debug, Default)]
pub struct WakeTimer {
    pending: Option<Wake>,
}

impl WakeTimer {
    /// Arm `wake`, returning the one it replaced.
    pub fn arm(&mut self, wake: Wake) -> Option<Wake> {
        let replaced = self.pending.replace(wake);
        debug!(at = %wake.at, action = ?wake.action, replaced = replaced.is_some(), "timer armed");
        replaced
    }

    pub fn detach(&mut self) -> Option<Wake> {
        self.pending.take()
    }

    pub fn pending(&self) -> Option<Wake> {
        self.pending
    }

    /// Fire the pending wake once `now` has reached it.
    pub fn take_due(&mut self, now: OffsetDateTime) -> Option<Action> {
        match self.pending {
            Some(w) if now >= w.at => {
                self.pending = None;
                Some(w.action)
            }
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::{datetime, time};

    /// 07:00:00 start, 12 h period, 45 min windows.
    fn test_config() -> ScheduleConfig {
        ScheduleConfig::new(time!(07:00:00), 12, 45, datetime!(2024-06-01 00:00:00 UTC))
    }

    fn at(t: Time) -> OffsetDateTime {
        datetime!(2024-06-01 00:00:00 UTC).replace_time(t)
    }

    // -- Documented scenarios --------------------------------------------

    #[test]
    fn before_first_window_waits_until_start() {
        let eval = evaluate(at(time!(06:00:00)), &test_config(), false);
        assert_eq!(eval.outcome, Outcome::Wait(WaitReason::BeforeFirstWindow));
        assert_eq!(
            eval.wake,
            Wake {
                at: at(time!(07:00:00)),
                action: Action::Start
            }
        );
        assert_eq!(eval.display_target, at(time!(07:00:00)));
        assert_eq!(eval.display_line(), "Scheduled");
    }

    #[test]
    fn inside_first_window_irrigates_for_remainder() {
        let eval = evaluate(at(time!(07:20:00)), &test_config(), false);
        assert_eq!(
            eval.outcome,
            Outcome::IrrigateNow {
                window: Window::First,
                remaining: Duration::minutes(25) + Duration::SECOND,
            }
        );
        assert_eq!(eval.wake.action, Action::Stop);
        assert_eq!(eval.wake.at, at(time!(07:45:01)));
        assert_eq!(eval.display_target, at(time!(07:45:00)));
        assert_eq!(eval.display_line(), "Dripping");
    }

    #[test]
    fn after_both_windows_waits_until_midnight() {
        let eval = evaluate(at(time!(20:00:00)), &test_config(), false);
        assert_eq!(eval.outcome, Outcome::WaitUntilMidnight);
        assert_eq!(eval.wake.action, Action::Reevaluate);
        assert_eq!(eval.wake.at, datetime!(2024-06-02 00:01:00 UTC));
        assert_eq!(eval.display_target, datetime!(2024-06-02 07:00:00 UTC));
        assert_eq!(eval.display_line(), "Done today");
    }

    #[test]
    fn rain_delay_waits_until_it_expires() {
        let t = at(time!(07:10:00));
        let mut cfg = test_config();
        cfg.set_rain_delay(24, t);

        for offset in [0, 60, 3600, 12 * 3600, 24 * 3600 - 61] {
            let eval = evaluate(t + Duration::seconds(offset), &cfg, false);
            assert_eq!(eval.outcome, Outcome::Wait(WaitReason::RainDelay), "offset {offset}");
            assert_eq!(eval.wake.action, Action::Reevaluate);
            assert_eq!(eval.display_target, t + Duration::DAY);
            assert_eq!(eval.display_line(), "Rain Delay");
        }

        // At T+24h the delay is over and we are back inside the first window.
        let eval = evaluate(t + Duration::DAY, &cfg, false);
        assert!(matches!(eval.outcome, Outcome::IrrigateNow { window: Window::First, .. }));
    }

    #[test]
    fn rain_delay_rearms_one_minute_past_resume() {
        let t = at(time!(09:00:00));
        let mut cfg = test_config();
        cfg.set_rain_delay(2, t);
        let eval = evaluate(t, &cfg, false);
        assert_eq!(eval.wake.at, t + Duration::minutes(121));
    }

    // -- Remaining branches ----------------------------------------------

    #[test]
    fn between_windows_waits_for_second_start() {
        let eval = evaluate(at(time!(12:00:00)), &test_config(), false);
        assert_eq!(eval.outcome, Outcome::Wait(WaitReason::BetweenWindows));
        assert_eq!(
            eval.wake,
            Wake {
                at: at(time!(19:00:01)),
                action: Action::Start
            }
        );
        assert_eq!(eval.display_target, at(time!(19:00:00)));
    }

    #[test]
    fn inside_second_window_irrigates() {
        let eval = evaluate(at(time!(19:30:00)), &test_config(), false);
        assert_eq!(
            eval.outcome,
            Outcome::IrrigateNow {
                window: Window::Second,
                remaining: Duration::minutes(15) + Duration::SECOND,
            }
        );
        assert_eq!(eval.display_target, at(time!(19:45:00)));
    }

    #[test]
    fn window_start_is_inclusive_and_end_exclusive() {
        let cfg = test_config();
        assert!(matches!(
            evaluate(at(time!(07:00:00)), &cfg, false).outcome,
            Outcome::IrrigateNow { .. }
        ));
        assert_eq!(
            evaluate(at(time!(07:45:00)), &cfg, false).outcome,
            Outcome::Wait(WaitReason::BetweenWindows)
        );
    }

    #[test]
    fn zero_duration_never_irrigates() {
        let mut cfg = test_config();
        cfg.set_duration_minutes(0);
        assert_eq!(
            evaluate(at(time!(07:00:00)), &cfg, false).outcome,
            Outcome::Wait(WaitReason::BetweenWindows)
        );
    }

    // -- Manual-stop suppression -----------------------------------------

    #[test]
    fn suppression_in_first_window_waits_for_second() {
        let eval = evaluate(at(time!(07:20:00)), &test_config(), true);
        assert_eq!(eval.outcome, Outcome::Wait(WaitReason::BetweenWindows));
        assert_eq!(eval.wake.action, Action::Start);
    }

    #[test]
    fn suppression_in_second_window_waits_for_midnight() {
        let eval = evaluate(at(time!(19:30:00)), &test_config(), true);
        assert_eq!(eval.outcome, Outcome::WaitUntilMidnight);
    }

    #[test]
    fn suppression_does_not_override_rain_delay_or_early_morning() {
        let mut cfg = test_config();
        assert_eq!(
            evaluate(at(time!(06:00:00)), &cfg, true).outcome,
            Outcome::Wait(WaitReason::BeforeFirstWindow)
        );
        cfg.set_rain_delay(3, at(time!(07:10:00)));
        assert_eq!(
            evaluate(at(time!(07:10:00)), &cfg, true).outcome,
            Outcome::Wait(WaitReason::RainDelay)
        );
    }

    // -- Floors ----------------------------------------------------------

    #[test]
    fn waits_are_floored_to_one_minute() {
        assert_eq!(at_least_min_wait(Duration::ZERO), MIN_WAIT);
        assert_eq!(at_least_min_wait(Duration::seconds(-30)), MIN_WAIT);
        assert_eq!(at_least_min_wait(Duration::seconds(59)), MIN_WAIT);
        assert_eq!(at_least_min_wait(Duration::seconds(61)), Duration::seconds(61));
    }

    #[test]
    fn short_remaining_window_still_runs_one_minute() {
        let now = at(time!(07:44:50));
        let eval = evaluate(now, &test_config(), false);
        assert_eq!(eval.wake.at, now + MIN_WAIT);
    }

    #[test]
    fn start_a_few_seconds_away_is_floored() {
        let now = at(time!(06:59:30));
        let eval = evaluate(now, &test_config(), false);
        assert_eq!(eval.wake.at, now + MIN_WAIT);
        assert_eq!(eval.wake.action, Action::Start);
    }

    #[test]
    fn minutes_until_midnight_counts_whole_minutes() {
        assert_eq!(minutes_until_midnight(at(time!(20:00:00))), 240);
        assert_eq!(minutes_until_midnight(at(time!(23:59:30))), 0);
        assert_eq!(minutes_until_midnight(at(time!(00:00:00))), 1440);
    }

    #[test]
    fn just_before_midnight_still_moves_forward() {
        let now = at(time!(23:59:30));
        let eval = evaluate(now, &test_config(), false);
        assert_eq!(eval.outcome, Outcome::WaitUntilMidnight);
        assert_eq!(eval.wake.at, now + MIN_WAIT);
    }

    // -- WakeTimer -------------------------------------------------------

    #[test]
    fn timer_arm_replaces_pending() {
        let mut timer = WakeTimer::default();
        let a = Wake { at: at(time!(07:00:00)), action: Action::Start };
        let b = Wake { at: at(time!(08:00:00)), action: Action::Reevaluate };
        assert_eq!(timer.arm(a), None);
        assert_eq!(timer.arm(b), Some(a));
        assert_eq!(timer.pending(), Some(b));
    }

    #[test]
    fn timer_fires_once_when_due() {
        let mut timer = WakeTimer::default();
        timer.arm(Wake { at: at(time!(07:00:00)), action: Action::Start });
        assert_eq!(timer.take_due(at(time!(06:59:59))), None);
        assert_eq!(timer.take_due(at(time!(07:00:00))), Some(Action::Start));
        assert_eq!(timer.take_due(at(time!(07:00:01))), None);
    }

    #[test]
    fn detached_timer_never_fires() {
        let mut timer = WakeTimer::default();
        timer.arm(Wake { at: at(time!(07:00:00)), action: Action::Stop });
        assert!(timer.detach().is_some());
        assert_eq!(timer.take_due(at(time!(12:00:00))), None);
    }

    // -- Properties ------------------------------------------------------

    fn valid_config() -> impl Strategy<Value = ScheduleConfig> {
        (
            0u8..24,
            0u8..60,
            0u8..60,
            prop::sample::select(vec![6u8, 12, 18, 24]),
            1u8..=255,
        )
            .prop_map(|(h, m, s, period, duration)| {
                let start = Time::from_hms(h, m, s).unwrap();
                ScheduleConfig::new(start, period, duration, datetime!(2024-06-01 00:00:00 UTC))
            })
    }

    proptest! {
        #[test]
        fn inside_a_window_always_irrigates(
            cfg in valid_config(),
            second_window in any::<bool>(),
            frac in 0.0f64..1.0,
        ) {
            let day = datetime!(2024-06-01 00:00:00 UTC);
            let first = cfg.today_start_instant(day);
            let start = if second_window { first + cfg.period() } else { first };
            let offset = (cfg.duration().whole_seconds() as f64 * frac) as i64;
            let now = start + Duration::seconds(offset);
            // Windows are anchored to today's date; skip instants that spill
            // past midnight.
            prop_assume!(now.date() == first.date());

            let eval = evaluate(now, &cfg, false);
            let irrigating = matches!(eval.outcome, Outcome::IrrigateNow { .. });
            prop_assert!(irrigating);
            prop_assert_eq!(eval.wake.action, Action::Stop);
        }

        #[test]
        fn rain_delay_always_waits(
            cfg in valid_config(),
            hours in 1u32..=99,
            secs_into_day in 0i64..86_400,
            elapsed_frac in 0.0f64..1.0,
        ) {
            let set_at = datetime!(2024-06-01 00:00:00 UTC) + Duration::seconds(secs_into_day);
            let mut cfg = cfg;
            cfg.set_rain_delay(hours, set_at);

            // Any instant with more than a minute left on the delay.
            let span = i64::from(hours) * 3600 - 61;
            let now = set_at + Duration::seconds((span as f64 * elapsed_frac) as i64);
            prop_assume!(cfg.rain_delay_resume() - now > Duration::MINUTE);

            let eval = evaluate(now, &cfg, false);
            prop_assert_eq!(eval.outcome, Outcome::Wait(WaitReason::RainDelay));
        }

        #[test]
        fn wake_is_always_at_least_a_minute_out(
            cfg in valid_config(),
            secs_into_day in 0i64..86_400,
            suppress in any::<bool>(),
        ) {
            let now = datetime!(2024-06-01 00:00:00 UTC) + Duration::seconds(secs_into_day);
            let eval = evaluate(now, &cfg, suppress);
            prop_assert!(eval.wake.at - now >= MIN_WAIT);
        }
    }
}
