//! Watering-session bookkeeping.
//!
//! ```text
//! Idle ──[scheduler start]──▶ ScheduledWindow ──[scheduler/manual stop]──▶ Idle
//! Idle ──[manual start / button]──▶ ManualOverride ──[manual/button/timer stop]──▶ Idle
//! ```
//!
//! Pure state only; the controller performs the valve, flow-report and
//! notification side effects around each transition.

use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    ScheduledWindow,
    ManualOverride,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrrigationSession {
    open: Option<Open>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Open {
    mode: Mode,
    opened_at: OffsetDateTime,
    planned_stop_at: Option<OffsetDateTime>,
}

/// Summary of a session that just ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed {
    pub mode: Mode,
    pub opened_at: OffsetDateTime,
}

impl IrrigationSession {
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn mode(&self) -> Mode {
        self.open.map_or(Mode::Idle, |o| o.mode)
    }

    pub fn planned_stop_at(&self) -> Option<OffsetDateTime> {
        self.open.and_then(|o| o.planned_stop_at)
    }

    pub fn opened_at(&self) -> Option<OffsetDateTime> {
        self.open.map(|o| o.opened_at)
    }

    /// Enter `mode`.  Returns `false` (and changes nothing) if a session is
    /// already open.
    pub fn begin(
        &mut self,
        mode: Mode,
        now: OffsetDateTime,
        planned_stop_at: Option<OffsetDateTime>,
    ) -> bool {
        if self.is_open() || mode == Mode::Idle {
            return false;
        }
        self.open = Some(Open {
            mode,
            opened_at: now,
            planned_stop_at,
        });
        true
    }

    /// Return to idle.  `None` if nothing was open.
    pub fn end(&mut self) -> Option<Closed> {
        self.open.take().map(|o| Closed {
            mode: o.mode,
            opened_at: o.opened_at,
        })
    }
}
