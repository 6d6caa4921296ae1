//! Collaborator contracts the controller core drives.
//!
//! ```text
//!   run loop ──▶ Controller ──▶ port traits ──▶ adapters (gpio / mock / mqtt / file)
//! ```
//!
//! Adapters live next to the hardware they wrap (`valve.rs`, `flow.rs`,
//! `panel.rs`, `display.rs`, `store.rs`, `mqtt.rs`).  The core only ever sees
//! these traits, so every decision path is testable with in-memory fakes.

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;

use crate::schedule::RECORD_LEN;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send {
    /// Current wall-clock time in the controller's local offset.
    fn now(&self) -> OffsetDateTime;
}

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

/// Solenoid valve.  `open`/`close` must be idempotent.
pub trait Valve: Send {
    fn open(&mut self);
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Pulse-counting flow meter.
pub trait FlowCounter: Send {
    /// Liters counted since the last drain.  Resets the counter.
    fn drain_liters(&mut self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stable,
    Irrigating,
    Error,
}

pub trait StatusIndicator: Send {
    fn set_status(&mut self, status: Status);
}

/// Two-line character display.
pub trait Display: Send {
    fn render(&mut self, primary: &str, time_line: &str);
}

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// Everything the controller announces on the message bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DripStarted,
    DripStopped,
    /// Liters drained from the flow counter.
    FlowReport(u64),
    /// Human-readable schedule summary.
    ScheduleLine(String),
    RainDelayEnded,
    RainDelaySet { hours: u32 },
}

pub trait Notifier: Send {
    fn publish(&mut self, note: Notification);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Byte-addressed store holding the single schedule record.
pub trait RecordStore: Send {
    fn read_record(&mut self) -> Result<[u8; RECORD_LEN]>;
    fn write_record(&mut self, record: &[u8; RECORD_LEN]) -> Result<()>;
}
