//! Front panel: status LED and the push button.
//!
//! Button presses are classified by how long the button was held:
//!
//! ```text
//! held at boot ............ PressedAtBoot  (factory reset)
//! < very_short ............ VeryShort      (toggle valve)
//! < long .................. Short          (toggle 24 h rain delay)
//! >= long ................. Long           (restart)
//! ```

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::ports::{Status, StatusIndicator};

/// Presses shorter than this are contact bounce.
const BOUNCE: Duration = Duration::from_millis(30);

/// How often the button line is sampled.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    PressedAtBoot,
    VeryShort,
    Short,
    Long,
}

// ---------------------------------------------------------------------------
// Press classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ButtonClassifier {
    pub very_short: Duration,
    pub long: Duration,
}

impl ButtonClassifier {
    pub fn classify(&self, held: Duration) -> ButtonEvent {
        if held < self.very_short {
            ButtonEvent::VeryShort
        } else if held < self.long {
            ButtonEvent::Short
        } else {
            ButtonEvent::Long
        }
    }
}

/// Turns sampled button levels into events, one per release.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
#[derive(Debug)]
pub struct ButtonTracker {
    classifier: ButtonClassifier,
    pressed_since: Option<Instant>,
}

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
impl ButtonTracker {
    pub fn new(classifier: ButtonClassifier) -> Self {
        Self {
            classifier,
            pressed_since: None,
        }
    }

    pub fn sample(&mut self, pressed: bool, now: Instant) -> Option<ButtonEvent> {
        match (pressed, self.pressed_since) {
            (true, None) => {
                self.pressed_since = Some(now);
                None
            }
            (false, Some(since)) => {
                self.pressed_since = None;
                let held = now.saturating_duration_since(since);
                if held < BOUNCE {
                    debug!(?held, "button bounce ignored");
                    None
                } else {
                    Some(self.classifier.classify(held))
                }
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Button source
// ---------------------------------------------------------------------------

/// Spawn the button poller.  With no hardware the returned channel is closed
/// and never yields.
#[cfg(feature = "gpio")]
pub fn spawn_button(pin_num: u8, classifier: ButtonClassifier) -> Result<mpsc::Receiver<ButtonEvent>> {
    let pin = Gpio::new()?.get(pin_num)?.into_input_pullup();
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        // Active-low button: held during boot means factory reset.
        let mut tracker = ButtonTracker::new(classifier);
        if pin.is_low() {
            info!("button held at boot");
            let _ = tx.send(ButtonEvent::PressedAtBoot).await;
            while pin.is_low() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Some(event) = tracker.sample(pin.is_low(), Instant::now()) {
                debug!(?event, "button");
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });

    info!(pin = pin_num, "push button polling");
    Ok(rx)
}

#[cfg(not(feature = "gpio"))]
pub fn spawn_button(pin_num: u8, _classifier: ButtonClassifier) -> Result<mpsc::Receiver<ButtonEvent>> {
    info!("[mock-gpio] push button registered (gpio {pin_num}, not wired)");
    let (_tx, rx) = mpsc::channel(1);
    Ok(rx)
}

// ---------------------------------------------------------------------------
// Status LED
// ---------------------------------------------------------------------------

/// Steady when stable, slow blink while irrigating, fast blink on error.
#[cfg(feature = "gpio")]
pub(crate) struct StatusLed {
    tx: tokio::sync::watch::Sender<Status>,
}

#[cfg(feature = "gpio")]
impl StatusLed {
    pub(crate) fn new(pin_num: u8) -> Result<Self> {
        let mut pin: OutputPin = Gpio::new()?.get(pin_num)?.into_output();
        let (tx, mut rx) = tokio::sync::watch::channel(Status::Stable);

        tokio::spawn(async move {
            let mut lit = false;
            loop {
                let half_period = match *rx.borrow_and_update() {
                    Status::Stable => None,
                    Status::Irrigating => Some(Duration::from_millis(1000)),
                    Status::Error => Some(Duration::from_millis(150)),
                };
                match half_period {
                    None => {
                        pin.set_high();
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    Some(p) => {
                        lit = !lit;
                        if lit {
                            pin.set_high()
                        } else {
                            pin.set_low()
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(p) => {}
                            changed = rx.changed() => if changed.is_err() { break },
                        }
                    }
                }
            }
        });

        Ok(Self { tx })
    }
}

#[cfg(feature = "gpio")]
impl StatusIndicator for StatusLed {
    fn set_status(&mut self, status: Status) {
        self.tx.send_replace(status);
    }
}

#[cfg(not(feature = "gpio"))]
pub(crate) struct StatusLed {
    pub(super) status: Status,
}

#[cfg(not(feature = "gpio"))]
impl StatusLed {
    pub(crate) fn new(pin_num: u8) -> Result<Self> {
        info!("[mock-gpio] status led registered (gpio {pin_num}, not wired)");
        Ok(Self {
            status: Status::Stable,
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl StatusIndicator for StatusLed {
    fn set_status(&mut self, status: Status) {
        if status != self.status {
            info!(?status, "[mock-gpio] status led");
            self.status = status;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
