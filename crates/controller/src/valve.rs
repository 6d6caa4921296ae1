//! Solenoid valve control via GPIO. The `gpio` feature gates the real rppal
//! driver; without it, a mock implementation logs state changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::ports::Valve;

// ---------------------------------------------------------------------------
// Real GPIO valve (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct SolenoidValve {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    open: bool,
}

#[cfg(feature = "gpio")]
impl SolenoidValve {
    pub(crate) fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(pin_num)?.into_output();
        let mut valve = Self {
            pin,
            active_low,
            open: true,
        };
        // Fail-safe: ensure closed at startup
        valve.close();
        Ok(valve)
    }

    fn drive(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        }
    }
}

#[cfg(feature = "gpio")]
impl Valve for SolenoidValve {
    fn open(&mut self) {
        if !self.open {
            self.drive(true);
            self.open = true;
            info!("valve open");
        }
    }

    fn close(&mut self) {
        if self.open {
            self.drive(false);
            self.open = false;
            info!("valve closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ---------------------------------------------------------------------------
// Mock valve (no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct SolenoidValve {
    pub(super) open: bool,
}

#[cfg(not(feature = "gpio"))]
impl SolenoidValve {
    pub(crate) fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        info!("[mock-gpio] valve registered (gpio {pin_num}, not wired)");
        Ok(Self { open: false })
    }
}

#[cfg(not(feature = "gpio"))]
impl Valve for SolenoidValve {
    fn open(&mut self) {
        if !self.open {
            self.open = true;
            info!("[mock-gpio] valve open");
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            info!("[mock-gpio] valve closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ===========================================================================
// Tests
// ===========================================================================
