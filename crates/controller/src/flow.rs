//! Flow meter.  Pulses are counted on a falling-edge interrupt under the
//! `gpio` feature; the mock counter never moves outside tests.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, Trigger};

use crate::ports::FlowCounter;

pub(crate) struct FlowMeter {
    pulses: Arc<AtomicU64>,
    pulses_per_liter: u64,
    #[cfg(feature = "gpio")]
    _pin: InputPin, // interrupt stays registered while the pin lives
}

impl FlowMeter {
    #[cfg(feature = "gpio")]
    pub(crate) fn new(pin_num: u8, pulses_per_liter: u64) -> Result<Self> {
        let pulses = Arc::new(AtomicU64::new(0));
        let mut pin = Gpio::new()?.get(pin_num)?.into_input_pullup();
        let counter = Arc::clone(&pulses);
        pin.set_async_interrupt(Trigger::FallingEdge, None, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })?;
        info!(pin = pin_num, pulses_per_liter, "flow meter started");
        Ok(Self {
            pulses,
            pulses_per_liter: pulses_per_liter.max(1),
            _pin: pin,
        })
    }

    #[cfg(not(feature = "gpio"))]
    pub(crate) fn new(pin_num: u8, pulses_per_liter: u64) -> Result<Self> {
        info!("[mock-gpio] flow meter registered (gpio {pin_num}, not wired)");
        Ok(Self {
            pulses: Arc::new(AtomicU64::new(0)),
            pulses_per_liter: pulses_per_liter.max(1),
        })
    }

    #[cfg(test)]
    pub(crate) fn add_pulses(&self, n: u64) {
        self.pulses.fetch_add(n, Ordering::Relaxed);
    }
}

impl FlowCounter for FlowMeter {
    /// Whole liters since the last drain.  Pulses that do not make up a full
    /// liter carry over to the next read.
    fn drain_liters(&mut self) -> u64 {
        let ppl = self.pulses_per_liter;
        let mut liters = 0;
        // fetch_update retries if an interrupt lands mid-read.
        let _ = self
            .pulses
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                liters = p / ppl;
                Some(p % ppl)
            });
        debug!(liters, "flow meter drained");
        liters
    }
}

// ===========================================================================
// Tests
// ===========================================================================
