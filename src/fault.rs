// Fault indicator for unrecoverable startup failures
//
// When the motor board does not answer at startup the runtime never drives
// the motors. It blinks an indicator instead until it is told to exit.

use std::time::Duration;

use embedded_hal::digital::OutputPin;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::error;

/// Something that can be switched on and off to signal a fault
pub trait FaultIndicator {
    fn set(&mut self, on: bool);
}

/// Indicator that reports through the log (for hosts without a status LED)
#[derive(Debug)]
pub struct LogIndicator {
    reason: String,
}

impl LogIndicator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl FaultIndicator for LogIndicator {
    fn set(&mut self, on: bool) {
        if on {
            error!("FAULT: {}", self.reason);
        }
    }
}

/// Drives a GPIO, e.g. a status LED
pub struct PinIndicator<P>(pub P);

impl<P: OutputPin> FaultIndicator for PinIndicator<P> {
    fn set(&mut self, on: bool) {
        // Nothing useful to do if the LED itself fails
        let _ = if on {
            self.0.set_high()
        } else {
            self.0.set_low()
        };
    }
}

/// Toggle the indicator every `interval` until `stop` becomes true
///
/// Returns the number of times the indicator was switched on.
pub async fn blink<F: FaultIndicator>(
    indicator: &mut F,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> u32 {
    let mut blinks = 0;
    let mut on = false;
    while !*stop.borrow_and_update() {
        on = !on;
        indicator.set(on);
        if on {
            blinks += 1;
        }
        tokio::select! {
            _ = sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    indicator.set(false);
    blinks
}
