// Position PID on encoder ticks
//
// Output is raw board power (before clamping). There is no integral limit
// and no output rate limit: a wheel that cannot reach its target winds the
// integral up without bound.

use serde::{Deserialize, Serialize};

use super::drivetrain::DriveError;

/// PID coefficients, fixed for the life of a controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GainValues")]
pub struct PidGains {
    kp: f64,
    ki: f64,
    kd: f64,
}

/// Unvalidated gains as they appear in a config file
#[derive(Debug, Clone, Copy, Deserialize)]
struct GainValues {
    kp: f64,
    #[serde(default)]
    ki: f64,
    #[serde(default)]
    kd: f64,
}

impl TryFrom<GainValues> for PidGains {
    type Error = DriveError;

    fn try_from(values: GainValues) -> Result<Self, DriveError> {
        PidGains::new(values.kp, values.ki, values.kd)
    }
}

impl PidGains {
    /// Gains must be finite and non-negative
    pub fn new(kp: f64, ki: f64, kd: f64) -> Result<Self, DriveError> {
        for (name, value) in [("kp", kp), ("ki", ki), ("kd", kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(DriveError::InvalidConfig(format!(
                    "PID gain {name} must be finite and >= 0, got {value}"
                )));
            }
        }
        Ok(Self { kp, ki, kd })
    }

    /// Proportional-only gains
    pub fn proportional(kp: f64) -> Result<Self, DriveError> {
        Self::new(kp, 0.0, 0.0)
    }

    pub fn kp(&self) -> f64 {
        self.kp
    }

    pub fn ki(&self) -> f64 {
        self.ki
    }

    pub fn kd(&self) -> f64 {
        self.kd
    }
}

impl Default for PidGains {
    /// Half of the ultimate gain (14) found on the bench, P only
    fn default() -> Self {
        Self {
            kp: 7.0,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

/// Per-side controller memory
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidMemory {
    pub last_error: f64,
    pub integral: f64,
}

impl PidMemory {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advance one tick with the given error and return the raw power
    ///
    /// The result is truncated toward zero (saturating at the i32 range).
    pub fn update(&mut self, gains: &PidGains, error: f64) -> i32 {
        self.integral += error;
        let derivative = error - self.last_error;
        let output = gains.kp * error + gains.ki * self.integral + gains.kd * derivative;
        self.last_error = error;
        output as i32
    }
}
