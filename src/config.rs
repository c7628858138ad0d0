// Loop timing, topics, drivetrain wiring and tuning
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::{ChannelBinding, DriveError, MotorId, PidGains, WheelGeometry};

// Control loop frequency (20 Hz is plenty for position PID on this gearbox)
pub const LOOP_HZ: u64 = 20;

// Settling check
pub const SETTLE_TOLERANCE_TICKS: u32 = 15;
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

// Fault indicator blink half-period
pub const FAULT_BLINK_INTERVAL: Duration = Duration::from_millis(500);

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "drivetrain/cmd"; // commands
pub const TOPIC_STATE: &str = "drivetrain/state"; // per-tick controller state
pub const TOPIC_HEALTH: &str = "drivetrain/health"; // health status

// I2C bus the motor driver board is attached to
pub const I2C_DEVICE: &str = "/dev/i2c-1";

// Wheel speed of the simulated board at full power
pub const SIM_TICKS_PER_SEC: f64 = 2000.0;

/// Everything the drivetrain needs to know about the robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivetrainConfig {
    pub geometry: WheelGeometry,
    pub gains: PidGains,
    pub left: ChannelBinding,
    pub right: ChannelBinding,
}

impl Default for DrivetrainConfig {
    fn default() -> Self {
        Self {
            geometry: WheelGeometry::default(),
            gains: PidGains::default(),
            // Left motor is mounted mirrored; right encoder counts backwards
            left: ChannelBinding {
                motor: MotorId::M1,
                motor_reversed: true,
                encoder_reversed: false,
            },
            right: ChannelBinding {
                motor: MotorId::M2,
                motor_reversed: false,
                encoder_reversed: true,
            },
        }
    }
}

impl DrivetrainConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DriveError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriveError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            DriveError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DriveError> {
        self.geometry.validate().map_err(DriveError::InvalidConfig)?;
        if self.left.motor == self.right.motor {
            return Err(DriveError::InvalidConfig(format!(
                "left and right sides both use motor {}",
                self.left.motor.get()
            )));
        }
        Ok(())
    }

    /// Per-motor wiring signs for a simulated board that matches this config
    pub fn sim_wiring(&self) -> [i8; 4] {
        let mut wiring = [1; 4];
        for binding in [self.left, self.right] {
            wiring[binding.motor.index()] = binding.wiring_sign();
        }
        wiring
    }
}
