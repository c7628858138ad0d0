// Differential-drive kinematics
// Converts linear distance and in-place turn angle into wheel rotations and
// encoder ticks.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Wheel configuration for the robot base
pub const WHEEL_DIAMETER_CM: f64 = 4.3;
pub const TRACK_WIDTH_CM: f64 = 16.0; // distance between the two wheel contact points

/// Encoder resolution at the wheel (motor counts x gearbox ratio)
pub const TICKS_PER_REVOLUTION: f64 = 1067.0;

/// Physical dimensions needed to turn motion goals into tick targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelGeometry {
    pub wheel_diameter_cm: f64,
    pub track_width_cm: f64,
    pub ticks_per_revolution: f64,
}

impl Default for WheelGeometry {
    fn default() -> Self {
        Self {
            wheel_diameter_cm: WHEEL_DIAMETER_CM,
            track_width_cm: TRACK_WIDTH_CM,
            ticks_per_revolution: TICKS_PER_REVOLUTION,
        }
    }
}

/// Per-side tick deltas produced by a motion goal
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickDelta {
    pub left: f64,
    pub right: f64,
}

impl WheelGeometry {
    /// Check that every dimension is a positive, finite number
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("wheel_diameter_cm", self.wheel_diameter_cm),
            ("track_width_cm", self.track_width_cm),
            ("ticks_per_revolution", self.ticks_per_revolution),
        ];
        for (name, value) in fields {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("{name} must be positive, got {value}"));
            }
        }
        Ok(())
    }

    pub fn cm_to_rotations(&self, distance_cm: f64) -> f64 {
        cm_to_rotations(distance_cm, self.wheel_diameter_cm)
    }

    pub fn rotations_to_ticks(&self, rotations: f64) -> f64 {
        rotations * self.ticks_per_revolution
    }

    /// Both wheels advance the same amount
    pub fn move_delta(&self, distance_cm: f64) -> TickDelta {
        let ticks = self.rotations_to_ticks(self.cm_to_rotations(distance_cm));
        TickDelta {
            left: ticks,
            right: ticks,
        }
    }

    /// Turn in place about the midpoint of the axle
    ///
    /// Positive degrees turn clockwise (to the right): the left wheel drives
    /// forward and the right wheel backward by the same arc length.
    pub fn turn_delta(&self, degrees: f64) -> TickDelta {
        let arc_cm = (degrees / 360.0) * self.track_width_cm * PI;
        let ticks = self.rotations_to_ticks(self.cm_to_rotations(arc_cm));
        TickDelta {
            left: ticks,
            right: -ticks,
        }
    }
}

/// Wheel rotations needed to roll `distance_cm` on a wheel of the given diameter
pub fn cm_to_rotations(distance_cm: f64, wheel_diameter_cm: f64) -> f64 {
    distance_cm / (wheel_diameter_cm * PI)
}
