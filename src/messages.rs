// Message types exchanged with the runtime

use serde::{Deserialize, Serialize};

use crate::motor::{MotionPhase, Side, SideReport, StepReport};

// Command from teleop/scripts -> runtime
// Tagged by "cmd", e.g. {"cmd": "move", "distance_cm": 20.0}
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DriveCommand {
    /// Drive straight, relative to the current target
    Move { distance_cm: f64 },
    /// Turn in place, positive = clockwise
    Turn { degrees: f64 },
    /// Target one side `rotations` away from where it is now
    SetRotation { side: Side, rotations: f64 },
    /// Target both sides relative to where they are now
    SetRotations { left: f64, right: f64 },
    /// Stop the motors and hold position
    Halt,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    /// The last control tick was skipped because the bus failed
    BusDegraded,
    /// The control loop has exited and the motors were halted
    Stopped,
}

// Controller state published by runtime after every tick
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DrivetrainStatus {
    pub phase: MotionPhase,
    pub left: SideReport,
    pub right: SideReport,
    pub health: RuntimeHealth,
    /// Ticks skipped because of bus errors since startup
    pub skipped_ticks: u64,
}

impl Default for DrivetrainStatus {
    fn default() -> Self {
        Self {
            phase: MotionPhase::Idle,
            left: SideReport::default(),
            right: SideReport::default(),
            health: RuntimeHealth::Ok,
            skipped_ticks: 0,
        }
    }
}

impl DrivetrainStatus {
    pub fn with_step(mut self, report: &StepReport) -> Self {
        self.left = report.left;
        self.right = report.right;
        self
    }
}
