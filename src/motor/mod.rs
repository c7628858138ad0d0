// Motor control module for the differential-drive base
//
// Provides:
// - Register protocol for the 4-channel I2C motor driver board
// - Encoder zero-offset tracking
// - Differential-drive kinematics and per-side position PID
// - A simulated board for running without hardware

pub mod board;
mod drivetrain;
pub mod encoder;
pub mod kinematics;
pub mod pid;
pub mod sim;

pub use board::{BusError, MotorBoard, MotorId, MotorSelect, RegisterFrame};
pub use drivetrain::{
    ChannelBinding, DriveError, Drivetrain, MotionPhase, Side, SideReport, StepReport,
};
pub use encoder::{EncoderSelect, EncoderTracker};
pub use kinematics::{cm_to_rotations, WheelGeometry};
pub use pid::{PidGains, PidMemory};
pub use sim::SimulatedBoard;
