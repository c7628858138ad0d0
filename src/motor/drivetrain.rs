// Closed-loop differential drivetrain
//
// Keeps an absolute encoder target per side and drives both wheels toward
// it with a PID step. Motion goals (move, turn) only move the targets; the
// motors are driven by `step`, which the control loop calls periodically.

use std::sync::Arc;
use std::time::Duration;

use embedded_hal::i2c::I2c;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::board::{BusError, MotorBoard, MotorId, MotorSelect, POWER_LIMIT};
use super::encoder::{EncoderSelect, EncoderTracker};
use super::kinematics::{TickDelta, WheelGeometry};
use super::pid::{PidGains, PidMemory};
use crate::config::DrivetrainConfig;

/// Errors raised above the bus layer
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Motor board unresponsive during initialization: {0}")]
    InitializationFault(#[source] BusError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Control loop is not running")]
    LoopStopped,

    #[error("Target not reached within {0:?}")]
    SettleTimeout(Duration),
}

/// Logical side of the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// How one side is wired to the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub motor: MotorId,
    /// Negate power before it is sent to the board
    #[serde(default)]
    pub motor_reversed: bool,
    /// Negate the encoder position read from the board
    #[serde(default)]
    pub encoder_reversed: bool,
}

impl ChannelBinding {
    /// Sign relating board power to raw encoder direction for this wiring,
    /// such that positive commanded power moves the reported position up.
    pub fn wiring_sign(&self) -> i8 {
        if self.motor_reversed == self.encoder_reversed {
            1
        } else {
            -1
        }
    }
}

/// Where the current motion goal stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionPhase {
    /// Holding the current position, no goal pending
    Idle,
    /// A target was set and the PID step is correcting toward it
    Tracking,
    /// Both sides were last seen within tolerance of their targets
    Settled,
}

/// Outcome of one PID step for one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SideReport {
    pub position: i32,
    pub target_ticks: f64,
    pub error: f64,
    pub power: i32,
}

/// Outcome of one PID step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub left: SideReport,
    pub right: SideReport,
}

#[derive(Debug, Clone, Copy)]
struct SideState {
    binding: ChannelBinding,
    target_ticks: f64,
    pid: PidMemory,
    // Last power requested for this side, after clamping and before polarity
    power: i32,
    // Position from the last successful encoder read
    last_position: i32,
}

impl SideState {
    fn new(binding: ChannelBinding) -> Self {
        Self {
            binding,
            target_ticks: 0.0,
            pid: PidMemory::default(),
            power: 0,
            last_position: 0,
        }
    }
}

/// Differential drivetrain controller
///
/// Owns the tick targets and PID memory of both sides. It is not shared:
/// one task owns it and everyone else talks to that task (see `control`).
pub struct Drivetrain<I> {
    board: Arc<MotorBoard<I>>,
    encoders: EncoderTracker<I>,
    geometry: WheelGeometry,
    gains: PidGains,
    left: SideState,
    right: SideState,
    phase: MotionPhase,
}

impl<I: I2c> Drivetrain<I> {
    /// Create a drivetrain and bring the board to a known state
    ///
    /// All motors are stopped and all encoders zeroed. If the board does not
    /// answer, this fails with `InitializationFault` and nothing is driven.
    pub fn new(board: Arc<MotorBoard<I>>, config: &DrivetrainConfig) -> Result<Self, DriveError> {
        config.validate()?;

        let mut drivetrain = Self {
            encoders: EncoderTracker::new(board.clone()),
            board,
            geometry: config.geometry,
            gains: config.gains,
            left: SideState::new(config.left),
            right: SideState::new(config.right),
            phase: MotionPhase::Idle,
        };

        drivetrain
            .initialize()
            .map_err(DriveError::InitializationFault)?;
        info!(
            "Drivetrain ready: left=motor {}, right=motor {}, {} ticks/rev",
            config.left.motor.get(),
            config.right.motor.get(),
            config.geometry.ticks_per_revolution
        );
        Ok(drivetrain)
    }

    fn initialize(&mut self) -> Result<(), BusError> {
        self.board.set_motor_power(MotorSelect::All, 0)?;
        self.encoders.reset(EncoderSelect::All)
    }

    fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    // === Motor and encoder access ===

    /// Send power to one side, applying its polarity and clamping to the board limit
    pub fn set_power(&mut self, side: Side, power: i32) -> Result<(), BusError> {
        let power = power.clamp(-POWER_LIMIT, POWER_LIMIT);
        let binding = self.side(side).binding;
        let wire_power = if binding.motor_reversed { -power } else { power };

        self.board
            .set_motor_power(MotorSelect::One(binding.motor), wire_power)?;
        self.side_mut(side).power = power;
        Ok(())
    }

    /// Encoder position of one side, with its polarity applied
    pub fn position(&self, side: Side) -> Result<i32, BusError> {
        let binding = self.side(side).binding;
        let raw = self.encoders.position(binding.motor)?;
        Ok(if binding.encoder_reversed {
            raw.wrapping_neg()
        } else {
            raw
        })
    }

    /// Positions of both sides as (left, right)
    pub fn positions(&self) -> Result<(i32, i32), BusError> {
        Ok((self.position(Side::Left)?, self.position(Side::Right)?))
    }

    // === Motion goals ===

    pub fn cm_to_rotations(&self, distance_cm: f64) -> f64 {
        self.geometry.cm_to_rotations(distance_cm)
    }

    /// Drive straight: both targets advance by the same number of ticks
    ///
    /// Relative to the current targets, not the current positions, so
    /// consecutive moves add up even before the previous one finishes.
    pub fn move_cm(&mut self, distance_cm: f64) {
        debug!("Move {} cm", distance_cm);
        self.apply_delta(self.geometry.move_delta(distance_cm));
    }

    /// Turn in place, positive degrees clockwise
    pub fn turn_degrees(&mut self, degrees: f64) {
        debug!("Turn {} deg", degrees);
        self.apply_delta(self.geometry.turn_delta(degrees));
    }

    fn apply_delta(&mut self, delta: TickDelta) {
        self.left.target_ticks += delta.left;
        self.right.target_ticks += delta.right;
        self.phase = MotionPhase::Tracking;
    }

    /// Target `rotations` from where the wheel is now; clears that side's PID memory
    pub fn set_absolute_target(&mut self, side: Side, rotations: f64) -> Result<(), BusError> {
        let position = self.position(side)?;
        let ticks = self.geometry.rotations_to_ticks(rotations);

        let state = self.side_mut(side);
        state.target_ticks = position as f64 + ticks;
        state.last_position = position;
        state.pid.reset();
        self.phase = MotionPhase::Tracking;
        Ok(())
    }

    /// Both sides at once; neither changes unless both positions were read
    pub fn set_absolute_targets(
        &mut self,
        left_rotations: f64,
        right_rotations: f64,
    ) -> Result<(), BusError> {
        let (left, right) = self.positions()?;
        self.left.last_position = left;
        self.right.last_position = right;

        self.left.target_ticks = left as f64 + self.geometry.rotations_to_ticks(left_rotations);
        self.right.target_ticks =
            right as f64 + self.geometry.rotations_to_ticks(right_rotations);
        self.left.pid.reset();
        self.right.pid.reset();
        self.phase = MotionPhase::Tracking;
        Ok(())
    }

    /// Drop the current goal and hold the wheels where they are
    pub fn hold_position(&mut self) -> Result<(), BusError> {
        self.set_absolute_targets(0.0, 0.0)?;
        self.phase = MotionPhase::Idle;
        Ok(())
    }

    /// Hold at the positions from the last successful read, without using the bus
    ///
    /// Fallback for when `hold_position` cannot read the encoders: the old
    /// goal is dropped either way.
    pub fn hold_last_position(&mut self) {
        for state in [&mut self.left, &mut self.right] {
            state.target_ticks = state.last_position as f64;
            state.pid.reset();
        }
        self.phase = MotionPhase::Idle;
    }

    // === Control ===

    /// One PID tick
    ///
    /// Any bus error leaves the PID memory untouched and is returned so the
    /// caller can skip the tick. The motors keep whatever power they were
    /// last given.
    pub fn step(&mut self) -> Result<StepReport, BusError> {
        let (left_position, right_position) = self.positions()?;
        self.left.last_position = left_position;
        self.right.last_position = right_position;

        let mut left_pid = self.left.pid;
        let mut right_pid = self.right.pid;
        let left_error = self.left.target_ticks - left_position as f64;
        let right_error = self.right.target_ticks - right_position as f64;
        let left_power = left_pid.update(&self.gains, left_error);
        let right_power = right_pid.update(&self.gains, right_error);

        self.set_power(Side::Left, left_power)?;
        self.set_power(Side::Right, right_power)?;
        self.left.pid = left_pid;
        self.right.pid = right_pid;

        Ok(StepReport {
            left: SideReport {
                position: left_position,
                target_ticks: self.left.target_ticks,
                error: left_error,
                power: self.left.power,
            },
            right: SideReport {
                position: right_position,
                target_ticks: self.right.target_ticks,
                error: right_error,
                power: self.right.power,
            },
        })
    }

    /// True when both sides are within `tolerance_ticks` of their targets
    ///
    /// Reads the encoders; no settle delay is applied here.
    pub fn is_settled(&mut self, tolerance_ticks: u32) -> Result<bool, BusError> {
        let (left, right) = self.positions()?;
        let tolerance = tolerance_ticks as f64;
        let settled = (self.left.target_ticks - left as f64).abs() <= tolerance
            && (self.right.target_ticks - right as f64).abs() <= tolerance;

        if settled && self.phase == MotionPhase::Tracking {
            debug!("Drivetrain settled at left={}, right={}", left, right);
            self.phase = MotionPhase::Settled;
        }
        Ok(settled)
    }

    /// Zero power on every board channel
    ///
    /// Always attempts the write, whatever happened before.
    pub fn halt(&mut self) -> Result<(), BusError> {
        self.left.power = 0;
        self.right.power = 0;
        self.board.set_motor_power(MotorSelect::All, 0).inspect_err(|e| {
            warn!("Failed to halt motors: {}", e);
        })
    }

    // === State inspection ===

    pub fn target_ticks(&self, side: Side) -> f64 {
        self.side(side).target_ticks
    }

    pub fn pid_memory(&self, side: Side) -> PidMemory {
        self.side(side).pid
    }

    pub fn power(&self, side: Side) -> i32 {
        self.side(side).power
    }

    pub fn phase(&self) -> MotionPhase {
        self.phase
    }

    pub fn geometry(&self) -> &WheelGeometry {
        &self.geometry
    }

    pub fn gains(&self) -> &PidGains {
        &self.gains
    }

    pub fn binding(&self, side: Side) -> ChannelBinding {
        self.side(side).binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::SimulatedBoard;

    fn motor(n: u8) -> MotorId {
        MotorId::new(n).unwrap()
    }

    fn drivetrain_with(config: DrivetrainConfig) -> (SimulatedBoard, Drivetrain<SimulatedBoard>) {
        let sim = SimulatedBoard::new();
        let board = Arc::new(MotorBoard::new(sim.clone()));
        let drivetrain = Drivetrain::new(board, &config).unwrap();
        (sim, drivetrain)
    }

    fn drivetrain() -> (SimulatedBoard, Drivetrain<SimulatedBoard>) {
        drivetrain_with(DrivetrainConfig::default())
    }

    #[test]
    fn test_new_zeroes_board() {
        let sim = SimulatedBoard::new();
        sim.set_encoder_total(motor(1), 500);
        sim.set_encoder_total(motor(2), -500);
        let board = Arc::new(MotorBoard::new(sim.clone()));

        let drivetrain = Drivetrain::new(board, &DrivetrainConfig::default()).unwrap();
        assert_eq!(sim.frames_written(), 1);
        assert_eq!(sim.last_frame().powers(), [0; 4]);
        assert_eq!(drivetrain.positions().unwrap(), (0, 0));
        assert_eq!(drivetrain.phase(), MotionPhase::Idle);
    }

    #[test]
    fn test_new_fails_when_board_silent() {
        let sim = SimulatedBoard::new();
        sim.set_responding(false);
        let board = Arc::new(MotorBoard::new(sim));
        let result = Drivetrain::new(board, &DrivetrainConfig::default());
        assert!(matches!(result, Err(DriveError::InitializationFault(_))));
    }

    #[test]
    fn test_set_power_polarity_and_clamp() {
        // Default wiring: left is motor 1 (reversed), right is motor 2
        let (sim, mut drivetrain) = drivetrain();

        drivetrain.set_power(Side::Left, 300).unwrap();
        drivetrain.set_power(Side::Right, 300).unwrap();
        assert_eq!(sim.last_frame().powers(), [-300, 300, 0, 0]);

        drivetrain.set_power(Side::Left, 5000).unwrap();
        drivetrain.set_power(Side::Right, -5000).unwrap();
        assert_eq!(sim.last_frame().powers(), [-1000, -1000, 0, 0]);
        assert_eq!(drivetrain.power(Side::Left), 1000);
        assert_eq!(drivetrain.power(Side::Right), -1000);
    }

    #[test]
    fn test_encoder_polarity() {
        // Right encoder is reversed in the default wiring
        let (sim, drivetrain) = drivetrain();
        sim.set_encoder_total(motor(1), 120);
        sim.set_encoder_total(motor(2), 120);
        assert_eq!(drivetrain.positions().unwrap(), (120, -120));
    }

    #[test]
    fn test_move_adds_to_both_targets() {
        let (_sim, mut drivetrain) = drivetrain();
        let geometry = *drivetrain.geometry();
        let expected = 30.0 / (std::f64::consts::PI * geometry.wheel_diameter_cm)
            * geometry.ticks_per_revolution;

        drivetrain.move_cm(30.0);
        assert!((drivetrain.target_ticks(Side::Left) - expected).abs() < 1e-9);
        assert!((drivetrain.target_ticks(Side::Right) - expected).abs() < 1e-9);
        assert_eq!(drivetrain.phase(), MotionPhase::Tracking);

        // Incremental: relative to the previous target
        drivetrain.move_cm(30.0);
        assert!((drivetrain.target_ticks(Side::Left) - 2.0 * expected).abs() < 1e-9);
    }

    #[test]
    fn test_move_keeps_pid_memory() {
        let (_sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        drivetrain.step().unwrap();
        let memory = drivetrain.pid_memory(Side::Left);
        assert_ne!(memory, PidMemory::default());

        drivetrain.move_cm(10.0);
        assert_eq!(drivetrain.pid_memory(Side::Left), memory);
    }

    #[test]
    fn test_turn_opposite_targets() {
        let (_sim, mut drivetrain) = drivetrain();
        drivetrain.turn_degrees(90.0);
        let left = drivetrain.target_ticks(Side::Left);
        let right = drivetrain.target_ticks(Side::Right);
        assert!(left > 0.0);
        assert!((left + right).abs() < 1e-9);
    }

    #[test]
    fn test_set_absolute_target_resets_memory() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        drivetrain.step().unwrap();
        drivetrain.step().unwrap();
        assert_ne!(drivetrain.pid_memory(Side::Right).integral, 0.0);

        sim.set_encoder_total(motor(1), 40);
        drivetrain.set_absolute_target(Side::Left, 1.0).unwrap();
        assert_eq!(drivetrain.target_ticks(Side::Left), 40.0 + 1067.0);
        assert_eq!(drivetrain.pid_memory(Side::Left), PidMemory::default());
        // The other side is untouched
        assert_ne!(drivetrain.pid_memory(Side::Right), PidMemory::default());
    }

    #[test]
    fn test_set_absolute_targets_both_sides() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        drivetrain.step().unwrap();

        sim.set_encoder_total(motor(1), 100);
        sim.set_encoder_total(motor(2), 100); // reads as -100
        drivetrain.set_absolute_targets(0.5, -0.5).unwrap();
        assert_eq!(drivetrain.target_ticks(Side::Left), 100.0 + 533.5);
        assert_eq!(drivetrain.target_ticks(Side::Right), -100.0 - 533.5);
        assert_eq!(drivetrain.pid_memory(Side::Left), PidMemory::default());
        assert_eq!(drivetrain.pid_memory(Side::Right), PidMemory::default());
    }

    #[test]
    fn test_set_absolute_targets_all_or_nothing() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        let before = drivetrain.target_ticks(Side::Left);

        sim.set_responding(false);
        assert!(drivetrain.set_absolute_targets(1.0, 1.0).is_err());
        assert_eq!(drivetrain.target_ticks(Side::Left), before);
    }

    #[test]
    fn test_step_at_target_is_zero_power() {
        let (sim, mut drivetrain) = drivetrain();
        sim.set_encoder_total(motor(1), 250);
        sim.set_encoder_total(motor(2), 250);
        drivetrain.set_absolute_targets(0.0, 0.0).unwrap();

        let report = drivetrain.step().unwrap();
        assert_eq!(report.left.power, 0);
        assert_eq!(report.right.power, 0);
        assert_eq!(sim.last_frame().powers(), [0; 4]);
    }

    #[test]
    fn test_step_drives_toward_target() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.set_absolute_targets(0.0, 0.0).unwrap();
        // Left sits 100 ticks behind, right 50 ticks ahead (encoder reversed)
        sim.set_encoder_total(motor(1), -100);
        sim.set_encoder_total(motor(2), -50);

        let report = drivetrain.step().unwrap();
        // kp = 7; left motor is reversed on the wire
        assert_eq!(report.left.power, 700);
        assert_eq!(report.right.power, -350);
        assert_eq!(sim.last_frame().powers(), [-700, -350, 0, 0]);
        assert_eq!(drivetrain.pid_memory(Side::Left).last_error, 100.0);
        assert_eq!(drivetrain.pid_memory(Side::Right).integral, -50.0);
    }

    #[test]
    fn test_step_clamps_large_error() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(100.0);
        let report = drivetrain.step().unwrap();
        assert_eq!(report.left.power, 1000);
        assert_eq!(report.right.power, 1000);
        assert_eq!(sim.last_frame().powers(), [-1000, 1000, 0, 0]);
    }

    #[test]
    fn test_step_skips_on_bus_error() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        drivetrain.step().unwrap();
        let memory = drivetrain.pid_memory(Side::Left);
        let frame = sim.last_frame();

        sim.set_responding(false);
        assert!(drivetrain.step().is_err());
        assert_eq!(drivetrain.pid_memory(Side::Left), memory);

        sim.set_responding(true);
        assert_eq!(sim.last_frame(), frame);
    }

    #[test]
    fn test_is_settled_tolerance() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.set_absolute_targets(0.0, 0.0).unwrap();

        // Right encoder reads reversed
        sim.set_encoder_total(motor(1), 15);
        sim.set_encoder_total(motor(2), 15);
        assert!(drivetrain.is_settled(15).unwrap());
        assert_eq!(drivetrain.phase(), MotionPhase::Settled);

        sim.set_encoder_total(motor(2), 16);
        assert!(!drivetrain.is_settled(15).unwrap());
        assert!(drivetrain.is_settled(16).unwrap());

        sim.set_encoder_total(motor(1), -17);
        assert!(!drivetrain.is_settled(16).unwrap());
    }

    #[test]
    fn test_is_settled_has_no_side_effects() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        let frames = sim.frames_written();
        assert!(!drivetrain.is_settled(15).unwrap());
        assert_eq!(sim.frames_written(), frames);
        assert_eq!(drivetrain.phase(), MotionPhase::Tracking);
    }

    #[test]
    fn test_halt_after_failure() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(50.0);
        drivetrain.step().unwrap();
        assert_ne!(sim.last_frame().powers(), [0; 4]);

        sim.set_responding(false);
        assert!(drivetrain.step().is_err());
        assert!(drivetrain.halt().is_err());

        sim.set_responding(true);
        drivetrain.halt().unwrap();
        assert_eq!(sim.last_frame().powers(), [0; 4]);
    }

    #[test]
    fn test_hold_position() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(10.0);
        sim.set_encoder_total(motor(1), 30);
        drivetrain.hold_position().unwrap();
        assert_eq!(drivetrain.target_ticks(Side::Left), 30.0);
        assert_eq!(drivetrain.phase(), MotionPhase::Idle);
    }

    #[test]
    fn test_hold_last_position_without_bus() {
        let (sim, mut drivetrain) = drivetrain();
        drivetrain.move_cm(100.0);
        sim.set_encoder_total(motor(1), 30);
        sim.set_encoder_total(motor(2), -20);
        drivetrain.step().unwrap();

        sim.set_responding(false);
        assert!(drivetrain.hold_position().is_err());
        drivetrain.hold_last_position();
        assert_eq!(drivetrain.target_ticks(Side::Left), 30.0);
        assert_eq!(drivetrain.target_ticks(Side::Right), 20.0);
        assert_eq!(drivetrain.pid_memory(Side::Left), PidMemory::default());
        assert_eq!(drivetrain.phase(), MotionPhase::Idle);

        // Wheels where they were last seen: nothing to correct
        sim.set_responding(true);
        let report = drivetrain.step().unwrap();
        assert_eq!((report.left.power, report.right.power), (0, 0));
    }

    #[test]
    fn test_custom_wiring() {
        let mut config = DrivetrainConfig::default();
        config.left = ChannelBinding {
            motor: motor(3),
            motor_reversed: false,
            encoder_reversed: false,
        };
        config.right = ChannelBinding {
            motor: motor(4),
            motor_reversed: true,
            encoder_reversed: true,
        };
        let (sim, mut drivetrain) = drivetrain_with(config);
        drivetrain.set_power(Side::Left, 200).unwrap();
        drivetrain.set_power(Side::Right, 200).unwrap();
        assert_eq!(sim.last_frame().powers(), [0, 0, 200, -200]);
    }
}
