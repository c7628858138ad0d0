// Encoder zero-offset tracking
//
// The board only exposes running totals, so a reset is emulated by storing
// the current raw total as a baseline and subtracting it on every read.

use std::sync::Arc;

use embedded_hal::i2c::I2c;
use tracing::debug;

use super::board::{MotorBoard, MotorId, MOTOR_COUNT, Result};

/// Which encoder(s) a reset applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderSelect {
    One(MotorId),
    All,
}

/// Encoder positions relative to the last reset
pub struct EncoderTracker<I> {
    board: Arc<MotorBoard<I>>,
    offsets: [i32; MOTOR_COUNT],
}

impl<I: I2c> EncoderTracker<I> {
    /// Create a tracker with all offsets at zero (raw totals are reported)
    pub fn new(board: Arc<MotorBoard<I>>) -> Self {
        Self {
            board,
            offsets: [0; MOTOR_COUNT],
        }
    }

    /// Capture the current raw total(s) as the new zero
    pub fn reset(&mut self, select: EncoderSelect) -> Result<()> {
        match select {
            EncoderSelect::One(motor) => self.reset_one(motor),
            EncoderSelect::All => {
                for motor in MotorId::all() {
                    self.reset_one(motor)?;
                }
                Ok(())
            }
        }
    }

    fn reset_one(&mut self, motor: MotorId) -> Result<()> {
        let raw = self.board.read_encoder_raw(motor)?;
        self.offsets[motor.index()] = raw;
        debug!("Encoder {} reset at raw {}", motor.get(), raw);
        Ok(())
    }

    /// Position of a channel (1..=4) since its last reset
    pub fn read(&self, channel: u8) -> Result<i32> {
        self.position(MotorId::new(channel)?)
    }

    /// Position of a motor since its last reset
    pub fn position(&self, motor: MotorId) -> Result<i32> {
        let raw = self.board.read_encoder_raw(motor)?;
        Ok(raw.wrapping_sub(self.offsets[motor.index()]))
    }

    pub fn offset(&self, motor: MotorId) -> i32 {
        self.offsets[motor.index()]
    }
}
