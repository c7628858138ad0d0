// Simulated motor driver board
//
// Speaks the same register protocol as the real board through the
// embedded-hal I2C trait. Clones share state, so a test can keep one handle
// while the MotorBoard owns another.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use super::board::{DEVICE_ADDRESS, MOTOR_COUNT, MotorId, POWER_LIMIT, Register, RegisterFrame};

/// First-order wheel model: encoder speed proportional to commanded power
#[derive(Debug, Clone, Copy)]
struct WheelResponse {
    ticks_per_sec: f64,
    // Sign relating board power to encoder direction, per motor
    wiring: [f64; MOTOR_COUNT],
}

struct SimState {
    responding: bool,
    // Reads NACK while writes still land
    reads_responding: bool,
    frame: RegisterFrame,
    totals: [f64; MOTOR_COUNT],
    response: Option<WheelResponse>,
    last_update: Instant,
    frames_written: usize,
}

impl SimState {
    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        let Some(response) = self.response else {
            return;
        };
        for (i, total) in self.totals.iter_mut().enumerate() {
            let duty = self.frame.powers()[i] as f64 / POWER_LIMIT as f64;
            *total += duty * response.ticks_per_sec * response.wiring[i] * dt;
        }
    }

    fn write_registers(&mut self, register: u8, payload: &[u8]) -> Result<(), ErrorKind> {
        if register != Register::PwmControl as u8 {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
        }
        let bytes: &[u8; 2 * MOTOR_COUNT] = payload
            .try_into()
            .map_err(|_| ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data))?;
        self.frame = RegisterFrame::decode(bytes);
        self.frames_written += 1;
        Ok(())
    }

    fn read_register(&self, register: u8) -> Result<u16, ErrorKind> {
        let base = Register::EncoderTotal as u8;
        if !(base..base + 2 * MOTOR_COUNT as u8).contains(&register) {
            return Err(ErrorKind::Other);
        }
        let offset = (register - base) as usize;
        let total = self.totals[offset / 2].round() as i32 as u32;
        Ok(if offset % 2 == 0 {
            (total >> 16) as u16
        } else {
            total as u16
        })
    }
}

/// In-memory stand-in for the motor driver board
#[derive(Clone)]
pub struct SimulatedBoard {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    /// A board whose encoders only move when told to
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                responding: true,
                reads_responding: true,
                frame: RegisterFrame::zero(),
                totals: [0.0; MOTOR_COUNT],
                response: None,
                last_update: Instant::now(),
                frames_written: 0,
            })),
        }
    }

    /// Let the wheels turn: at full power a motor advances `ticks_per_sec`
    /// encoder ticks per second, in the direction given by its `wiring` sign.
    pub fn with_wheel_response(self, ticks_per_sec: f64, wiring: [i8; MOTOR_COUNT]) -> Self {
        {
            let mut state = self.state();
            state.advance();
            state.response = Some(WheelResponse {
                ticks_per_sec,
                wiring: wiring.map(|w| w.signum() as f64),
            });
        }
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When false, every transaction is NACKed
    pub fn set_responding(&self, responding: bool) {
        self.state().responding = responding;
    }

    /// When false, only read transfers are NACKed; power writes still land
    pub fn set_reads_responding(&self, responding: bool) {
        self.state().reads_responding = responding;
    }

    pub fn set_encoder_total(&self, motor: MotorId, total: i32) {
        let mut state = self.state();
        state.advance();
        state.totals[motor.index()] = total as f64;
    }

    pub fn encoder_total(&self, motor: MotorId) -> i32 {
        let mut state = self.state();
        state.advance();
        state.totals[motor.index()].round() as i32
    }

    /// Frame most recently written by the host
    pub fn last_frame(&self) -> RegisterFrame {
        self.state().frame
    }

    pub fn frames_written(&self) -> usize {
        self.state().frames_written
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorType for SimulatedBoard {
    type Error = ErrorKind;
}

impl I2c for SimulatedBoard {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), ErrorKind> {
        let mut state = self.state();
        state.advance();

        if !state.responding || address != DEVICE_ADDRESS {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }

        let mut pointer = None;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => {
                    let Some((&register, payload)) = bytes.split_first() else {
                        continue;
                    };
                    pointer = Some(register);
                    if !payload.is_empty() {
                        state.write_registers(register, payload)?;
                    }
                }
                Operation::Read(buf) => {
                    if !state.reads_responding {
                        return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
                    }
                    let register = pointer.ok_or(ErrorKind::Other)?;
                    for (i, chunk) in buf.chunks_mut(2).enumerate() {
                        let value = state.read_register(register + i as u8)?;
                        let bytes = value.to_be_bytes();
                        chunk.copy_from_slice(&bytes[..chunk.len()]);
                    }
                }
            }
        }
        Ok(())
    }
}
