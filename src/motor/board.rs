// Register protocol for the 4-channel I2C motor driver board
//
// Power frame: one 8-byte write to the PWM control register, four big-endian
// i16 values (motor 1..4), each clamped to [-1000, 1000].
// Encoder totals: per motor, a high and a low 16-bit register, big-endian,
// combined into a signed 32-bit accumulator.

use std::sync::{Mutex, MutexGuard, PoisonError};

use embedded_hal::i2c::{ErrorKind, I2c};
use tracing::debug;

/// 7-bit I2C address of the motor driver board
pub const DEVICE_ADDRESS: u8 = 0x26;

/// Largest power magnitude the board accepts
pub const POWER_LIMIT: i32 = 1000;

/// Number of physical motor channels on the board
pub const MOTOR_COUNT: usize = 4;

/// Register addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    PwmControl = 0x07,  // 8 bytes, write-only
    EncoderTotal = 0x20, // base of 8 x 16-bit registers, read-only
}

/// Error types for board communication
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Bus transport error at register 0x{register:02X}: {kind:?}")]
    Transport { register: u8, kind: ErrorKind },

    #[error("Invalid motor channel {0} (expected 1..=4)")]
    InvalidChannel(u8),

    #[error("Register pair at 0x{0:02X} runs past the register map")]
    InvalidRegister(u8),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Physical motor channel on the board, always within 1..=4
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MotorId(u8);

impl MotorId {
    pub const M1: MotorId = MotorId(1);
    pub const M2: MotorId = MotorId(2);
    pub const M3: MotorId = MotorId(3);
    pub const M4: MotorId = MotorId(4);

    pub fn new(channel: u8) -> Result<Self> {
        if (1..=MOTOR_COUNT as u8).contains(&channel) {
            Ok(Self(channel))
        } else {
            Err(BusError::InvalidChannel(channel))
        }
    }

    pub fn all() -> [MotorId; MOTOR_COUNT] {
        [Self::M1, Self::M2, Self::M3, Self::M4]
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based slot in the power frame and offset tables
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Register holding the high half of this motor's encoder total
    pub fn encoder_register(self) -> u8 {
        Register::EncoderTotal as u8 + (self.index() as u8) * 2
    }
}

impl TryFrom<u8> for MotorId {
    type Error = BusError;

    fn try_from(channel: u8) -> Result<Self> {
        MotorId::new(channel)
    }
}

impl From<MotorId> for u8 {
    fn from(id: MotorId) -> u8 {
        id.0
    }
}

/// Selects one motor or every motor on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorSelect {
    One(MotorId),
    All,
}

/// Four clamped motor powers, ready to be written in one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFrame {
    powers: [i16; MOTOR_COUNT],
}

impl RegisterFrame {
    /// Build a frame, clamping every value to [-POWER_LIMIT, POWER_LIMIT]
    pub fn new(powers: [i32; MOTOR_COUNT]) -> Self {
        Self {
            powers: powers.map(clamp_power),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn powers(&self) -> [i16; MOTOR_COUNT] {
        self.powers
    }

    pub fn power(&self, motor: MotorId) -> i16 {
        self.powers[motor.index()]
    }

    /// Copy of this frame with one slot replaced
    pub fn with_power(mut self, motor: MotorId, power: i32) -> Self {
        self.powers[motor.index()] = clamp_power(power);
        self
    }

    /// Big-endian wire encoding, motor 1 first
    pub fn encode(&self) -> [u8; 2 * MOTOR_COUNT] {
        let mut bytes = [0u8; 2 * MOTOR_COUNT];
        for (chunk, power) in bytes.chunks_exact_mut(2).zip(self.powers) {
            chunk.copy_from_slice(&power.to_be_bytes());
        }
        bytes
    }

    /// Decode a frame from its wire encoding (values are re-clamped)
    pub fn decode(bytes: &[u8; 2 * MOTOR_COUNT]) -> Self {
        let mut powers = [0i32; MOTOR_COUNT];
        for (power, chunk) in powers.iter_mut().zip(bytes.chunks_exact(2)) {
            *power = i16::from_be_bytes([chunk[0], chunk[1]]) as i32;
        }
        Self::new(powers)
    }
}

fn clamp_power(power: i32) -> i16 {
    power.clamp(-POWER_LIMIT, POWER_LIMIT) as i16
}

/// Combine the two 16-bit halves of an encoder total into a signed value
pub fn combine_register_pair(high: u16, low: u16) -> i32 {
    (((high as u32) << 16) | low as u32) as i32
}

struct BoardInner<I> {
    i2c: I,
    // Last power sent to each motor, reused for the slots a write leaves alone
    frame: RegisterFrame,
}

/// Motor driver board - owns the I2C bus and serializes every transaction
///
/// The lock is held for exactly one register transaction at a time, so a
/// control loop and a commanding task can share the board without one of
/// them holding the bus across several transfers.
pub struct MotorBoard<I> {
    inner: Mutex<BoardInner<I>>,
}

impl<I: I2c> MotorBoard<I> {
    pub fn new(i2c: I) -> Self {
        Self {
            inner: Mutex::new(BoardInner {
                i2c,
                frame: RegisterFrame::zero(),
            }),
        }
    }

    // A panic in another holder cannot leave the bus half-written: every
    // transaction is a single I2C call, so the state is still usable.
    fn lock(&self) -> MutexGuard<'_, BoardInner<I>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a complete power frame in a single locked transaction
    pub fn write_power_frame(&self, frame: RegisterFrame) -> Result<()> {
        let mut inner = self.lock();
        write_frame(&mut inner.i2c, &frame)?;
        inner.frame = frame;
        Ok(())
    }

    /// Set the power of one motor (or all of them)
    ///
    /// Slots that are not selected keep their last written value. Updating
    /// the cached frame and writing it happen under the same lock.
    pub fn set_motor_power(&self, select: MotorSelect, power: i32) -> Result<()> {
        let mut inner = self.lock();
        let frame = match select {
            MotorSelect::One(motor) => inner.frame.with_power(motor, power),
            MotorSelect::All => RegisterFrame::new([power; MOTOR_COUNT]),
        };
        write_frame(&mut inner.i2c, &frame)?;
        inner.frame = frame;
        Ok(())
    }

    /// Last frame successfully written to the board
    pub fn last_frame(&self) -> RegisterFrame {
        self.lock().frame
    }

    /// Read one 16-bit register in its own locked transaction
    pub fn read_register(&self, register: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.lock()
            .i2c
            .write_read(DEVICE_ADDRESS, &[register], &mut buf)
            .map_err(|e| transport(register, e))?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Read the high register at `base` and the low register at `base + 1`
    ///
    /// Each half is its own locked transaction; the pair as a whole is not
    /// atomic. If the board's accumulator carries across the 16-bit boundary
    /// between the two reads, the combined value is torn.
    pub fn read_register_pair(&self, base: u8) -> Result<i32> {
        let low_register = base
            .checked_add(1)
            .ok_or(BusError::InvalidRegister(base))?;
        let high = self.read_register(base)?;
        let low = self.read_register(low_register)?;
        let value = combine_register_pair(high, low);
        debug!("Read register pair 0x{:02X}: {}", base, value);
        Ok(value)
    }

    /// Raw encoder total for a motor, not adjusted by any offset
    pub fn read_encoder_raw(&self, motor: MotorId) -> Result<i32> {
        self.read_register_pair(motor.encoder_register())
    }

    /// Give the bus back, e.g. to inspect a test double
    pub fn into_inner(self) -> I {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .i2c
    }
}

fn write_frame<I: I2c>(i2c: &mut I, frame: &RegisterFrame) -> Result<()> {
    let register = Register::PwmControl as u8;
    let mut packet = [0u8; 1 + 2 * MOTOR_COUNT];
    packet[0] = register;
    packet[1..].copy_from_slice(&frame.encode());

    debug!("Write power frame: {:?}", frame.powers());
    i2c.write(DEVICE_ADDRESS, &packet)
        .map_err(|e| transport(register, e))
}

fn transport<E: embedded_hal::i2c::Error>(register: u8, error: E) -> BusError {
    BusError::Transport {
        register,
        kind: error.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, NoAcknowledgeSource, Operation};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records every transaction and flags any two that overlap in time
    #[derive(Default, Clone)]
    struct ProbeBus {
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        registers: [u16; 8],
        fail: bool,
    }

    impl ErrorType for ProbeBus {
        type Error = ErrorKind;
    }

    impl I2c for ProbeBus {
        fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> std::result::Result<(), ErrorKind> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::yield_now();

            let mut pointer = 0u8;
            for op in operations.iter_mut() {
                match op {
                    Operation::Write(bytes) => {
                        pointer = bytes[0];
                        if bytes.len() > 1 {
                            self.writes.lock().unwrap().push(bytes.to_vec());
                        }
                    }
                    Operation::Read(buf) => {
                        let idx = (pointer - Register::EncoderTotal as u8) as usize;
                        buf.copy_from_slice(&self.registers[idx].to_be_bytes());
                    }
                }
            }

            self.busy.store(false, Ordering::SeqCst);
            if self.fail {
                Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_frame_encoding() {
        let frame = RegisterFrame::new([300, -300, 0, 0]);
        assert_eq!(
            frame.encode(),
            [0x01, 0x2C, 0xFE, 0xD4, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_frame_clamps_power() {
        let frame = RegisterFrame::new([5000, -5000, 1000, -1001]);
        assert_eq!(frame.powers(), [1000, -1000, 1000, -1000]);
        // 1000 = 0x03E8, -1000 = 0xFC18
        assert_eq!(&frame.encode()[..4], &[0x03, 0xE8, 0xFC, 0x18]);
    }

    #[test]
    fn test_frame_decode() {
        let frame = RegisterFrame::decode(&[0x01, 0x2C, 0xFE, 0xD4, 0, 0, 0x03, 0xE8]);
        assert_eq!(frame.powers(), [300, -300, 0, 1000]);
    }

    #[test]
    fn test_combine_register_pair() {
        assert_eq!(combine_register_pair(0x0000, 0x0001), 1);
        assert_eq!(combine_register_pair(0x0001, 0x0000), 65536);
        assert_eq!(combine_register_pair(0xFFFF, 0xFFFF), -1);
        assert_eq!(combine_register_pair(0x8000, 0x0000), i32::MIN);
        assert_eq!(combine_register_pair(0x7FFF, 0xFFFF), i32::MAX);
    }

    #[test]
    fn test_motor_id_range() {
        assert!(MotorId::new(0).is_err());
        assert_eq!(MotorId::new(5), Err(BusError::InvalidChannel(5)));
        assert_eq!(MotorId::new(1).unwrap().encoder_register(), 0x20);
        assert_eq!(MotorId::new(4).unwrap().encoder_register(), 0x26);
    }

    #[test]
    fn test_set_motor_power_keeps_other_slots() {
        let bus = ProbeBus::default();
        let writes = bus.writes.clone();
        let board = MotorBoard::new(bus);

        board
            .set_motor_power(MotorSelect::One(MotorId::new(1).unwrap()), 300)
            .unwrap();
        board
            .set_motor_power(MotorSelect::One(MotorId::new(2).unwrap()), -300)
            .unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[1],
            vec![0x07, 0x01, 0x2C, 0xFE, 0xD4, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(board.last_frame().powers(), [300, -300, 0, 0]);
    }

    #[test]
    fn test_set_all_motors() {
        let board = MotorBoard::new(ProbeBus::default());
        board.set_motor_power(MotorSelect::All, -5000).unwrap();
        assert_eq!(board.last_frame().powers(), [-1000; 4]);
    }

    #[test]
    fn test_read_register_pair() {
        let mut bus = ProbeBus::default();
        // Motor 2: high at 0x22, low at 0x23
        bus.registers[2] = 0xFFFF;
        bus.registers[3] = 0xFF9C;
        let board = MotorBoard::new(bus);
        assert_eq!(board.read_register_pair(0x22).unwrap(), -100);
        assert_eq!(
            board.read_encoder_raw(MotorId::new(2).unwrap()).unwrap(),
            -100
        );
    }

    #[test]
    fn test_register_pair_past_end() {
        // A failing bus would answer Transport: the check comes first
        let bus = ProbeBus {
            fail: true,
            ..Default::default()
        };
        let board = MotorBoard::new(bus);
        assert_eq!(
            board.read_register_pair(0xFF),
            Err(BusError::InvalidRegister(0xFF))
        );
    }

    #[test]
    fn test_transport_error_propagates() {
        let bus = ProbeBus {
            fail: true,
            ..Default::default()
        };
        let board = MotorBoard::new(bus);

        let err = board.write_power_frame(RegisterFrame::zero()).unwrap_err();
        assert!(matches!(err, BusError::Transport { register: 0x07, .. }));

        let err = board.read_register_pair(0x20).unwrap_err();
        assert!(matches!(err, BusError::Transport { register: 0x20, .. }));

        // A failed write must not update the cached frame
        assert_eq!(board.last_frame(), RegisterFrame::zero());
    }

    #[test]
    fn test_concurrent_transactions_never_overlap() {
        let bus = ProbeBus::default();
        let overlaps = bus.overlaps.clone();
        let board = MotorBoard::new(bus);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..500 {
                    board
                        .write_power_frame(RegisterFrame::new([i, -i, 0, 0]))
                        .unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..500 {
                    board.read_register_pair(0x20).unwrap();
                }
            });
        });

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(board.last_frame().powers(), [499, -499, 0, 0]);
    }
}
