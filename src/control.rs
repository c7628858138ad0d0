// Periodic control task
//
// The task owns the Drivetrain (targets and PID memory). Other tasks never
// touch it directly: they send commands through a channel and read the
// published status. Bus errors during a tick skip that tick; the next tick
// is the retry. The motors are halted whenever the loop goes away, including
// when its task is aborted or its runtime is dropped.

use std::sync::Arc;
use std::time::Duration;

use embedded_hal::i2c::I2c;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{SETTLE_DELAY, SETTLE_POLL_INTERVAL};
use crate::messages::{DriveCommand, DrivetrainStatus, RuntimeHealth};
use crate::motor::{BusError, DriveError, Drivetrain, Side};

const COMMAND_QUEUE: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, BusError>>;

enum Command {
    Move(f64),
    Turn(f64),
    SetAbsoluteTarget(Side, f64, Reply<()>),
    SetAbsoluteTargets(f64, f64, Reply<()>),
    IsSettled(u32, Reply<bool>),
    Halt(Reply<()>),
}

struct ControlLoop<I: I2c> {
    drivetrain: Drivetrain<I>,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<DrivetrainStatus>,
    period: Duration,
    consecutive_failures: u32,
}

impl<I: I2c> ControlLoop<I> {
    async fn run(mut self) {
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Control loop started: {:?} period", self.period);

        loop {
            tokio::select! {
                biased;

                // Fires on an explicit shutdown and when every handle is gone
                _ = self.shutdown.changed() => break,

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },

                _ = tick.tick() => self.tick(),
            }
        }
        // Drop halts the motors
    }

    fn tick(&mut self) {
        match self.drivetrain.step() {
            Ok(report) => {
                if self.consecutive_failures > 0 {
                    info!(
                        "Bus recovered after {} skipped ticks",
                        self.consecutive_failures
                    );
                    self.consecutive_failures = 0;
                }
                let phase = self.drivetrain.phase();
                self.status.send_modify(|status| {
                    *status = status.with_step(&report);
                    status.phase = phase;
                    status.health = RuntimeHealth::Ok;
                });
            }
            Err(e) => {
                // Log the first failure of a streak, not every tick of it
                if self.consecutive_failures == 0 {
                    warn!("Skipping control tick: {}", e);
                } else {
                    debug!("Skipping control tick: {}", e);
                }
                self.consecutive_failures += 1;
                self.status.send_modify(|status| {
                    status.health = RuntimeHealth::BusDegraded;
                    status.skipped_ticks += 1;
                });
            }
        }
    }

    fn apply(&mut self, cmd: Command) {
        // A dropped reply receiver just means the caller stopped waiting
        match cmd {
            Command::Move(distance_cm) => self.drivetrain.move_cm(distance_cm),
            Command::Turn(degrees) => self.drivetrain.turn_degrees(degrees),
            Command::SetAbsoluteTarget(side, rotations, reply) => {
                let _ = reply.send(self.drivetrain.set_absolute_target(side, rotations));
            }
            Command::SetAbsoluteTargets(left, right, reply) => {
                let _ = reply.send(self.drivetrain.set_absolute_targets(left, right));
            }
            Command::IsSettled(tolerance_ticks, reply) => {
                let _ = reply.send(self.drivetrain.is_settled(tolerance_ticks));
            }
            Command::Halt(reply) => {
                let halted = self.drivetrain.halt();
                let held = self.drivetrain.hold_position();
                if let Err(e) = &held {
                    // The old goal must not come back once the bus recovers
                    warn!("Holding last known position: {}", e);
                    self.drivetrain.hold_last_position();
                }
                let _ = reply.send(halted.and(held));
            }
        }
        let phase = self.drivetrain.phase();
        self.status.send_if_modified(|status| {
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        });
    }
}

impl<I: I2c> Drop for ControlLoop<I> {
    fn drop(&mut self) {
        // Best effort: the error is already logged by halt()
        if self.drivetrain.halt().is_ok() {
            info!("Control loop stopped, motors halted");
        }
        self.status.send_modify(|status| {
            status.health = RuntimeHealth::Stopped;
            status.left.power = 0;
            status.right.power = 0;
        });
    }
}

/// Start the control loop on the current tokio runtime
///
/// The loop calls `step()` every `period` until `DrivetrainHandle::shutdown`
/// is called or every handle is dropped, then halts the motors.
pub fn spawn<I>(drivetrain: Drivetrain<I>, period: Duration) -> (DrivetrainHandle, JoinHandle<()>)
where
    I: I2c + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(DrivetrainStatus {
        phase: drivetrain.phase(),
        ..Default::default()
    });

    let control = ControlLoop {
        drivetrain,
        commands: cmd_rx,
        shutdown: shutdown_rx,
        status: status_tx,
        period,
        consecutive_failures: 0,
    };
    let task = tokio::spawn(control.run());

    let handle = DrivetrainHandle {
        commands: cmd_tx,
        shutdown: Arc::new(shutdown_tx),
        status: status_rx,
        settle_delay: SETTLE_DELAY,
    };
    (handle, task)
}

/// Commanding side of the control loop
#[derive(Clone)]
pub struct DrivetrainHandle {
    commands: mpsc::Sender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    status: watch::Receiver<DrivetrainStatus>,
    settle_delay: Duration,
}

impl DrivetrainHandle {
    /// Use a different pause after a successful settle check
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    async fn send(&self, cmd: Command) -> Result<(), DriveError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| DriveError::LoopStopped)
    }

    async fn request<T>(&self, cmd: impl FnOnce(Reply<T>) -> Command) -> Result<T, DriveError> {
        let (tx, rx) = oneshot::channel();
        self.send(cmd(tx)).await?;
        let result = rx.await.map_err(|_| DriveError::LoopStopped)?;
        Ok(result?)
    }

    pub async fn move_cm(&self, distance_cm: f64) -> Result<(), DriveError> {
        self.send(Command::Move(distance_cm)).await
    }

    pub async fn turn_degrees(&self, degrees: f64) -> Result<(), DriveError> {
        self.send(Command::Turn(degrees)).await
    }

    pub async fn set_absolute_target(&self, side: Side, rotations: f64) -> Result<(), DriveError> {
        self.request(|reply| Command::SetAbsoluteTarget(side, rotations, reply))
            .await
    }

    pub async fn set_absolute_targets(&self, left: f64, right: f64) -> Result<(), DriveError> {
        self.request(|reply| Command::SetAbsoluteTargets(left, right, reply))
            .await
    }

    /// Check whether both sides are within `tolerance_ticks` of their targets
    ///
    /// A positive answer is held back by the settle delay before it is
    /// returned, so a wheel that is only passing through the target has time
    /// to move away again.
    pub async fn is_settled(&self, tolerance_ticks: u32) -> Result<bool, DriveError> {
        let settled = self
            .request(|reply| Command::IsSettled(tolerance_ticks, reply))
            .await?;
        if settled {
            sleep(self.settle_delay).await;
        }
        Ok(settled)
    }

    /// Poll `is_settled` until it succeeds
    ///
    /// With `deadline: None` this waits forever, e.g. on a stalled wheel.
    /// Bus errors during polling are logged and the poll is retried.
    pub async fn wait_settled(
        &self,
        tolerance_ticks: u32,
        deadline: Option<Duration>,
    ) -> Result<(), DriveError> {
        let started = Instant::now();
        loop {
            match self.is_settled(tolerance_ticks).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(DriveError::Bus(e)) => warn!("Settle check failed: {}", e),
                Err(e) => return Err(e),
            }
            if let Some(deadline) = deadline {
                if started.elapsed() >= deadline {
                    return Err(DriveError::SettleTimeout(deadline));
                }
            }
            sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    /// Stop the motors and hold the current position
    pub async fn halt(&self) -> Result<(), DriveError> {
        self.request(Command::Halt).await
    }

    /// Run a command received from outside the process
    pub async fn execute(&self, command: DriveCommand) -> Result<(), DriveError> {
        match command {
            DriveCommand::Move { distance_cm } => self.move_cm(distance_cm).await,
            DriveCommand::Turn { degrees } => self.turn_degrees(degrees).await,
            DriveCommand::SetRotation { side, rotations } => {
                self.set_absolute_target(side, rotations).await
            }
            DriveCommand::SetRotations { left, right } => {
                self.set_absolute_targets(left, right).await
            }
            DriveCommand::Halt => self.halt().await,
        }
    }

    /// Latest published controller state
    pub fn status(&self) -> DrivetrainStatus {
        *self.status.borrow()
    }

    /// Receiver that is notified after every tick
    pub fn subscribe(&self) -> watch::Receiver<DrivetrainStatus> {
        self.status.clone()
    }

    /// Ask the control loop to halt the motors and exit
    pub fn shutdown(&self) {
        // Err only if the loop already exited
        let _ = self.shutdown.send(true);
    }
}
