// Process runtime: bus setup, control loop, zenoh command surface
//
// Commands arrive as JSON on TOPIC_CMD_DRIVE and are forwarded to the control
// task. After every control tick the controller state is published on
// TOPIC_STATE and the health on TOPIC_HEALTH. Ctrl-C stops the control loop,
// which halts the motors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{
    DrivetrainConfig, FAULT_BLINK_INTERVAL, I2C_DEVICE, LOOP_HZ, SIM_TICKS_PER_SEC,
    TOPIC_CMD_DRIVE, TOPIC_HEALTH, TOPIC_STATE,
};
use crate::control::{self, DrivetrainHandle};
use crate::fault::{self, LogIndicator};
use crate::messages::DriveCommand;
use crate::motor::{DriveError, Drivetrain, MotorBoard, PidGains, SimulatedBoard};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Command-line options
#[derive(Debug, Clone, Parser)]
#[command(name = "diffdrive-runtime", about = "Closed-loop differential drivetrain runtime")]
pub struct Options {
    /// I2C device the motor driver board is attached to
    #[arg(long, default_value = I2C_DEVICE)]
    pub i2c: PathBuf,

    /// Run against a simulated board instead of hardware
    #[arg(long)]
    pub simulate: bool,

    /// Control loop frequency in Hz
    #[arg(long, default_value_t = LOOP_HZ, value_parser = clap::value_parser!(u64).range(1..=1000))]
    pub hz: u64,

    /// JSON file with geometry, gains and wiring
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the proportional gain
    #[arg(long)]
    pub kp: Option<f64>,

    /// Override the integral gain
    #[arg(long)]
    pub ki: Option<f64>,

    /// Override the derivative gain
    #[arg(long)]
    pub kd: Option<f64>,

    /// Initial goal in wheel rotations, relative to the start position
    #[arg(long, num_args = 2, value_names = ["LEFT", "RIGHT"], allow_negative_numbers = true)]
    pub rotations: Option<Vec<f64>>,
}

impl Options {
    /// Config file (or defaults) with any gain overrides applied
    pub fn drivetrain_config(&self) -> Result<DrivetrainConfig, DriveError> {
        let mut config = match &self.config {
            Some(path) => DrivetrainConfig::load(path)?,
            None => DrivetrainConfig::default(),
        };
        let gains = config.gains;
        config.gains = PidGains::new(
            self.kp.unwrap_or(gains.kp()),
            self.ki.unwrap_or(gains.ki()),
            self.kd.unwrap_or(gains.kd()),
        )?;
        Ok(config)
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.hz)
    }
}

pub async fn run(options: Options) -> Result<(), BoxError> {
    let config = options.drivetrain_config()?;
    info!(
        "Gains: kp={}, ki={}, kd={}",
        config.gains.kp(),
        config.gains.ki(),
        config.gains.kd()
    );

    if options.simulate {
        info!("Using simulated motor board");
        let board = SimulatedBoard::new().with_wheel_response(SIM_TICKS_PER_SEC, config.sim_wiring());
        run_with_bus(board, &config, &options).await
    } else {
        info!("Opening motor board on {}", options.i2c.display());
        let i2c = I2cdev::new(&options.i2c)
            .map_err(|e| format!("cannot open {}: {}", options.i2c.display(), e))?;
        run_with_bus(i2c, &config, &options).await
    }
}

async fn run_with_bus<I>(i2c: I, config: &DrivetrainConfig, options: &Options) -> Result<(), BoxError>
where
    I: I2c + Send + 'static,
{
    let board = Arc::new(MotorBoard::new(i2c));
    let drivetrain = match Drivetrain::new(board, config) {
        Ok(drivetrain) => drivetrain,
        Err(DriveError::InitializationFault(e)) => {
            error!("Motor board not responding: {} - check wiring and battery", e);
            signal_fault(format!("motor board not responding ({e})")).await;
            return Err(DriveError::InitializationFault(e).into());
        }
        Err(e) => return Err(e.into()),
    };

    let (drive, control_task) = control::spawn(drivetrain, options.period());

    // Whatever serve() returns, the control loop is stopped (and the motors
    // halted) before the error leaves this function
    let result = serve(&drive, options).await;
    drive.shutdown();
    control_task.await?;
    result
}

async fn serve(drive: &DrivetrainHandle, options: &Options) -> Result<(), BoxError> {
    if let Some(goal) = &options.rotations {
        info!("Initial goal: left={} rot, right={} rot", goal[0], goal[1]);
        drive.set_absolute_targets(goal[0], goal[1]).await?;
    }

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    info!("Runtime started: {}Hz control loop", options.hz);
    info!("Subscribed to: {}", TOPIC_CMD_DRIVE);
    info!("Publishing to: {}, {}", TOPIC_STATE, TOPIC_HEALTH);

    let mut status = drive.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping...");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Err("control loop exited unexpectedly".into());
                }

                // 1. Drain all pending commands (non-blocking)
                while let Ok(Some(sample)) = subscriber.try_recv() {
                    let payload = sample.payload().to_bytes();
                    match serde_json::from_slice::<DriveCommand>(&payload) {
                        Ok(cmd) => {
                            info!("Received command: {:?}", cmd);
                            if let Err(e) = drive.execute(cmd).await {
                                warn!("Command {:?} failed: {}", cmd, e);
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse command: {}", e);
                        }
                    }
                }

                // 2. Publish controller state and health
                let snapshot = *status.borrow_and_update();
                let state_json = serde_json::to_string(&snapshot)?;
                pub_state.put(state_json).await?;
                let health_json = serde_json::to_string(&snapshot.health)?;
                pub_health.put(health_json).await?;
            }
        }
    }
}

/// Blink the fault indicator until Ctrl-C
async fn signal_fault(reason: String) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut indicator = LogIndicator::new(reason);

    let interrupt = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
        }
        let _ = stop_tx.send(true);
    };
    tokio::join!(
        fault::blink(&mut indicator, FAULT_BLINK_INTERVAL, stop_rx),
        interrupt
    );
}
