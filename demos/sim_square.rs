// Drive a 30 cm square on the simulated board and print where it ended up
//
//   RUST_LOG=debug cargo run --example sim_square
use std::sync::Arc;
use std::time::Duration;

use diffdrive_runtime::config::{
    DrivetrainConfig, LOOP_HZ, SETTLE_TOLERANCE_TICKS, SIM_TICKS_PER_SEC,
};
use diffdrive_runtime::control;
use diffdrive_runtime::motor::{Drivetrain, MotorBoard, SimulatedBoard};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SIDE_CM: f64 = 30.0;
const LEG_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = DrivetrainConfig::default();
    let sim = SimulatedBoard::new().with_wheel_response(SIM_TICKS_PER_SEC, config.sim_wiring());
    let board = Arc::new(MotorBoard::new(sim));
    let drivetrain = Drivetrain::new(board, &config)?;

    let period = Duration::from_micros(1_000_000 / LOOP_HZ);
    let (drive, task) = control::spawn(drivetrain, period);

    for leg in 1..=4 {
        drive.move_cm(SIDE_CM).await?;
        drive
            .wait_settled(SETTLE_TOLERANCE_TICKS, Some(LEG_TIMEOUT))
            .await?;
        drive.turn_degrees(90.0).await?;
        drive
            .wait_settled(SETTLE_TOLERANCE_TICKS, Some(LEG_TIMEOUT))
            .await?;

        let status = drive.status();
        info!(
            "Leg {} done: left={} right={} ticks",
            leg, status.left.position, status.right.position
        );
    }

    drive.shutdown();
    task.await?;
    info!("Square complete");
    Ok(())
}
