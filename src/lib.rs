// Closed-loop drivetrain runtime for a two-wheeled differential-drive robot

pub mod config;
pub mod control;
pub mod fault;
pub mod messages;
pub mod motor;
pub mod runtime;
