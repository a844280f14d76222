//! The top-level error type.
use crate::{
    calibrate::CalibrationError,
    channel::ChannelError,
    config::ConfigError,
    counter::ProbeError,
    kernel::Terminated,
    orchestrator::{ProtocolViolation, SetupError},
};

/// An error that aborts a benchmark run.
///
/// Measurement instability is not an error; it is flagged in the
/// [`ResultSet`](crate::ResultSet).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BenchError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error("Could not initialize the timing probe")]
    Probe(#[from] ProbeError),
    #[error("Could not calibrate the instrumentation overhead")]
    Calibration(#[from] CalibrationError),
    #[error("Could not set up a scenario")]
    Setup(#[from] SetupError),
    #[error("Could not decode a result message")]
    Channel(#[from] ChannelError),
    #[error("The result protocol was violated")]
    Protocol(#[from] ProtocolViolation),
    #[error("The harness context was terminated")]
    Terminated(#[from] Terminated),
}
