use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("calibration error: {0}")]
    Calibration(String),
    #[error("invalid sweep request: {0}")]
    Sweep(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("pipeline shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;
