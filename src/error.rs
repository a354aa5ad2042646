use thiserror::Error;

use crate::config::ConfigError;
use crate::led_ring::LedRingError;

pub type Result<T> = std::result::Result<T, EdgeError>;

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Model loading error: {0}")]
    ModelLoadError(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("LED ring error: {0}")]
    LedRing(#[from] LedRingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
