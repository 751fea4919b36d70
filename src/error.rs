//! Error types for the training harness.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raised when a neck is built with channel lists that cannot line up
    #[error("Invalid channels: {0}")]
    InvalidChannels(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Checkpoint error at {path:?}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },

    #[error(
        "Insufficient device memory: one training step needs ~{required} bytes, \
         {available} bytes available"
    )]
    InsufficientMemory { required: u64, available: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),

    #[error("Config serialize error: {0}")]
    RonSer(#[from] ron::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn checkpoint(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            msg: msg.into(),
        }
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Shape(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
