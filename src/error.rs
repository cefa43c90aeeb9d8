//! Error types for the Q-vector producer

use thiserror::Error;

use crate::hist::HistError;
use crate::output::OutputError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum QvecError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Could not get the alignment parameters for {detector} (run {run})")]
    MissingAlignment { detector: &'static str, run: i32 },

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Calibration object {key} has unexpected shape: {reason}")]
    BadCalibration { key: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Histogram error: {0}")]
    Hist(#[from] HistError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QvecError {
    pub fn config(message: impl Into<String>) -> Self {
        QvecError::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, QvecError>;
