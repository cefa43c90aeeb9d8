//! Per-collision Q-vectors for event-plane analyses.
//!
//! Forward-detector amplitudes (FT0-A, FT0-C, FV0-A) and central-barrel tracks
//! are turned into flow vectors per harmonic, then recentered, twisted and
//! rescaled with run-wise calibration constants looked up by centrality.

pub mod args;
pub mod calib;
pub mod error;
pub mod event;
pub mod geom;
pub mod hist;
pub mod output;
pub mod plot;
pub mod qa;
pub mod qvec;
pub mod run_cache;
pub mod store;
pub mod tables;
pub mod task;
pub mod taskfile;
pub mod weights;
pub mod xml;

pub use error::{QvecError, Result};
pub use task::{EventOutput, QvecTask, TaskConfig};
