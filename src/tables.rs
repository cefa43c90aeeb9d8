//! Gain-equalisation and Q-vector calibration tables.

use crate::error::{QvecError, Result};
use crate::hist::Histogram;
use crate::qvec::SubPopulation;

/// Upper edge (exclusive) of the calibrated centrality range.
pub const MAX_CALIBRATED_CENTRALITY: f32 = 80.0;
/// One-percent bins covering the calibrated range.
pub const CENTRALITY_BINS: usize = 80;
pub const PARAMETER_SLOTS: usize = 6;

/// Relative channel gains for one detector family.
#[derive(Clone, Debug, PartialEq)]
pub struct GainTable {
    gains: Vec<f32>,
}

impl GainTable {
    pub fn unity(channels: usize) -> Self {
        Self {
            gains: vec![1.0; channels],
        }
    }

    pub fn from_values(gains: Vec<f32>) -> Self {
        Self { gains }
    }

    pub fn len(&self) -> usize {
        self.gains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gains.is_empty()
    }

    pub fn is_unity(&self) -> bool {
        self.gains.iter().all(|&g| g == 1.0)
    }

    /// Gain-corrected amplitude, `None` when the channel has no usable gain.
    pub fn correct(&self, channel: u32, amplitude: f32) -> Option<f64> {
        let gain = *self.gains.get(channel as usize)?;
        if !(gain.is_finite() && gain > 0.0) {
            return None;
        }
        Some(f64::from(amplitude) / f64::from(gain))
    }
}

/// Per-bin correction constants for one sub-population.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CalibParams {
    pub mean_x: f64,
    pub mean_y: f64,
    pub twist_x: f64,
    pub twist_y: f64,
    pub rescale_x: f64,
    pub rescale_y: f64,
}

impl CalibParams {
    /// Parameters that leave a Q-vector unchanged.
    pub const IDENTITY: CalibParams = CalibParams {
        mean_x: 0.0,
        mean_y: 0.0,
        twist_x: 0.0,
        twist_y: 0.0,
        rescale_x: 1.0,
        rescale_y: 1.0,
    };
}

/// Calibration histogram indexed by (centrality bin, parameter slot, sub-population).
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationTable {
    hist: Histogram,
}

impl CalibrationTable {
    pub fn from_histogram(key: &str, hist: Histogram) -> Result<Self> {
        let axes = hist.axes();
        let bad = |reason: String| QvecError::BadCalibration {
            key: key.to_string(),
            reason,
        };
        if axes.len() != 3 {
            return Err(bad(format!("expected 3 axes, found {}", axes.len())));
        }
        if axes[0].bins < CENTRALITY_BINS {
            return Err(bad(format!(
                "centrality axis must have at least {} bins, found {}",
                CENTRALITY_BINS, axes[0].bins
            )));
        }
        if axes[1].bins != PARAMETER_SLOTS {
            return Err(bad(format!(
                "parameter axis must have {} bins, found {}",
                PARAMETER_SLOTS, axes[1].bins
            )));
        }
        if axes[2].bins != SubPopulation::COUNT {
            return Err(bad(format!(
                "sub-population axis must have {} bins, found {}",
                SubPopulation::COUNT,
                axes[2].bins
            )));
        }
        Ok(Self { hist })
    }

    /// Constants for the 1-based centrality `bin`, `None` past the table.
    pub fn params(&self, bin: usize, sub: SubPopulation) -> Option<CalibParams> {
        let slot = sub.index() + 1;
        let value = |param: usize| self.hist.bin_content(&[bin, param, slot]);
        Some(CalibParams {
            mean_x: value(1)?,
            mean_y: value(2)?,
            twist_x: value(3)?,
            twist_y: value(4)?,
            rescale_x: value(5)?,
            rescale_y: value(6)?,
        })
    }
}

/// 1-based calibration bin `floor(cent) + 1`, only for `0 <= cent < 80`.
pub fn centrality_bin(cent: f32) -> Option<usize> {
    if (0.0..MAX_CALIBRATED_CENTRALITY).contains(&cent) {
        Some(cent.floor() as usize + 1)
    } else {
        None
    }
}
