//! Recenter, twist and rescale corrections.
//!
//! Every sub-population carries four stages:
//!   [uncorrected, recentered, recentered+twisted, recentered+twisted+rescaled]
//! Each later stage starts again from the raw vector and reapplies the recenter
//! step with the same bin constants.

use crate::qvec::{QStatus, QVector, RawQVector};
use crate::tables::CalibParams;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Uncorrected,
    Recentered,
    Twisted,
    Rescaled,
}

impl Stage {
    pub const COUNT: usize = 4;
    pub const ALL: [Stage; 4] = [
        Stage::Uncorrected,
        Stage::Recentered,
        Stage::Twisted,
        Stage::Rescaled,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

pub fn recenter(q: QVector, p: &CalibParams) -> QVector {
    QVector::new(q.re - p.mean_x, q.im - p.mean_y)
}

/// Shear decorrelation; `None` when `1 - tx*ty` is zero or not finite.
pub fn twist(q: QVector, p: &CalibParams) -> Option<QVector> {
    let denom = 1.0 - p.twist_x * p.twist_y;
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    Some(QVector::new(
        (q.re - p.twist_x * q.im) / denom,
        (q.im - p.twist_y * q.re) / denom,
    ))
}

/// Per-axis width normalisation; `None` when either width is zero or not finite.
pub fn rescale(q: QVector, p: &CalibParams) -> Option<QVector> {
    let usable = |w: f64| w != 0.0 && w.is_finite();
    if !usable(p.rescale_x) || !usable(p.rescale_y) {
        return None;
    }
    Some(QVector::new(q.re / p.rescale_x, q.im / p.rescale_y))
}

/// A Q-vector at all four calibration stages.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StagedQVector {
    stages: [QVector; Stage::COUNT],
    pub weight: f64,
    pub status: QStatus,
    /// Correction steps skipped because of a degenerate constant.
    pub degenerate: u8,
}

impl StagedQVector {
    /// All four stages equal to the raw value.
    pub fn uncalibrated(raw: &RawQVector) -> Self {
        Self {
            stages: [raw.q; Stage::COUNT],
            weight: raw.weight,
            status: raw.status,
            degenerate: 0,
        }
    }

    /// Only computed vectors are corrected; sentinels pass through unchanged.
    pub fn calibrate(raw: &RawQVector, p: &CalibParams) -> Self {
        if !raw.is_computed() {
            return Self::uncalibrated(raw);
        }
        let mut degenerate = 0u8;
        let recentered = recenter(raw.q, p);
        let twisted = match twist(recentered, p) {
            Some(q) => q,
            None => {
                degenerate += 1;
                recentered
            }
        };
        // Same inputs and constants as the twisted stage, so reuse it.
        let rescaled = match rescale(twisted, p) {
            Some(q) => q,
            None => {
                degenerate += 1;
                twisted
            }
        };
        Self {
            stages: [raw.q, recentered, twisted, rescaled],
            weight: raw.weight,
            status: raw.status,
            degenerate,
        }
    }

    pub fn stage(&self, stage: Stage) -> QVector {
        self.stages[stage.index()]
    }

    /// The value exposed in the output records.
    pub fn final_value(&self) -> QVector {
        self.stage(Stage::Rescaled)
    }
}
