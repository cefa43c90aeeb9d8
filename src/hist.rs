use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistError {
    #[error("histogram needs at least one axis")]
    NoAxes,
    #[error("axis {index} is invalid: {bins} bins over [{min}, {max})")]
    BadAxis {
        index: usize,
        bins: usize,
        min: f64,
        max: f64,
    },
    #[error("content length mismatch: expected {expected}, got {got}")]
    ContentLength { expected: usize, got: usize },
    #[error("histogram too large: more than {MAX_BINS} bins")]
    TooLarge,
    #[error("coordinate count mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
}

/// Upper bound on the dense bin count of one histogram.
pub const MAX_BINS: usize = 1 << 28;

/// Fixed-width binning over `[min, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub bins: usize,
    pub min: f64,
    pub max: f64,
}

impl Axis {
    pub const fn new(bins: usize, min: f64, max: f64) -> Self {
        Self { bins, min, max }
    }

    fn is_valid(&self) -> bool {
        self.bins > 0 && self.min.is_finite() && self.max.is_finite() && self.max > self.min
    }

    pub fn width(&self) -> f64 {
        (self.max - self.min) / self.bins as f64
    }

    /// 0-based bin of `x`, `None` for under/overflow and NaN.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.min && x < self.max) {
            return None;
        }
        let idx = ((x - self.min) / self.width()).floor() as usize;
        // Rounding at the upper edge can land one past the last bin.
        Some(idx.min(self.bins - 1))
    }
}

#[derive(Deserialize)]
struct HistogramRepr {
    axes: Vec<Axis>,
    #[serde(default)]
    contents: Option<Vec<f64>>,
    #[serde(default)]
    entries: u64,
}

/// Dense N-dimensional histogram with row-major contents (last axis fastest).
///
/// Used for the calibration tables (3-D), the QA monitors and the NUA weight
/// maps. Under/overflow is not stored: fills outside the axes only bump the
/// entry counter, lookups outside return `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HistogramRepr")]
pub struct Histogram {
    axes: Vec<Axis>,
    contents: Vec<f64>,
    entries: u64,
}

impl TryFrom<HistogramRepr> for Histogram {
    type Error = HistError;

    fn try_from(repr: HistogramRepr) -> Result<Self, Self::Error> {
        let mut hist = match repr.contents {
            Some(contents) => Histogram::from_contents(repr.axes, contents)?,
            None => Histogram::new(repr.axes)?,
        };
        hist.entries = repr.entries;
        Ok(hist)
    }
}

impl Histogram {
    pub fn new(axes: Vec<Axis>) -> Result<Self, HistError> {
        let total = validate_axes(&axes)?;
        Ok(Self {
            axes,
            contents: vec![0.0; total],
            entries: 0,
        })
    }

    pub fn from_contents(axes: Vec<Axis>, contents: Vec<f64>) -> Result<Self, HistError> {
        let total = validate_axes(&axes)?;
        if contents.len() != total {
            return Err(HistError::ContentLength {
                expected: total,
                got: contents.len(),
            });
        }
        Ok(Self {
            axes,
            contents,
            entries: 0,
        })
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn dimensions(&self) -> usize {
        self.axes.len()
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    fn linear_index(&self, bins0: impl Iterator<Item = usize>) -> usize {
        let mut index = 0usize;
        for (axis, bin) in self.axes.iter().zip(bins0) {
            index = index * axis.bins + bin;
        }
        index
    }

    fn locate(&self, coords: &[f64]) -> Result<Option<usize>, HistError> {
        if coords.len() != self.axes.len() {
            return Err(HistError::Dimension {
                expected: self.axes.len(),
                got: coords.len(),
            });
        }
        let mut bins = Vec::with_capacity(coords.len());
        for (axis, &x) in self.axes.iter().zip(coords) {
            match axis.find_bin(x) {
                Some(b) => bins.push(b),
                None => return Ok(None),
            }
        }
        Ok(Some(self.linear_index(bins.into_iter())))
    }

    pub fn fill(&mut self, coords: &[f64]) -> Result<(), HistError> {
        self.fill_weighted(coords, 1.0)
    }

    pub fn fill_weighted(&mut self, coords: &[f64], weight: f64) -> Result<(), HistError> {
        let slot = self.locate(coords)?;
        self.entries += 1;
        if let Some(idx) = slot {
            self.contents[idx] += weight;
        }
        Ok(())
    }

    /// Content at 1-based per-axis bin indices, `None` when any index is out of range.
    pub fn bin_content(&self, bins1: &[usize]) -> Option<f64> {
        if bins1.len() != self.axes.len() {
            return None;
        }
        if bins1
            .iter()
            .zip(&self.axes)
            .any(|(&b, axis)| b == 0 || b > axis.bins)
        {
            return None;
        }
        let idx = self.linear_index(bins1.iter().map(|b| b - 1));
        self.contents.get(idx).copied()
    }

    pub fn content_at(&self, coords: &[f64]) -> Option<f64> {
        match self.locate(coords) {
            Ok(Some(idx)) => self.contents.get(idx).copied(),
            _ => None,
        }
    }

    /// Sum of contents over every axis except `axis`.
    pub fn projection(&self, axis: usize) -> Vec<f64> {
        let Some(target) = self.axes.get(axis) else {
            return Vec::new();
        };
        let mut out = vec![0.0; target.bins];
        // Bounded by the validated total.
        let stride: usize = self.axes[axis + 1..].iter().map(|a| a.bins).product();
        for (idx, value) in self.contents.iter().enumerate() {
            out[(idx / stride) % target.bins] += value;
        }
        out
    }

    pub fn reset(&mut self) {
        self.contents.iter_mut().for_each(|v| *v = 0.0);
        self.entries = 0;
    }
}

fn validate_axes(axes: &[Axis]) -> Result<usize, HistError> {
    if axes.is_empty() {
        return Err(HistError::NoAxes);
    }
    for (index, axis) in axes.iter().enumerate() {
        if !axis.is_valid() {
            return Err(HistError::BadAxis {
                index,
                bins: axis.bins,
                min: axis.min,
                max: axis.max,
            });
        }
    }
    axes.iter()
        .try_fold(1usize, |total, a| total.checked_mul(a.bins))
        .filter(|&total| total <= MAX_BINS)
        .ok_or(HistError::TooLarge)
}
