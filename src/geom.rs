use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QvecError, Result};
use crate::store::AlignParam;

// FT0 channel index space: A side 0..96, C side 96..208 (C ids are shifted by 96).
pub const FT0_CHANNELS: usize = 208;
pub const FT0_C_CHANNEL_OFFSET: u32 = 96;
pub const FV0_CHANNELS: usize = 48;

// FV0 cells read out on the left half of the detector; all others are right.
const FV0_LEFT_CELLS: [u32; 24] = [
    0, 1, 2, 3, 8, 9, 10, 11, 16, 17, 18, 19, 24, 25, 26, 27, 32, 40, 33, 41, 34, 42, 35, 43,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Detector {
    Ft0,
    Fv0,
}

impl Detector {
    pub fn name(self) -> &'static str {
        match self {
            Detector::Ft0 => "FT0",
            Detector::Fv0 => "FV0",
        }
    }

    pub fn channel_count(self) -> usize {
        match self {
            Detector::Ft0 => FT0_CHANNELS,
            Detector::Fv0 => FV0_CHANNELS,
        }
    }
}

/// Nominal transverse channel centres (cm), supplied as data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelPositions {
    pub ft0: Vec<[f64; 2]>,
    pub fv0: Vec<[f64; 2]>,
}

impl ChannelPositions {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let positions: ChannelPositions = serde_json::from_str(&text)?;
        positions.validate()?;
        Ok(positions)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ft0.len() != FT0_CHANNELS {
            return Err(QvecError::Geometry(format!(
                "FT0 geometry must list {} channels, found {}",
                FT0_CHANNELS,
                self.ft0.len()
            )));
        }
        if self.fv0.len() != FV0_CHANNELS {
            return Err(QvecError::Geometry(format!(
                "FV0 geometry must list {} channels, found {}",
                FV0_CHANNELS,
                self.fv0.len()
            )));
        }
        if self
            .ft0
            .iter()
            .chain(self.fv0.iter())
            .any(|p| !p[0].is_finite() || !p[1].is_finite())
        {
            return Err(QvecError::Geometry("non-finite channel position".into()));
        }
        Ok(())
    }
}

/// Transverse detector offsets from the alignment objects.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AlignmentOffsets {
    pub ft0_a: [f64; 2],
    pub ft0_c: [f64; 2],
    pub fv0_left: [f64; 2],
    pub fv0_right: [f64; 2],
}

impl AlignmentOffsets {
    /// Offsets from the first two alignment records of each detector
    /// (FT0: A then C side, FV0: left then right half).
    pub fn from_params(ft0: &[AlignParam], fv0: &[AlignParam]) -> Option<Self> {
        if ft0.len() < 2 || fv0.len() < 2 {
            return None;
        }
        Some(Self {
            ft0_a: [ft0[0].x, ft0[0].y],
            ft0_c: [ft0[1].x, ft0[1].y],
            fv0_left: [fv0[0].x, fv0[0].y],
            fv0_right: [fv0[1].x, fv0[1].y],
        })
    }
}

pub fn is_fv0_left_cell(channel: u32) -> bool {
    FV0_LEFT_CELLS.contains(&channel)
}

/// Azimuthal angle of every channel after alignment, fixed for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelAngles {
    ft0: Vec<f64>,
    fv0: Vec<f64>,
}

impl ChannelAngles {
    pub fn new(positions: &ChannelPositions, offsets: &AlignmentOffsets) -> Self {
        let ft0 = positions
            .ft0
            .iter()
            .enumerate()
            .map(|(ch, p)| {
                let off = if (ch as u32) < FT0_C_CHANNEL_OFFSET {
                    offsets.ft0_a
                } else {
                    offsets.ft0_c
                };
                (p[1] + off[1]).atan2(p[0] + off[0])
            })
            .collect();
        let fv0 = positions
            .fv0
            .iter()
            .enumerate()
            .map(|(ch, p)| {
                let off = if is_fv0_left_cell(ch as u32) {
                    offsets.fv0_left
                } else {
                    offsets.fv0_right
                };
                (p[1] + off[1]).atan2(p[0] + off[0])
            })
            .collect();
        Self { ft0, fv0 }
    }

    pub fn phi(&self, detector: Detector, channel: u32) -> Option<f64> {
        let table = match detector {
            Detector::Ft0 => &self.ft0,
            Detector::Fv0 => &self.fv0,
        };
        table.get(channel as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn ring_positions() -> ChannelPositions {
        let ring = |n: usize| {
            (0..n)
                .map(|i| {
                    let a = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
                    [10.0 * a.cos(), 10.0 * a.sin()]
                })
                .collect::<Vec<_>>()
        };
        ChannelPositions {
            ft0: ring(FT0_CHANNELS),
            fv0: ring(FV0_CHANNELS),
        }
    }

    #[test]
    fn offsets_follow_channel_side() {
        let mut positions = ring_positions();
        positions.ft0[5] = [0.0, 1.0];
        positions.ft0[101] = [0.0, 1.0];
        let offsets = AlignmentOffsets {
            ft0_a: [1.0, 0.0],
            ft0_c: [-1.0, 0.0],
            ..Default::default()
        };
        let angles = ChannelAngles::new(&positions, &offsets);
        let a = angles.phi(Detector::Ft0, 5).unwrap();
        let c = angles.phi(Detector::Ft0, 101).unwrap();
        assert!((a - 1.0f64.atan2(1.0)).abs() < 1e-12);
        assert!((c - 1.0f64.atan2(-1.0)).abs() < 1e-12);
        assert!(angles.phi(Detector::Ft0, FT0_CHANNELS as u32).is_none());
    }

    #[test]
    fn fv0_halves_use_their_own_offset() {
        let mut positions = ring_positions();
        positions.fv0[0] = [0.0, 2.0];
        positions.fv0[4] = [0.0, 2.0];
        let offsets = AlignmentOffsets {
            fv0_left: [0.0, 0.0],
            fv0_right: [2.0, -2.0],
            ..Default::default()
        };
        let angles = ChannelAngles::new(&positions, &offsets);
        assert!((angles.phi(Detector::Fv0, 0).unwrap() - FRAC_PI_2).abs() < 1e-12);
        assert!(angles.phi(Detector::Fv0, 4).unwrap().abs() < 1e-12);
    }

    #[test]
    fn validate_rejects_short_tables() {
        let mut positions = ring_positions();
        positions.fv0.pop();
        assert!(positions.validate().is_err());
    }

    #[test]
    fn alignment_needs_two_records_per_detector() {
        let p = AlignParam { x: 0.1, y: 0.2, z: 0.0 };
        assert!(AlignmentOffsets::from_params(&[p], &[p, p]).is_none());
        let offsets = AlignmentOffsets::from_params(&[p, p], &[p, p]).unwrap();
        assert_eq!(offsets.ft0_c, [0.1, 0.2]);
    }
}
