//! Per-collision input records, read as JSON lines.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QvecError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelAmplitude {
    pub channel: u32,
    pub amplitude: f32,
}

/// FT0 signals as delivered: A and C side in their own channel numbering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ft0Signals {
    #[serde(default)]
    pub a: Vec<ChannelAmplitude>,
    #[serde(default)]
    pub c: Vec<ChannelAmplitude>,
}

/// Precomputed track quality decisions; omitted flags count as passed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackQuality {
    pub its_ncls: bool,
    pub its_chi2_ndf: bool,
    pub its_hits: bool,
    pub tpc_crossed_rows_over_ncls: bool,
    pub tpc_chi2_ndf: bool,
    pub dca_xy: bool,
    pub dca_z: bool,
}

impl Default for TrackQuality {
    fn default() -> Self {
        Self {
            its_ncls: true,
            its_chi2_ndf: true,
            its_hits: true,
            tpc_crossed_rows_over_ncls: true,
            tpc_chi2_ndf: true,
            dca_xy: true,
            dca_z: true,
        }
    }
}

impl TrackQuality {
    pub fn all_passed(&self) -> bool {
        self.its_ncls
            && self.its_chi2_ndf
            && self.its_hits
            && self.tpc_crossed_rows_over_ncls
            && self.tpc_chi2_ndf
            && self.dca_xy
            && self.dca_z
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub global_id: i64,
    pub pt: f64,
    pub eta: f64,
    pub phi: f64,
    #[serde(default)]
    pub quality: TrackQuality,
}

/// Centrality estimates in the order FT0M, FT0A, FT0C, FV0A.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Centralities(pub [f32; 4]);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_number: i32,
    /// Block timestamp in ms since epoch.
    pub timestamp: i64,
    pub centralities: Centralities,
    #[serde(default)]
    pub ft0: Option<Ft0Signals>,
    #[serde(default)]
    pub fv0: Option<Vec<ChannelAmplitude>>,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub multiplicity: Option<f64>,
    #[serde(default)]
    pub pos_z: Option<f64>,
}

/// Iterator over a JSON-lines event file; blank lines and `#` comments are skipped.
pub struct EventReader {
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl EventReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

impl Iterator for EventReader {
    type Item = Result<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Some(serde_json::from_str(trimmed).map_err(|e| {
                QvecError::config(format!("event line {}: {}", self.line_no, e))
            }));
        }
    }
}
