//! QA monitors filled once per event.

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::event::Track;
use crate::hist::{Axis, Histogram};
use crate::plot::{self, Spectrum, BLUE, RED};
use crate::qvec::{Ft0Hits, Hit};

pub const DEFAULT_AMPLITUDE_AXIS: Axis = Axis::new(1000, 0.0, 5000.0);
const CHANNEL_AXIS: Axis = Axis::new(220, 0.0, 220.0);
const PT_AXIS: Axis = Axis::new(40, 0.0, 4.0);
const ETA_AXIS: Axis = Axis::new(32, -0.8, 0.8);
const PHI_AXIS: Axis = Axis::new(32, 0.0, TAU);
const CENT_AXIS: Axis = Axis::new(20, 0.0, 100.0);

pub const QA_JSON: &str = "qa_histograms.json";

#[derive(Debug, Clone, PartialEq)]
pub struct QaHistograms {
    pub ch_tracks: Histogram,
    pub ft0_amp: Histogram,
    pub ft0_amp_cor: Histogram,
    pub fv0_amp: Histogram,
    pub fv0_amp_cor: Histogram,
}

#[derive(Serialize)]
struct QaDump<'a> {
    histograms: BTreeMap<&'static str, &'a Histogram>,
}

impl QaHistograms {
    pub fn new(amplitude_axis: Axis) -> Result<Self> {
        let amp = || Histogram::new(vec![amplitude_axis, CHANNEL_AXIS]);
        Ok(Self {
            ch_tracks: Histogram::new(vec![PT_AXIS, ETA_AXIS, PHI_AXIS, CENT_AXIS])?,
            ft0_amp: amp()?,
            ft0_amp_cor: amp()?,
            fv0_amp: amp()?,
            fv0_amp_cor: amp()?,
        })
    }

    pub fn named(&self) -> [(&'static str, &Histogram); 5] {
        [
            ("ChTracks", &self.ch_tracks),
            ("FT0Amp", &self.ft0_amp),
            ("FT0AmpCor", &self.ft0_amp_cor),
            ("FV0Amp", &self.fv0_amp),
            ("FV0AmpCor", &self.fv0_amp_cor),
        ]
    }

    pub fn fill_ft0(&mut self, hits: &Ft0Hits) -> Result<()> {
        for h in hits.a.iter().chain(hits.c.iter()) {
            fill_amplitude(&mut self.ft0_amp, &mut self.ft0_amp_cor, h)?;
        }
        Ok(())
    }

    pub fn fill_fv0(&mut self, hits: &[Hit]) -> Result<()> {
        for h in hits {
            fill_amplitude(&mut self.fv0_amp, &mut self.fv0_amp_cor, h)?;
        }
        Ok(())
    }

    /// Selected tracks, before the eta window is applied.
    pub fn fill_tracks(&mut self, tracks: &[&Track], centrality: f32) -> Result<()> {
        for t in tracks {
            self.ch_tracks
                .fill(&[t.pt, t.eta, t.phi, f64::from(centrality)])?;
        }
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let dump = QaDump {
            histograms: self.named().into_iter().collect(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &dump)?;
        info!("[qa] wrote {}", path.display());
        Ok(())
    }

    /// Amplitude spectra (raw vs gain-corrected) and the track pt spectrum.
    /// Empty monitors are skipped; plotting failures are logged, not fatal.
    pub fn plot(&self, dir: &Path) -> Vec<PathBuf> {
        let mut written = Vec::new();
        let spectra = [
            ("FT0", &self.ft0_amp, &self.ft0_amp_cor, "ft0_amplitude.png"),
            ("FV0", &self.fv0_amp, &self.fv0_amp_cor, "fv0_amplitude.png"),
        ];
        for (name, raw, cor, file) in spectra {
            if raw.entries() == 0 {
                continue;
            }
            let raw_proj = raw.projection(0);
            let cor_proj = cor.projection(0);
            let path = dir.join(file);
            let result = plot::plot_spectra(
                &raw.axes()[0],
                &[
                    Spectrum {
                        counts: &raw_proj,
                        color: &BLUE,
                        label: "raw",
                    },
                    Spectrum {
                        counts: &cor_proj,
                        color: &RED,
                        label: "gain corrected",
                    },
                ],
                &format!("{name} channel amplitude"),
                &path,
                "Amplitude",
                "Counts",
            );
            match result {
                Ok(()) => written.push(path),
                Err(e) => warn!("[qa] could not plot {}: {}", path.display(), e),
            }
        }

        if self.ch_tracks.entries() > 0 {
            let path = dir.join("track_pt.png");
            let counts = self.ch_tracks.projection(0);
            let axis = &self.ch_tracks.axes()[0];
            match plot::plot_spectrum(axis, &counts, "Selected tracks", &path, "pT (GeV/c)", "Counts", "tracks") {
                Ok(()) => written.push(path),
                Err(e) => warn!("[qa] could not plot {}: {}", path.display(), e),
            }
        }
        written
    }
}

fn fill_amplitude(raw: &mut Histogram, cor: &mut Histogram, hit: &Hit) -> Result<()> {
    let ch = f64::from(hit.channel);
    raw.fill(&[f64::from(hit.raw), ch])?;
    cor.fill(&[hit.corrected, ch])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TrackQuality;

    fn hit(channel: u32, raw: f32, corrected: f64) -> Hit {
        Hit {
            channel,
            phi: 0.0,
            raw,
            corrected,
        }
    }

    #[test]
    fn amplitude_monitors_use_combined_channel_ids() {
        let mut qa = QaHistograms::new(DEFAULT_AMPLITUDE_AXIS).unwrap();
        let hits = Ft0Hits {
            a: vec![hit(5, 100.0, 100.0)],
            c: vec![hit(101, 50.0, 25.0)],
        };
        qa.fill_ft0(&hits).unwrap();
        assert_eq!(qa.ft0_amp.entries(), 2);
        assert_eq!(qa.ft0_amp.content_at(&[100.0, 5.5]), Some(1.0));
        assert_eq!(qa.ft0_amp.content_at(&[50.0, 101.5]), Some(1.0));
        assert_eq!(qa.ft0_amp_cor.content_at(&[25.0, 101.5]), Some(1.0));
        assert_eq!(qa.fv0_amp.entries(), 0);
    }

    #[test]
    fn track_monitor_and_json_dump() {
        let mut qa = QaHistograms::new(Axis::new(10, 0.0, 100.0)).unwrap();
        let t = Track {
            global_id: 1,
            pt: 1.05,
            eta: 0.3,
            phi: 1.0,
            quality: TrackQuality::default(),
        };
        qa.fill_tracks(&[&t], 45.0).unwrap();
        assert_eq!(qa.ch_tracks.projection(0)[10], 1.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QA_JSON);
        qa.write_json(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let names: Vec<&str> = value["histograms"]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(names, vec!["ChTracks", "FT0Amp", "FT0AmpCor", "FV0Amp", "FV0AmpCor"]);
        let back: Histogram = serde_json::from_value(value["histograms"]["ChTracks"].clone()).unwrap();
        assert_eq!(back.entries(), 1);
    }

    #[test]
    fn plotting_skips_empty_monitors() {
        let qa = QaHistograms::new(DEFAULT_AMPLITUDE_AXIS).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(qa.plot(dir.path()).is_empty());
    }
}
