//! Event orchestration: run refresh, centrality, per-harmonic Q-vectors,
//! calibration and QA.

use tracing::{debug, info};

use crate::calib::StagedQVector;
use crate::error::{QvecError, Result};
use crate::event::{Centralities, EventRecord};
use crate::geom::{ChannelPositions, Detector};
use crate::hist::Axis;
use crate::qa::{QaHistograms, DEFAULT_AMPLITUDE_AXIS};
use crate::qvec::{
    accumulate_ft0, accumulate_fv0, accumulate_tracks, resolve_ft0, resolve_hits,
    ChannelWarnings, EtaSide, Ft0Hits, Hit, PerSubPopulation, QStatus, SubPopulation,
    SubPopulationSet, TrackSelection, TrackSplit,
};
use crate::run_cache::{RunCache, StorePaths, REFERENCE_HARMONIC};
use crate::store::ObjectStore;
use crate::tables::{centrality_bin, CalibrationTable};

/// Centrality reported for events outside the calibrated range.
pub const UNCALIBRATED_CENTRALITY: f32 = 110.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CentralityEstimator {
    Ft0M,
    Ft0A,
    #[default]
    Ft0C,
    Fv0A,
}

impl CentralityEstimator {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(CentralityEstimator::Ft0M),
            1 => Some(CentralityEstimator::Ft0A),
            2 => Some(CentralityEstimator::Ft0C),
            3 => Some(CentralityEstimator::Fv0A),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CentralityEstimator::Ft0M => "FT0M",
            CentralityEstimator::Ft0A => "FT0A",
            CentralityEstimator::Ft0C => "FT0C",
            CentralityEstimator::Fv0A => "FV0A",
        }
    }

    pub fn select(self, centralities: &Centralities) -> f32 {
        centralities.0[self.index()]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskConfig {
    pub centrality_estimator: CentralityEstimator,
    pub track_selection: TrackSelection,
    pub harmonics: Vec<u32>,
    pub enabled: SubPopulationSet,
    pub paths: StorePaths,
    pub amplitude_axis: Axis,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            centrality_estimator: CentralityEstimator::default(),
            track_selection: TrackSelection::default(),
            harmonics: vec![2, 3],
            enabled: SubPopulationSet::all(),
            paths: StorePaths::default(),
            amplitude_axis: DEFAULT_AMPLITUDE_AXIS,
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.harmonics.is_empty() {
            return Err(QvecError::config("at least one harmonic is required"));
        }
        if let Some(bad) = self.harmonics.iter().find(|&&n| n == 0) {
            return Err(QvecError::config(format!("harmonic order must be >= 1, got {bad}")));
        }
        let sel = &self.track_selection;
        if !(sel.min_pt.is_finite() && sel.max_pt.is_finite()) || sel.min_pt > sel.max_pt {
            return Err(QvecError::config(format!(
                "invalid pt window [{}, {}]",
                sel.min_pt, sel.max_pt
            )));
        }
        if self.enabled.is_empty() {
            return Err(QvecError::config("no sub-population requested"));
        }
        Ok(())
    }
}

/// One harmonic's Q-vectors at all stages.
#[derive(Clone, Debug, PartialEq)]
pub struct HarmonicQVectors {
    pub harmonic: u32,
    /// Corrections were applied (centrality in range and a table available).
    pub calibrated: bool,
    pub vectors: PerSubPopulation<StagedQVector>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventOutput {
    pub run: i32,
    /// Selected centrality, or 110 when outside the calibrated range.
    pub centrality: f32,
    pub centrality_in_range: bool,
    /// One block per configured harmonic, in configured order.
    pub harmonics: Vec<HarmonicQVectors>,
    /// Harmonic-2 block for the legacy single-harmonic outputs.
    pub reference: HarmonicQVectors,
    pub positive_ids: Vec<i64>,
    pub negative_ids: Vec<i64>,
}

impl EventOutput {
    /// Summed corrected amplitude, or track count for the track sub-populations.
    pub fn weight(&self, sub: SubPopulation) -> f64 {
        self.reference.vectors[sub].weight
    }

    pub fn is_calibrated(&self) -> bool {
        self.reference.calibrated
    }

    pub fn all_harmonics_calibrated(&self) -> bool {
        self.harmonics.iter().all(|h| h.calibrated)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskStats {
    pub events: u64,
    pub calibrated_events: u64,
    /// Reference-pass sub-populations that were requested but empty.
    pub empty: PerSubPopulation<u64>,
    pub degenerate_corrections: u64,
}

impl Default for TaskStats {
    fn default() -> Self {
        Self {
            events: 0,
            calibrated_events: 0,
            empty: PerSubPopulation([0; SubPopulation::COUNT]),
            degenerate_corrections: 0,
        }
    }
}

/// Selected centrality and whether it falls in the calibrated range.
pub fn event_centrality(estimator: CentralityEstimator, centralities: &Centralities) -> (f32, bool) {
    let cent = estimator.select(centralities);
    match centrality_bin(cent) {
        Some(_) => (cent, true),
        None => (UNCALIBRATED_CENTRALITY, false),
    }
}

pub struct QvecTask {
    config: TaskConfig,
    cache: RunCache,
    warnings: ChannelWarnings,
    qa: QaHistograms,
    stats: TaskStats,
}

impl QvecTask {
    pub fn new(config: TaskConfig, positions: ChannelPositions) -> Result<Self> {
        config.validate()?;
        positions.validate()?;
        let cache = RunCache::new(positions, config.paths.clone(), &config.harmonics);
        let qa = QaHistograms::new(config.amplitude_axis)?;
        info!(
            "[task] harmonics {:?}, centrality estimator {}, pt [{}, {}]",
            config.harmonics,
            config.centrality_estimator.name(),
            config.track_selection.min_pt,
            config.track_selection.max_pt
        );
        Ok(Self {
            config,
            cache,
            warnings: ChannelWarnings::default(),
            qa,
            stats: TaskStats::default(),
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn refresh_count(&self) -> usize {
        self.cache.refresh_count()
    }

    pub fn qa(&self) -> &QaHistograms {
        &self.qa
    }

    pub fn process(&mut self, store: &dyn ObjectStore, event: &EventRecord) -> Result<EventOutput> {
        if self.cache.current_run() != Some(event.run_number) {
            self.warnings.clear();
        }
        let cal = self
            .cache
            .current_for(store, event.run_number, event.timestamp)?;
        let enabled = self.config.enabled;

        let (centrality, in_range) =
            event_centrality(self.config.centrality_estimator, &event.centralities);
        let bin = centrality_bin(centrality);

        let wants_ft0 = [SubPopulation::Ft0A, SubPopulation::Ft0C, SubPopulation::Ft0M]
            .into_iter()
            .any(|s| enabled.contains(s));
        let ft0_hits: Option<Ft0Hits> = match &event.ft0 {
            Some(signals) if wants_ft0 => Some(resolve_ft0(
                signals,
                &cal.angles,
                cal.gains(Detector::Ft0),
                &mut self.warnings,
            )),
            _ => None,
        };
        let fv0_hits: Option<Vec<Hit>> = match &event.fv0 {
            Some(signals) if enabled.contains(SubPopulation::Fv0A) => Some(resolve_hits(
                Detector::Fv0,
                signals,
                0,
                &cal.angles,
                cal.gains(Detector::Fv0),
                &mut self.warnings,
            )),
            _ => None,
        };
        let split = TrackSplit::new(&event.tracks, &self.config.track_selection);

        let sources = Sources {
            ft0: ft0_hits.as_ref(),
            fv0: fv0_hits.as_deref(),
            tracks: &split,
            enabled: &enabled,
            bin,
        };
        let harmonics: Vec<HarmonicQVectors> = self
            .config
            .harmonics
            .iter()
            .map(|&n| sources.pass(n, cal.table(n)))
            .collect();
        let reference = sources.pass(REFERENCE_HARMONIC, cal.reference_table());

        if let Some(hits) = &ft0_hits {
            self.qa.fill_ft0(hits)?;
        }
        if let Some(hits) = &fv0_hits {
            self.qa.fill_fv0(hits)?;
        }
        self.qa.fill_tracks(&split.selected, centrality)?;

        self.stats.events += 1;
        if reference.calibrated {
            self.stats.calibrated_events += 1;
        }
        for (sub, staged) in reference.vectors.iter() {
            if staged.status == QStatus::Empty {
                self.stats.empty[sub] += 1;
            }
        }
        self.stats.degenerate_corrections += harmonics
            .iter()
            .chain(std::iter::once(&reference))
            .flat_map(|h| h.vectors.0.iter())
            .map(|s| u64::from(s.degenerate))
            .sum::<u64>();

        debug!(
            "[task] run {} cent {:.2} calibrated {} ntrk +{} -{}",
            event.run_number,
            centrality,
            reference.calibrated,
            split.positive.len(),
            split.negative.len()
        );

        Ok(EventOutput {
            run: event.run_number,
            centrality,
            centrality_in_range: in_range,
            harmonics,
            reference,
            positive_ids: split.ids(EtaSide::Positive, &enabled),
            negative_ids: split.ids(EtaSide::Negative, &enabled),
        })
    }

    pub fn log_summary(&self) {
        let s = &self.stats;
        info!(
            "[task] {} events, {} calibrated, {} run refresh(es), {} degenerate correction(s)",
            s.events,
            s.calibrated_events,
            self.cache.refresh_count(),
            s.degenerate_corrections
        );
        for (sub, n) in s.empty.iter() {
            if *n > 0 {
                info!("[task] {} empty in {} event(s)", sub.name(), n);
            }
        }
    }
}

/// Per-event inputs shared by every harmonic pass.
struct Sources<'a> {
    ft0: Option<&'a Ft0Hits>,
    fv0: Option<&'a [Hit]>,
    tracks: &'a TrackSplit<'a>,
    enabled: &'a SubPopulationSet,
    bin: Option<usize>,
}

impl Sources<'_> {
    fn pass(&self, harmonic: u32, table: Option<&CalibrationTable>) -> HarmonicQVectors {
        let (ft0_a, ft0_c, ft0_m) = accumulate_ft0(harmonic, self.ft0, self.enabled);
        let fv0_a = accumulate_fv0(harmonic, self.fv0, self.enabled);
        let (b_pos, b_neg) = accumulate_tracks(harmonic, self.tracks, self.enabled);
        let raw = PerSubPopulation([ft0_c, ft0_a, ft0_m, fv0_a, b_pos, b_neg]);

        let lookup = table.zip(self.bin);
        let params = PerSubPopulation::from_fn(|sub| lookup.and_then(|(t, bin)| t.params(bin, sub)));
        let calibrated = params.iter().all(|(_, p)| p.is_some());
        let vectors = PerSubPopulation::from_fn(|sub| match &params[sub] {
            Some(p) if calibrated => StagedQVector::calibrate(&raw[sub], p),
            _ => StagedQVector::uncalibrated(&raw[sub]),
        });
        HarmonicQVectors {
            harmonic,
            calibrated,
            vectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::Stage;
    use crate::event::{ChannelAmplitude, Ft0Signals, Track, TrackQuality};
    use crate::qvec::QVector;
    use crate::run_cache::tests::{aligned_store, calib_hist, ring_positions};
    use crate::hist::{Axis, Histogram};
    use crate::store::CalibObject;
    use approx::assert_abs_diff_eq;

    fn event(run: i32, cent: f32) -> EventRecord {
        EventRecord {
            run_number: run,
            timestamp: 0,
            centralities: Centralities([cent; 4]),
            ft0: None,
            fv0: None,
            tracks: Vec::new(),
            multiplicity: None,
            pos_z: None,
        }
    }

    fn two_channel_event(cent: f32) -> EventRecord {
        let mut ev = event(1, cent);
        ev.ft0 = Some(Ft0Signals {
            a: vec![ChannelAmplitude { channel: 5, amplitude: 100.0 }],
            c: vec![ChannelAmplitude { channel: 5, amplitude: 50.0 }],
        });
        ev
    }

    #[test]
    fn centrality_boundaries() {
        let est = CentralityEstimator::Ft0C;
        assert_eq!(event_centrality(est, &Centralities([0.0; 4])), (0.0, true));
        assert_eq!(event_centrality(est, &Centralities([79.999; 4])), (79.999, true));
        assert_eq!(event_centrality(est, &Centralities([80.0; 4])), (110.0, false));
        assert_eq!(event_centrality(est, &Centralities([95.0; 4])), (110.0, false));
        assert_eq!(event_centrality(est, &Centralities([-1.0; 4])), (110.0, false));
        let cents = Centralities([1.0, 2.0, 3.0, 4.0]);
        assert_eq!(event_centrality(CentralityEstimator::Fv0A, &cents).0, 4.0);
        assert_eq!(event_centrality(CentralityEstimator::Ft0M, &cents).0, 1.0);
    }

    #[test]
    fn config_validation() {
        assert!(TaskConfig::default().validate().is_ok());
        let mut cfg = TaskConfig::default();
        cfg.harmonics.clear();
        assert!(cfg.validate().is_err());
        let mut cfg = TaskConfig::default();
        cfg.harmonics = vec![2, 0];
        assert!(cfg.validate().is_err());
        let mut cfg = TaskConfig::default();
        cfg.track_selection.min_pt = 6.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn two_channel_end_to_end_with_identity_table() {
        let mut store = aligned_store();
        let paths = StorePaths::default();
        store.insert_always(&paths.calib_key(2), CalibObject::Histogram(calib_hist(0.0)));
        let positions = ring_positions();
        let mut config = TaskConfig::default();
        config.harmonics = vec![2];
        let mut task = QvecTask::new(config, positions.clone()).unwrap();

        let out = task.process(&store, &two_channel_event(40.0)).unwrap();
        assert!(out.centrality_in_range);
        assert_eq!(out.centrality, 40.0);

        let phi = |p: [f64; 2]| p[1].atan2(p[0]);
        let (pa, pc) = (phi(positions.ft0[5]), phi(positions.ft0[101]));
        let re = (100.0 * (2.0 * pa).cos() + 50.0 * (2.0 * pc).cos()) / 150.0;
        let im = (100.0 * (2.0 * pa).sin() + 50.0 * (2.0 * pc).sin()) / 150.0;

        // Zero widths in an all-zero table disable only the rescale step.
        let m = out.reference.vectors[SubPopulation::Ft0M];
        assert_abs_diff_eq!(m.stage(Stage::Uncorrected).re, re, epsilon = 1e-12);
        assert_abs_diff_eq!(m.stage(Stage::Uncorrected).im, im, epsilon = 1e-12);
        assert_eq!(m.final_value(), m.stage(Stage::Uncorrected));
        assert_eq!(m.weight, 150.0);
        let a = out.reference.vectors[SubPopulation::Ft0A];
        assert_abs_diff_eq!(a.final_value().re, (2.0 * pa).cos(), epsilon = 1e-12);
        let c = out.reference.vectors[SubPopulation::Ft0C];
        assert_abs_diff_eq!(c.final_value().im, (2.0 * pc).sin(), epsilon = 1e-12);

        assert_eq!(out.reference.vectors[SubPopulation::Fv0A].final_value(), QVector::ABSENT);
        assert_eq!(out.reference.vectors[SubPopulation::BPos].final_value(), QVector::EMPTY);
        assert_eq!(out.harmonics[0], out.reference);
        assert_eq!(task.qa().ft0_amp.entries(), 2);
    }

    #[test]
    fn out_of_range_centrality_skips_corrections() {
        let mut store = aligned_store();
        let paths = StorePaths::default();
        store.insert_always(&paths.calib_key(2), CalibObject::Histogram(calib_hist(0.3)));
        let mut task = QvecTask::new(TaskConfig::default(), ring_positions()).unwrap();

        let out = task.process(&store, &two_channel_event(85.0)).unwrap();
        assert_eq!(out.centrality, UNCALIBRATED_CENTRALITY);
        assert!(!out.is_calibrated());
        let m = out.reference.vectors[SubPopulation::Ft0M];
        assert_eq!(m.final_value(), m.stage(Stage::Uncorrected));

        let out = task.process(&store, &two_channel_event(10.0)).unwrap();
        assert!(out.is_calibrated());
        assert!(out.all_harmonics_calibrated());
        let m = out.reference.vectors[SubPopulation::Ft0M];
        assert_abs_diff_eq!(
            m.stage(Stage::Recentered).re,
            m.stage(Stage::Uncorrected).re - 0.3,
            epsilon = 1e-12
        );
        assert_eq!(task.stats().events, 2);
        assert_eq!(task.stats().calibrated_events, 1);
    }

    #[test]
    fn coarse_centrality_table_is_refused() {
        let mut store = aligned_store();
        let paths = StorePaths::default();
        let axes = vec![Axis::new(20, 0.0, 100.0), Axis::new(6, 0.0, 6.0), Axis::new(6, 0.0, 6.0)];
        let coarse = Histogram::from_contents(axes, vec![0.3; 20 * 36]).unwrap();
        store.insert_always(&paths.calib_key(2), CalibObject::Histogram(coarse));
        let mut task = QvecTask::new(TaskConfig::default(), ring_positions()).unwrap();
        let err = task.process(&store, &two_channel_event(50.0)).unwrap_err();
        assert!(matches!(err, QvecError::BadCalibration { .. }));
    }

    #[test]
    fn one_refresh_per_run() {
        let store = aligned_store();
        let mut task = QvecTask::new(TaskConfig::default(), ring_positions()).unwrap();
        for _ in 0..4 {
            task.process(&store, &event(10, 20.0)).unwrap();
        }
        assert_eq!(task.refresh_count(), 1);
        task.process(&store, &event(11, 20.0)).unwrap();
        task.process(&store, &event(11, 20.0)).unwrap();
        assert_eq!(task.refresh_count(), 2);
    }

    #[test]
    fn disabled_sub_populations_report_absent_and_no_ids() {
        let store = aligned_store();
        let mut config = TaskConfig::default();
        config.enabled = SubPopulationSet::none()
            .with(SubPopulation::Ft0C)
            .with(SubPopulation::BNeg);
        let mut task = QvecTask::new(config, ring_positions()).unwrap();
        let mut ev = two_channel_event(30.0);
        ev.tracks = vec![
            Track { global_id: 1, pt: 1.0, eta: 0.5, phi: 0.2, quality: TrackQuality::default() },
            Track { global_id: 2, pt: 1.0, eta: -0.5, phi: 0.4, quality: TrackQuality::default() },
        ];
        let out = task.process(&store, &ev).unwrap();
        let v = &out.reference.vectors;
        assert_eq!(v[SubPopulation::Ft0A].final_value(), QVector::ABSENT);
        assert_eq!(v[SubPopulation::Ft0M].final_value(), QVector::ABSENT);
        assert_eq!(v[SubPopulation::BPos].final_value(), QVector::ABSENT);
        assert_eq!(v[SubPopulation::Ft0C].status, QStatus::Computed);
        assert_eq!(v[SubPopulation::BNeg].weight, 1.0);
        assert!(out.positive_ids.is_empty());
        assert_eq!(out.negative_ids, vec![2]);
        assert!(!out.is_calibrated());
    }
}
