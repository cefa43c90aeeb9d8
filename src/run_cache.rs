//! Per-run calibration snapshot, refreshed only when the run number changes.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{QvecError, Result};
use crate::geom::{AlignmentOffsets, ChannelAngles, ChannelPositions, Detector};
use crate::store::{AlignParam, ObjectStore};
use crate::tables::{CalibrationTable, GainTable};

pub const FT0_ALIGN_KEY: &str = "FT0/Calib/Align";
pub const FV0_ALIGN_KEY: &str = "FV0/Calib/Align";
pub const DEFAULT_CALIB_PATH: &str = "Analysis/EventPlane/QVecCorrections";
pub const DEFAULT_GAIN_PATH: &str = "Users/j/junlee/Qvector/GainEq";
/// Harmonic of the legacy single-harmonic output and of the table fallback.
pub const REFERENCE_HARMONIC: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePaths {
    pub calib_path: String,
    pub gain_path: String,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            calib_path: DEFAULT_CALIB_PATH.to_string(),
            gain_path: DEFAULT_GAIN_PATH.to_string(),
        }
    }
}

impl StorePaths {
    pub fn calib_key(&self, harmonic: u32) -> String {
        format!("{}/v{}", self.calib_path.trim_end_matches('/'), harmonic)
    }

    pub fn gain_key(&self, detector: Detector) -> String {
        format!("{}/{}", self.gain_path.trim_end_matches('/'), detector.name())
    }
}

/// Read-only state shared by every event of one run.
#[derive(Debug)]
pub struct RunCalibration {
    pub run: i32,
    pub angles: ChannelAngles,
    pub ft0_gains: GainTable,
    pub fv0_gains: GainTable,
    tables: BTreeMap<u32, Option<CalibrationTable>>,
}

impl RunCalibration {
    pub fn gains(&self, detector: Detector) -> &GainTable {
        match detector {
            Detector::Ft0 => &self.ft0_gains,
            Detector::Fv0 => &self.fv0_gains,
        }
    }

    /// Calibration table for `harmonic`, `None` when that harmonic runs uncalibrated.
    pub fn table(&self, harmonic: u32) -> Option<&CalibrationTable> {
        self.tables.get(&harmonic).and_then(Option::as_ref)
    }

    pub fn reference_table(&self) -> Option<&CalibrationTable> {
        self.table(REFERENCE_HARMONIC)
    }
}

pub struct RunCache {
    positions: ChannelPositions,
    paths: StorePaths,
    harmonics: Vec<u32>,
    current: Option<RunCalibration>,
    refreshes: usize,
}

impl RunCache {
    pub fn new(positions: ChannelPositions, paths: StorePaths, harmonics: &[u32]) -> Self {
        Self {
            positions,
            paths,
            harmonics: harmonics.to_vec(),
            current: None,
            refreshes: 0,
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes
    }

    pub fn current_run(&self) -> Option<i32> {
        self.current.as_ref().map(|c| c.run)
    }

    /// Snapshot for `run`, loading it from `store` when the run differs from
    /// the cached one. A failed load leaves the cache empty.
    pub fn current_for(
        &mut self,
        store: &dyn ObjectStore,
        run: i32,
        timestamp: i64,
    ) -> Result<&RunCalibration> {
        match self.current.take() {
            Some(cal) if cal.run == run => Ok(&*self.current.insert(cal)),
            _ => {
                let fresh = self.load(store, run, timestamp)?;
                self.refreshes += 1;
                Ok(&*self.current.insert(fresh))
            }
        }
    }

    fn load(&self, store: &dyn ObjectStore, run: i32, timestamp: i64) -> Result<RunCalibration> {
        info!("[run] loading calibration for run {} (timestamp {})", run, timestamp);

        let ft0_align = fetch_alignment(store, FT0_ALIGN_KEY, Detector::Ft0, run, timestamp)?;
        let fv0_align = fetch_alignment(store, FV0_ALIGN_KEY, Detector::Fv0, run, timestamp)?;
        let offsets = AlignmentOffsets::from_params(&ft0_align, &fv0_align).ok_or_else(|| {
            QvecError::Geometry(format!(
                "alignment for run {run} needs two records per detector (FT0: {}, FV0: {})",
                ft0_align.len(),
                fv0_align.len()
            ))
        })?;
        debug!("[run] offsets {:?}", offsets);
        let angles = ChannelAngles::new(&self.positions, &offsets);

        let ft0_gains = self.fetch_gains(store, Detector::Ft0, timestamp)?;
        let fv0_gains = self.fetch_gains(store, Detector::Fv0, timestamp)?;

        let mut tables = BTreeMap::new();
        for &harmonic in self.harmonics.iter().chain(std::iter::once(&REFERENCE_HARMONIC)) {
            if tables.contains_key(&harmonic) {
                continue;
            }
            let table = self.fetch_table(store, harmonic, timestamp)?;
            tables.insert(harmonic, table);
        }

        Ok(RunCalibration {
            run,
            angles,
            ft0_gains,
            fv0_gains,
            tables,
        })
    }

    fn fetch_gains(
        &self,
        store: &dyn ObjectStore,
        detector: Detector,
        timestamp: i64,
    ) -> Result<GainTable> {
        let key = self.paths.gain_key(detector);
        match store.fetch(&key, timestamp)? {
            None => {
                debug!("[run] no gain object at {}, using unity gains", key);
                Ok(GainTable::unity(detector.channel_count()))
            }
            Some(obj) => {
                let gains = obj.into_float_vector().ok_or_else(|| QvecError::BadCalibration {
                    key: key.clone(),
                    reason: "expected a float vector".into(),
                })?;
                if gains.len() < detector.channel_count() {
                    warn!(
                        "[run] {} holds {} gains for {} channels; missing channels are skipped",
                        key,
                        gains.len(),
                        detector.channel_count()
                    );
                }
                Ok(GainTable::from_values(gains))
            }
        }
    }

    /// `<calib>/v<n>`, then `<calib>/v2`, then uncalibrated.
    fn fetch_table(
        &self,
        store: &dyn ObjectStore,
        harmonic: u32,
        timestamp: i64,
    ) -> Result<Option<CalibrationTable>> {
        let mut keys = vec![self.paths.calib_key(harmonic)];
        if harmonic != REFERENCE_HARMONIC {
            keys.push(self.paths.calib_key(REFERENCE_HARMONIC));
        }
        for key in keys {
            if let Some(obj) = store.fetch(&key, timestamp)? {
                let hist = obj.into_histogram().ok_or_else(|| QvecError::BadCalibration {
                    key: key.clone(),
                    reason: "expected a histogram".into(),
                })?;
                debug!("[run] harmonic {} uses {}", harmonic, key);
                return CalibrationTable::from_histogram(&key, hist).map(Some);
            }
        }
        warn!(
            "[run] no calibration table for harmonic {}; its Q-vectors stay uncalibrated",
            harmonic
        );
        Ok(None)
    }
}

fn fetch_alignment(
    store: &dyn ObjectStore,
    key: &str,
    detector: Detector,
    run: i32,
    timestamp: i64,
) -> Result<Vec<AlignParam>> {
    let obj = store
        .fetch(key, timestamp)?
        .ok_or(QvecError::MissingAlignment {
            detector: detector.name(),
            run,
        })?;
    obj.into_align_params().ok_or_else(|| QvecError::BadCalibration {
        key: key.to_string(),
        reason: "expected alignment parameters".into(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geom::{FT0_CHANNELS, FV0_CHANNELS};
    use crate::hist::{Axis, Histogram};
    use crate::store::{CalibObject, MemoryStore, ObjectEntry};

    pub(crate) fn ring_positions() -> ChannelPositions {
        let ring = |n: usize| {
            (0..n)
                .map(|i| {
                    let a = 2.0 * std::f64::consts::PI * (i as f64 + 0.5) / n as f64;
                    [5.0 * a.cos(), 5.0 * a.sin()]
                })
                .collect()
        };
        ChannelPositions {
            ft0: ring(FT0_CHANNELS),
            fv0: ring(FV0_CHANNELS),
        }
    }

    pub(crate) fn calib_hist(fill: f64) -> Histogram {
        let axes = vec![
            Axis::new(80, 0.0, 80.0),
            Axis::new(6, 0.0, 6.0),
            Axis::new(6, 0.0, 6.0),
        ];
        Histogram::from_contents(axes, vec![fill; 80 * 36]).unwrap()
    }

    pub(crate) fn aligned_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        let zero = AlignParam::default();
        store.insert_always(FT0_ALIGN_KEY, CalibObject::AlignParams(vec![zero, zero]));
        store.insert_always(FV0_ALIGN_KEY, CalibObject::AlignParams(vec![zero, zero]));
        store
    }

    #[test]
    fn refresh_only_on_run_change() {
        let store = aligned_store();
        let mut cache = RunCache::new(ring_positions(), StorePaths::default(), &[2, 3]);
        for _ in 0..5 {
            cache.current_for(&store, 100, 0).unwrap();
        }
        assert_eq!(cache.refresh_count(), 1);
        let fetches = store.fetch_count();
        cache.current_for(&store, 101, 0).unwrap();
        cache.current_for(&store, 101, 0).unwrap();
        assert_eq!(cache.refresh_count(), 2);
        assert_eq!(store.fetch_count(), 2 * fetches);
        assert_eq!(cache.current_run(), Some(101));
    }

    #[test]
    fn missing_alignment_is_fatal() {
        let store = MemoryStore::new();
        let mut cache = RunCache::new(ring_positions(), StorePaths::default(), &[2]);
        let err = cache.current_for(&store, 7, 0).unwrap_err();
        assert!(matches!(err, QvecError::MissingAlignment { detector: "FT0", run: 7 }));
        assert_eq!(cache.refresh_count(), 0);
    }

    #[test]
    fn alignment_of_the_wrong_kind_is_rejected() {
        let mut store = MemoryStore::new();
        let zero = AlignParam::default();
        store.insert_always(FT0_ALIGN_KEY, CalibObject::AlignParams(vec![zero, zero]));
        store.insert_always(FV0_ALIGN_KEY, CalibObject::FloatVector(vec![0.0; 2]));
        let mut cache = RunCache::new(ring_positions(), StorePaths::default(), &[2]);
        let err = cache.current_for(&store, 7, 0).unwrap_err();
        assert!(matches!(err, QvecError::BadCalibration { ref key, .. } if key == FV0_ALIGN_KEY));
    }

    #[test]
    fn gains_default_to_unity_and_tables_fall_back_to_v2() {
        let mut store = aligned_store();
        let paths = StorePaths::default();
        store.insert_always(
            &paths.calib_key(2),
            CalibObject::Histogram(calib_hist(0.5)),
        );
        store.insert_always(
            &paths.gain_key(Detector::Fv0),
            CalibObject::FloatVector(vec![2.0; FV0_CHANNELS]),
        );
        let mut cache = RunCache::new(ring_positions(), paths, &[3, 4]);
        let cal = cache.current_for(&store, 1, 0).unwrap();
        assert!(cal.gains(Detector::Ft0).is_unity());
        assert_eq!(cal.gains(Detector::Ft0).len(), FT0_CHANNELS);
        assert_eq!(cal.gains(Detector::Fv0).correct(0, 4.0), Some(2.0));
        assert!(cal.table(3).is_some());
        assert!(cal.table(4).is_some());
        assert!(cal.reference_table().is_some());
    }

    #[test]
    fn no_tables_means_uncalibrated() {
        let store = aligned_store();
        let mut cache = RunCache::new(ring_positions(), StorePaths::default(), &[3]);
        let cal = cache.current_for(&store, 1, 0).unwrap();
        assert!(cal.table(3).is_none());
        assert!(cal.reference_table().is_none());
    }

    #[test]
    fn tables_follow_validity_window() {
        let mut store = aligned_store();
        let paths = StorePaths::default();
        store.insert(
            &paths.calib_key(2),
            ObjectEntry {
                valid_from: 1_000,
                valid_until: 2_000,
                created: 0,
                run: None,
                object: CalibObject::Histogram(calib_hist(0.1)),
            },
        );
        let mut cache = RunCache::new(ring_positions(), paths, &[2]);
        assert!(cache.current_for(&store, 1, 500).unwrap().table(2).is_none());
        assert!(cache.current_for(&store, 2, 1_500).unwrap().table(2).is_some());
    }
}
