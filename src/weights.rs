//! Per-track acceptance (NUA) and efficiency weights for correlation analyses.
//!
//! The weight map is a 5-D histogram over
//! (multiplicity, particle type, phi, eta, z vertex), looked up per track.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use crate::event::{EventRecord, Track};
use crate::hist::Histogram;
use crate::output::{Column, ColumnType};
use crate::store::{CalibObject, ObjectStore, StoreError};

pub const DEFAULT_WEIGHTS_KEY: &str = "Users/m/mavirta/corrections/NUA/LHC23zzh";
pub const WEIGHTS_TABLE: &str = "JWeights";
const LOCAL_PREFIX: &str = "local://";
const MAP_DIMENSIONS: usize = 5;
/// All charged hadrons.
const PARTICLE_TYPE: f64 = 0.0;
/// Events with more tracks than this are looked up in parallel.
const PARALLEL_THRESHOLD: usize = 512;

#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("no weight source in '{0}': expected \"ccdb\" or \"local://<file>\"")]
    NoSource(String),
    #[error("NUA correction weights file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("weight map {name} has {got} axes, expected {MAP_DIMENSIONS}")]
    Dimension { name: String, got: usize },
    #[error("object at {0} is not a histogram")]
    WrongKind(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WeightSource {
    Store { key: String, by_run: bool },
    LocalFile(PathBuf),
}

impl WeightSource {
    /// A source string containing `ccdb` selects the calibration store, `local://<file>`
    /// a JSON file of `NUAWeights_<run>` maps.
    pub fn parse(source: &str, key: &str, by_run: bool) -> Result<Self, WeightsError> {
        if source.contains("ccdb") {
            Ok(WeightSource::Store {
                key: key.to_string(),
                by_run,
            })
        } else if let Some(file) = source.strip_prefix(LOCAL_PREFIX) {
            Ok(WeightSource::LocalFile(PathBuf::from(file)))
        } else {
            Err(WeightsError::NoSource(source.to_string()))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackWeights {
    pub phi_weight: f32,
    pub eff_weight: f32,
}

impl TrackWeights {
    pub const UNIT: TrackWeights = TrackWeights {
        phi_weight: 1.0,
        eff_weight: 1.0,
    };
}

pub fn weight_columns() -> Vec<Column> {
    vec![
        Column::new("phiWeight", ColumnType::F32),
        Column::new("effWeight", ColumnType::F32),
    ]
}

fn local_map_name(run: i32) -> String {
    format!("NUAWeights_{run}")
}

fn check_dimensions(name: &str, hist: Histogram) -> Result<Histogram, WeightsError> {
    if hist.dimensions() != MAP_DIMENSIONS {
        return Err(WeightsError::Dimension {
            name: name.to_string(),
            got: hist.dimensions(),
        });
    }
    Ok(hist)
}

pub struct WeightsLoader {
    source: WeightSource,
    local: BTreeMap<String, Histogram>,
    run: Option<i32>,
    map: Option<Histogram>,
    loads: usize,
}

impl WeightsLoader {
    pub fn new(source: WeightSource) -> Result<Self, WeightsError> {
        let local = match &source {
            WeightSource::LocalFile(path) => {
                if !path.is_file() {
                    return Err(WeightsError::FileNotFound(path.clone()));
                }
                let text = fs::read_to_string(path).map_err(|source| WeightsError::Read {
                    path: path.clone(),
                    source,
                })?;
                let maps: BTreeMap<String, Histogram> =
                    serde_json::from_str(&text).map_err(|source| WeightsError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                info!("[weights] using corrections from {} ({} map(s))", path.display(), maps.len());
                maps
            }
            WeightSource::Store { key, .. } => {
                info!("[weights] using corrections from the calibration store at {}", key);
                BTreeMap::new()
            }
        };
        Ok(Self {
            source,
            local,
            run: None,
            map: None,
            loads: 0,
        })
    }

    pub fn load_count(&self) -> usize {
        self.loads
    }

    pub fn has_map(&self) -> bool {
        self.map.is_some()
    }

    fn ensure_run(
        &mut self,
        store: &dyn ObjectStore,
        run: i32,
        timestamp: i64,
    ) -> Result<(), WeightsError> {
        if self.run == Some(run) {
            return Ok(());
        }
        self.map = match &self.source {
            WeightSource::LocalFile(_) => {
                let name = local_map_name(run);
                match self.local.get(&name) {
                    Some(hist) => Some(check_dimensions(&name, hist.clone())?),
                    None => None,
                }
            }
            WeightSource::Store { key, by_run } => {
                let obj = if *by_run {
                    store.fetch_for_run(key, run)?
                } else {
                    store.fetch(key, timestamp)?
                };
                match obj {
                    Some(CalibObject::Histogram(hist)) => Some(check_dimensions(key, hist)?),
                    Some(_) => return Err(WeightsError::WrongKind(key.clone())),
                    None => None,
                }
            }
        };
        if self.map.is_some() {
            info!("[weights] loaded NUA correction histogram for run {}", run);
        } else {
            warn!("[weights] NUA correction histogram not found for run {}", run);
        }
        self.run = Some(run);
        self.loads += 1;
        Ok(())
    }

    /// Weights for every track of `event`, in track order.
    pub fn weights_for(
        &mut self,
        store: &dyn ObjectStore,
        event: &EventRecord,
    ) -> Result<Vec<TrackWeights>, WeightsError> {
        self.ensure_run(store, event.run_number, event.timestamp)?;
        let Some(map) = &self.map else {
            return Ok(vec![TrackWeights::UNIT; event.tracks.len()]);
        };
        let multiplicity = event.multiplicity.unwrap_or(f64::NAN);
        let pos_z = event.pos_z.unwrap_or(f64::NAN);
        let lookup = |t: &Track| TrackWeights {
            phi_weight: map
                .content_at(&[multiplicity, PARTICLE_TYPE, t.phi, t.eta, pos_z])
                .map_or(1.0, |w| w as f32),
            eff_weight: 1.0,
        };
        Ok(if event.tracks.len() > PARALLEL_THRESHOLD {
            event.tracks.par_iter().map(lookup).collect()
        } else {
            event.tracks.iter().map(lookup).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Centralities, TrackQuality};
    use crate::hist::Axis;
    use crate::store::{MemoryStore, ObjectEntry};

    fn nua_map(value: f64) -> Histogram {
        let axes = vec![
            Axis::new(1, 0.0, 1000.0),
            Axis::new(1, 0.0, 1.0),
            Axis::new(4, 0.0, std::f64::consts::TAU),
            Axis::new(2, -0.8, 0.8),
            Axis::new(1, -10.0, 10.0),
        ];
        let contents = (0..8).map(|i| value + i as f64).collect();
        Histogram::from_contents(axes, contents).unwrap()
    }

    fn event(run: i32, ntracks: usize) -> EventRecord {
        EventRecord {
            run_number: run,
            timestamp: 5,
            centralities: Centralities::default(),
            ft0: None,
            fv0: None,
            tracks: (0..ntracks)
                .map(|i| Track {
                    global_id: i as i64,
                    pt: 1.0,
                    eta: if i % 2 == 0 { 0.4 } else { -0.4 },
                    phi: 0.1,
                    quality: TrackQuality::default(),
                })
                .collect(),
            multiplicity: Some(50.0),
            pos_z: Some(1.0),
        }
    }

    #[test]
    fn parse_source_string() {
        assert_eq!(
            WeightSource::parse("http://alice-ccdb.cern.ch", "K", true).unwrap(),
            WeightSource::Store { key: "K".into(), by_run: true }
        );
        assert_eq!(
            WeightSource::parse("local:///tmp/nua.json", "K", false).unwrap(),
            WeightSource::LocalFile(PathBuf::from("/tmp/nua.json"))
        );
        assert!(matches!(
            WeightSource::parse("/tmp/nua.json", "K", false),
            Err(WeightsError::NoSource(_))
        ));
    }

    #[test]
    fn local_file_maps_are_selected_by_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nua.json");
        let mut maps = BTreeMap::new();
        maps.insert(local_map_name(10), nua_map(2.0));
        fs::write(&path, serde_json::to_string(&maps).unwrap()).unwrap();

        let mut loader = WeightsLoader::new(WeightSource::LocalFile(path)).unwrap();
        let store = MemoryStore::new();
        let w = loader.weights_for(&store, &event(10, 2)).unwrap();
        // phi bin 0; eta 0.4 -> bin 1, eta -0.4 -> bin 0
        assert_eq!(w[0].phi_weight, 3.0);
        assert_eq!(w[1].phi_weight, 2.0);
        assert_eq!(w[0].eff_weight, 1.0);
        loader.weights_for(&store, &event(10, 1)).unwrap();
        assert_eq!(loader.load_count(), 1);

        let w = loader.weights_for(&store, &event(11, 3)).unwrap();
        assert_eq!(w, vec![TrackWeights::UNIT; 3]);
        assert!(!loader.has_map());
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn missing_local_file_fails_at_construction() {
        let err = WeightsLoader::new(WeightSource::LocalFile("/nonexistent/nua.json".into()));
        assert!(matches!(err, Err(WeightsError::FileNotFound(_))));
    }

    #[test]
    fn store_lookup_by_run_and_out_of_range_tracks() {
        let mut store = MemoryStore::new();
        store.insert(
            DEFAULT_WEIGHTS_KEY,
            ObjectEntry {
                valid_from: 0,
                valid_until: 1,
                created: 0,
                run: Some(20),
                object: CalibObject::Histogram(nua_map(4.0)),
            },
        );
        let source = WeightSource::parse("ccdb", DEFAULT_WEIGHTS_KEY, true).unwrap();
        let mut loader = WeightsLoader::new(source).unwrap();
        let mut ev = event(20, 600);
        ev.tracks[0].eta = 1.5;
        let w = loader.weights_for(&store, &ev).unwrap();
        assert_eq!(w.len(), 600);
        assert_eq!(w[0].phi_weight, 1.0);
        assert_eq!(w[1].phi_weight, 4.0);
        assert_eq!(w[2].phi_weight, 5.0);
    }

    #[test]
    fn wrong_dimension_map_is_rejected() {
        let mut store = MemoryStore::new();
        let flat = Histogram::new(vec![Axis::new(2, 0.0, 1.0)]).unwrap();
        store.insert_always(DEFAULT_WEIGHTS_KEY, CalibObject::Histogram(flat));
        let source = WeightSource::parse("ccdb", DEFAULT_WEIGHTS_KEY, false).unwrap();
        let mut loader = WeightsLoader::new(source).unwrap();
        assert!(matches!(
            loader.weights_for(&store, &event(1, 1)),
            Err(WeightsError::Dimension { got: 1, .. })
        ));
    }
}
