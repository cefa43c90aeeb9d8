use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::{QvecError, Result};
use crate::hist::Axis;
use crate::qa::DEFAULT_AMPLITUDE_AXIS;
use crate::qvec::{SubPopulationSet, TrackSelection};
use crate::run_cache::{StorePaths, DEFAULT_CALIB_PATH, DEFAULT_GAIN_PATH};
use crate::task::{CentralityEstimator, TaskConfig};
use crate::taskfile::TaskFileData;
use crate::weights::DEFAULT_WEIGHTS_KEY;

pub const DEFAULT_OUTPUT_DIR: &str = "qvectors_out";
pub const DEFAULT_HARMONICS: &str = "2,3";
pub const DEFAULT_OUTPUTS: &str = "all";
const DEFAULT_CENT_ESTIMATOR: i64 = 2;
const DEFAULT_MIN_PT: f64 = 0.15;
const DEFAULT_MAX_PT: f64 = 5.0;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Event-plane Q-vector producer with run-wise recentering, twist and rescale corrections",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  qvectors run --events events.jsonl --store ccdb/ --geometry geometry.json\n  qvectors --config task.cfg run --events events.jsonl --harmonics 2,3,4 --outputs ft0c,fv0a\n  qvectors weights --events events.jsonl --source local://nua.json\n"
)]
pub struct Cli {
    /// Task file (key = value text, or .xml) overriding options left at their defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (per-event summaries, store lookups)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Number of parallel worker threads (default: all available cores)
    #[arg(long, global = true)]
    pub cpu: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Compute calibrated Q-vectors and write the output tables
    Run(RunArgs),
    /// Compute per-track NUA weights and write the JWeights table
    Weights(WeightsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Events as JSON lines
    #[arg(long)]
    pub events: PathBuf,

    /// Calibration store directory
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Ignore store objects created after this time (ms since epoch, default: now)
    #[arg(long = "no-later-than", visible_alias = "nolaterthan")]
    pub no_later_than: Option<i64>,

    /// Nominal channel positions (JSON)
    #[arg(long)]
    pub geometry: Option<PathBuf>,

    /// Output directory for tables, QA dump and plots
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Centrality estimator: 0 FT0M, 1 FT0A, 2 FT0C, 3 FV0A
    #[arg(long = "cent-estimator", default_value_t = DEFAULT_CENT_ESTIMATOR)]
    pub cent_estimator: i64,

    /// Lower pt bound for selected tracks (GeV/c)
    #[arg(long = "min-pt", default_value_t = DEFAULT_MIN_PT)]
    pub min_pt: f64,

    /// Upper pt bound for selected tracks (GeV/c)
    #[arg(long = "max-pt", default_value_t = DEFAULT_MAX_PT)]
    pub max_pt: f64,

    /// Comma-separated harmonic orders
    #[arg(long, default_value = DEFAULT_HARMONICS)]
    pub harmonics: String,

    /// Store key prefix of the calibration histograms
    #[arg(long = "calib-path", default_value = DEFAULT_CALIB_PATH)]
    pub calib_path: String,

    /// Store key prefix of the gain-equalisation tables
    #[arg(long = "gain-path", default_value = DEFAULT_GAIN_PATH)]
    pub gain_path: String,

    /// Sub-populations to produce (e.g. "ft0c,fv0a,bpos"), or "all"
    #[arg(long, default_value = DEFAULT_OUTPUTS)]
    pub outputs: String,

    /// Amplitude QA axis as bins,min,max
    #[arg(long = "amp-axis")]
    pub amp_axis: Option<String>,

    /// Skip the QA PNG plots
    #[arg(long = "no-plots")]
    pub no_plots: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WeightsArgs {
    /// Events as JSON lines
    #[arg(long)]
    pub events: PathBuf,

    /// Weight source: a string containing "ccdb", or local://<file>
    #[arg(long)]
    pub source: String,

    /// Store key of the weight maps
    #[arg(long, default_value = DEFAULT_WEIGHTS_KEY)]
    pub key: String,

    /// Look weight maps up by run number instead of timestamp
    #[arg(long = "by-run")]
    pub by_run: bool,

    /// Calibration store directory (for store sources)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Ignore store objects created after this time (ms since epoch, default: now)
    #[arg(long = "no-later-than")]
    pub no_later_than: Option<i64>,

    /// Output directory for the JWeights table
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,
}

fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(from);
    }
}

impl RunArgs {
    /// Options still at their defaults take the task file's value.
    pub fn apply_task_file(&mut self, file: &TaskFileData) {
        fill(&mut self.store, &file.store);
        fill(&mut self.no_later_than, &file.no_later_than);
        fill(&mut self.geometry, &file.geometry);
        if self.cent_estimator == DEFAULT_CENT_ESTIMATOR {
            if let Some(est) = file.centrality_estimator {
                self.cent_estimator = est.index() as i64;
            }
        }
        if self.min_pt == DEFAULT_MIN_PT {
            self.min_pt = file.min_pt.unwrap_or(self.min_pt);
        }
        if self.max_pt == DEFAULT_MAX_PT {
            self.max_pt = file.max_pt.unwrap_or(self.max_pt);
        }
        if self.harmonics == DEFAULT_HARMONICS {
            if let Some(h) = &file.harmonics {
                self.harmonics = h.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
            }
        }
        if self.calib_path == DEFAULT_CALIB_PATH {
            if let Some(p) = &file.calib_path {
                self.calib_path.clone_from(p);
            }
        }
        if self.gain_path == DEFAULT_GAIN_PATH {
            if let Some(p) = &file.gain_path {
                self.gain_path.clone_from(p);
            }
        }
        if self.outputs == DEFAULT_OUTPUTS {
            if let Some(set) = file.outputs {
                self.outputs = set
                    .iter()
                    .map(|s| s.name().to_ascii_lowercase())
                    .collect::<Vec<_>>()
                    .join(",");
            }
        }
        if self.amp_axis.is_none() {
            if let Some(axis) = file.amplitude_axis {
                self.amp_axis = Some(format!("{},{},{}", axis.bins, axis.min, axis.max));
            }
        }
    }

    pub fn task_config(&self) -> Result<TaskConfig> {
        let centrality_estimator = CentralityEstimator::from_index(self.cent_estimator)
            .ok_or_else(|| {
                QvecError::config(format!(
                    "centrality estimator must be 0..=3, got {}",
                    self.cent_estimator
                ))
            })?;
        let harmonics = parse_harmonics(&self.harmonics)?;
        let enabled = SubPopulationSet::parse(&self.outputs).map_err(QvecError::config)?;
        let amplitude_axis = match &self.amp_axis {
            Some(raw) => parse_axis(raw)?,
            None => DEFAULT_AMPLITUDE_AXIS,
        };
        let config = TaskConfig {
            centrality_estimator,
            track_selection: TrackSelection {
                min_pt: self.min_pt,
                max_pt: self.max_pt,
            },
            harmonics,
            enabled,
            paths: StorePaths {
                calib_path: self.calib_path.clone(),
                gain_path: self.gain_path.clone(),
            },
            amplitude_axis,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Items separated by commas, semicolons or whitespace.
fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

pub fn parse_harmonics(raw: &str) -> Result<Vec<u32>> {
    split_list(raw)
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| QvecError::config(format!("harmonic '{s}': {e}")))
        })
        .collect()
}

/// `bins,min,max` with `bins >= 1` and `max > min`.
pub fn parse_axis(raw: &str) -> Result<Axis> {
    let bad = || QvecError::config(format!("amplitude axis must be 'bins,min,max', got '{raw}'"));
    let parts: Vec<&str> = split_list(raw).collect();
    let [bins, min, max] = parts[..] else {
        return Err(bad());
    };
    let bins = bins.parse::<usize>().map_err(|_| bad())?;
    let min = min.parse::<f64>().map_err(|_| bad())?;
    let max = max.parse::<f64>().map_err(|_| bad())?;
    if bins == 0 || !(max > min) {
        return Err(bad());
    }
    Ok(Axis::new(bins, min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qvec::SubPopulation;

    fn parse_run(args: &[&str]) -> RunArgs {
        let mut full = vec!["qvectors", "run"];
        full.extend_from_slice(args);
        match Cli::parse_from(full).command {
            Command::Run(run) => run,
            Command::Weights(_) => panic!("expected run"),
        }
    }

    #[test]
    fn defaults_give_the_standard_configuration() {
        let config = parse_run(&["--events", "e.jsonl"]).task_config().unwrap();
        assert_eq!(config, TaskConfig::default());
    }

    #[test]
    fn explicit_options_win_over_the_task_file() {
        let mut run = parse_run(&["--events", "e.jsonl", "--min-pt", "0.5", "--outputs", "bneg"]);
        let file = TaskFileData {
            min_pt: Some(0.2),
            max_pt: Some(3.0),
            harmonics: Some(vec![4]),
            outputs: Some(SubPopulationSet::parse("ft0a").unwrap()),
            centrality_estimator: Some(CentralityEstimator::Fv0A),
            amplitude_axis: Some(Axis::new(10, 0.0, 10.0)),
            ..TaskFileData::default()
        };
        run.apply_task_file(&file);
        let config = run.task_config().unwrap();
        assert_eq!(config.track_selection.min_pt, 0.5);
        assert_eq!(config.track_selection.max_pt, 3.0);
        assert_eq!(config.harmonics, vec![4]);
        assert!(config.enabled.contains(SubPopulation::BNeg));
        assert!(!config.enabled.contains(SubPopulation::Ft0A));
        assert_eq!(config.centrality_estimator, CentralityEstimator::Fv0A);
        assert_eq!(config.amplitude_axis, Axis::new(10, 0.0, 10.0));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(parse_run(&["--events", "e", "--cent-estimator", "5"]).task_config().is_err());
        assert!(parse_run(&["--events", "e", "--harmonics", "2,x"]).task_config().is_err());
        assert!(parse_run(&["--events", "e", "--amp-axis", "10,5"]).task_config().is_err());
        assert!(parse_axis("2.5,0,1").is_err());
        assert_eq!(parse_axis("4, 0, 2").unwrap(), Axis::new(4, 0.0, 2.0));
        assert_eq!(parse_axis("4;0;2").unwrap(), Axis::new(4, 0.0, 2.0));
        assert!(parse_axis("0,0,2").is_err());
        assert_eq!(parse_harmonics("2, 3;4 5").unwrap(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn weights_subcommand() {
        let cli = Cli::parse_from([
            "qvectors", "--debug", "weights", "--events", "e.jsonl", "--source", "local://w.json",
        ]);
        assert!(cli.debug);
        match cli.command {
            Command::Weights(w) => {
                assert_eq!(w.key, DEFAULT_WEIGHTS_KEY);
                assert!(!w.by_run);
            }
            Command::Run(_) => panic!("expected weights"),
        }
    }
}
