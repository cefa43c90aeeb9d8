use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::args::{parse_axis, parse_harmonics};
use crate::error::{QvecError, Result};
use crate::hist::Axis;
use crate::qvec::SubPopulationSet;
use crate::task::CentralityEstimator;

/// Settings read from a task file. Every field is optional; unset fields keep
/// the command-line value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFileData {
    pub store: Option<PathBuf>,
    pub no_later_than: Option<i64>,
    pub centrality_estimator: Option<CentralityEstimator>,
    pub min_pt: Option<f64>,
    pub max_pt: Option<f64>,
    pub harmonics: Option<Vec<u32>>,
    pub gain_path: Option<String>,
    pub calib_path: Option<String>,
    pub geometry: Option<PathBuf>,
    pub outputs: Option<SubPopulationSet>,
    pub amplitude_axis: Option<Axis>,
}

/// Keys understood in both the text and XML forms, already normalised.
pub(crate) const KEYS: [&str; 11] = [
    "store",
    "nolaterthan",
    "centestimator",
    "minpt",
    "maxpt",
    "harmonics",
    "gainpath",
    "calibpath",
    "geometry",
    "outputs",
    "ampaxis",
];

pub(crate) fn normalise_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['_', '-'], "")
}

fn parse_value<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    params
        .get(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| QvecError::config(format!("{key} = '{v}': {e}")))
        })
        .transpose()
}

fn parse_estimator(raw: &str) -> Result<CentralityEstimator> {
    let raw = raw.trim();
    let by_index = raw.parse::<i64>().ok().and_then(CentralityEstimator::from_index);
    let by_name = || {
        (0..4)
            .filter_map(CentralityEstimator::from_index)
            .find(|e| e.name().eq_ignore_ascii_case(raw))
    };
    by_index
        .or_else(by_name)
        .ok_or_else(|| QvecError::config(format!("unknown centrality estimator '{raw}'")))
}

pub(crate) fn from_params(params: &HashMap<String, String>) -> Result<TaskFileData> {
    if let Some(unknown) = params.keys().find(|k| !KEYS.contains(&k.as_str())) {
        return Err(QvecError::config(format!("unknown task file key '{unknown}'")));
    }
    Ok(TaskFileData {
        store: params.get("store").map(PathBuf::from),
        no_later_than: parse_value(params, "nolaterthan")?,
        centrality_estimator: params.get("centestimator").map(|v| parse_estimator(v)).transpose()?,
        min_pt: parse_value(params, "minpt")?,
        max_pt: parse_value(params, "maxpt")?,
        harmonics: params.get("harmonics").map(|v| parse_harmonics(v)).transpose()?,
        gain_path: params.get("gainpath").cloned(),
        calib_path: params.get("calibpath").cloned(),
        geometry: params.get("geometry").map(PathBuf::from),
        outputs: params
            .get("outputs")
            .map(|v| SubPopulationSet::parse(v).map_err(QvecError::config))
            .transpose()?,
        amplitude_axis: params.get("ampaxis").map(|v| parse_axis(v)).transpose()?,
    })
}

fn parse_task_file_kv(path: &Path) -> Result<TaskFileData> {
    let reader = BufReader::new(File::open(path)?);
    let mut params = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(index) = line.find('=') {
            let (key, value) = line.split_at(index);
            let value = value
                .trim_start_matches('=')
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            params.insert(normalise_key(key), value);
        }
    }
    from_params(&params)
}

/// Reads `key = value` text, or XML when the extension is `.xml`.
pub fn parse_task_file(path: &Path) -> Result<TaskFileData> {
    let is_xml = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("xml"))
        .unwrap_or(false);
    if is_xml {
        return crate::xml::parse_xml_task(path);
    }
    parse_task_file_kv(path)
}
