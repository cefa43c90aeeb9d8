use std::collections::HashMap;
use std::path::Path;

use roxmltree::{Document, Node};

use crate::error::{QvecError, Result};
use crate::taskfile::{from_params, normalise_key, TaskFileData, KEYS};

fn is_tag(node: Node<'_, '_>, tag: &str) -> bool {
    node.is_element() && normalise_key(node.tag_name().name()) == tag
}

fn attr<'a>(node: Node<'a, 'a>, name: &str) -> Option<&'a str> {
    node.attributes()
        .find(|a| normalise_key(a.name()) == name)
        .map(|a| a.value().trim())
}

fn find<'a>(doc: &'a Document<'a>, tag: &str) -> Option<Node<'a, 'a>> {
    doc.descendants().find(|n| is_tag(*n, tag))
}

/// Reads a task file of the form
///
/// ```xml
/// <task>
///   <store noLaterThan="1700000000000">/data/ccdb</store>
///   <centrality estimator="FT0C"/>
///   <tracks minPt="0.15" maxPt="5.0"/>
///   <harmonics>2 3</harmonics>
///   <calibration path="Analysis/EventPlane/QVecCorrections"/>
///   <gain path="Analysis/EventPlane/GainEq"/>
///   <ampaxis bins="1000" min="0" max="5000"/>
/// </task>
/// ```
///
/// Any key of the text form may also appear as an element with a text value.
pub fn parse_xml_task(path: &Path) -> Result<TaskFileData> {
    let xml = std::fs::read_to_string(path)?;
    let doc = Document::parse(&xml)?;
    let mut params: HashMap<String, String> = HashMap::new();

    for node in doc.descendants().filter(|n| n.is_element()) {
        let key = normalise_key(node.tag_name().name());
        if !KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(text) = node.text().map(str::trim).filter(|t| !t.is_empty()) {
            params.insert(key, text.to_string());
        }
    }

    if let Some(v) = find(&doc, "store").and_then(|n| attr(n, "nolaterthan")) {
        params.insert("nolaterthan".into(), v.to_string());
    }
    if let Some(v) = find(&doc, "centrality").and_then(|n| attr(n, "estimator")) {
        params.insert("centestimator".into(), v.to_string());
    }
    if let Some(tracks) = find(&doc, "tracks") {
        for key in ["minpt", "maxpt"] {
            if let Some(v) = attr(tracks, key) {
                params.insert(key.into(), v.to_string());
            }
        }
    }
    for (tag, key) in [("calibration", "calibpath"), ("gain", "gainpath")] {
        if let Some(v) = find(&doc, tag).and_then(|n| attr(n, "path")) {
            params.insert(key.into(), v.to_string());
        }
    }
    if let Some(axis) = find(&doc, "ampaxis") {
        let parts: Vec<&str> = ["bins", "min", "max"]
            .iter()
            .filter_map(|a| attr(axis, a))
            .collect();
        match parts.len() {
            0 => {}
            3 => {
                params.insert("ampaxis".into(), parts.join(","));
            }
            _ => {
                return Err(QvecError::config(
                    "ampaxis needs all of bins, min and max attributes",
                ))
            }
        }
    }

    from_params(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hist::Axis;
    use crate::qvec::SubPopulation;
    use crate::task::CentralityEstimator;

    #[test]
    fn attributes_and_elements() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.xml");
        std::fs::write(
            &path,
            r#"<?xml version="1.0"?>
<task>
  <store noLaterThan="42">/data/ccdb</store>
  <centrality estimator="1"/>
  <tracks minPt="0.3" maxPt="3"/>
  <harmonics>2 4</harmonics>
  <gain path="Custom/Gain"/>
  <outputs>fv0a</outputs>
  <ampaxis bins="100" min="0" max="1000"/>
</task>"#,
        )
        .unwrap();
        let data = crate::taskfile::parse_task_file(&path).unwrap();
        assert_eq!(data.store.as_deref(), Some(Path::new("/data/ccdb")));
        assert_eq!(data.no_later_than, Some(42));
        assert_eq!(data.centrality_estimator, Some(CentralityEstimator::Ft0A));
        assert_eq!((data.min_pt, data.max_pt), (Some(0.3), Some(3.0)));
        assert_eq!(data.harmonics, Some(vec![2, 4]));
        assert_eq!(data.gain_path.as_deref(), Some("Custom/Gain"));
        assert_eq!(data.calib_path, None);
        let outputs = data.outputs.unwrap();
        assert!(outputs.contains(SubPopulation::Fv0A));
        assert!(!outputs.contains(SubPopulation::Ft0C));
        assert_eq!(data.amplitude_axis, Some(Axis::new(100, 0.0, 1000.0)));
    }

    #[test]
    fn partial_axis_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.xml");
        std::fs::write(&path, r#"<task><ampaxis bins="10"/></task>"#).unwrap();
        assert!(parse_xml_task(&path).is_err());
    }
}
