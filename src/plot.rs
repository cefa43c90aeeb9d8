use std::error::Error;
use std::path::Path;

use plotters::prelude::PathElement;
use plotters::prelude::*;

pub use plotters::prelude::{RGBColor, BLUE, RED};

use crate::hist::Axis;

pub type DynError = Box<dyn Error + Send + Sync>;

const PLOT_FONT_SCALE: f64 = 1.2;

fn scaled_font_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn scaled_area_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

/// One binned distribution drawn as a step outline.
pub struct Spectrum<'a> {
    pub counts: &'a [f64],
    pub color: &'a RGBColor,
    pub label: &'a str,
}

/// Outline of a histogram: a horizontal segment across every bin.
fn step_points(axis: &Axis, counts: &[f64]) -> Vec<(f64, f64)> {
    let width = axis.width();
    let mut points = Vec::with_capacity(2 * counts.len());
    for (i, &y) in counts.iter().enumerate() {
        let lo = axis.min + i as f64 * width;
        points.push((lo, y));
        points.push((lo + width, y));
    }
    points
}

/// Counts are non-negative, so the range starts at zero with 5% headroom on top.
fn y_extent(spectra: &[Spectrum<'_>]) -> (f64, f64) {
    let max_val = spectra
        .iter()
        .flat_map(|s| s.counts.iter().copied())
        .filter(|v| v.is_finite())
        .fold(0.0, f64::max);
    if max_val <= 0.0 {
        return (0.0, 1.0);
    }
    (0.0, max_val * 1.05)
}

/// Overlay several spectra binned on the same axis.
pub fn plot_spectra(
    axis: &Axis,
    spectra: &[Spectrum<'_>],
    title: &str,
    filename: &Path,
    x_label: &str,
    y_label: &str,
) -> Result<(), DynError> {
    if spectra.is_empty() {
        return Err("No spectra provided to plot".into());
    }
    for s in spectra {
        if s.counts.len() != axis.bins {
            return Err(format!(
                "spectrum '{}' has {} bins, axis has {}",
                s.label,
                s.counts.len(),
                axis.bins
            )
            .into());
        }
    }

    let root = BitMapBackend::new(filename, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)?;

    let (y_min, y_max) = y_extent(spectra);
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", scaled_font_size(28)).into_font())
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(axis.min..axis.max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .label_style(("sans-serif", scaled_font_size(20)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(24)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()?;

    for s in spectra {
        let color = *s.color;
        chart
            .draw_series(LineSeries::new(step_points(axis, s.counts), color))?
            .label(s.label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], color));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(&WHITE.mix(0.8))
        .label_font(("sans-serif", scaled_font_size(20)).into_font())
        .draw()?;

    root.present()?;
    Ok(())
}

pub fn plot_spectrum(
    axis: &Axis,
    counts: &[f64],
    title: &str,
    filename: &Path,
    x_label: &str,
    y_label: &str,
    label: &str,
) -> Result<(), DynError> {
    plot_spectra(
        axis,
        &[Spectrum {
            counts,
            color: &BLUE,
            label,
        }],
        title,
        filename,
        x_label,
        y_label,
    )
}
