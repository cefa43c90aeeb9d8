//! Raw Q-vector accumulation for the six sub-populations.
//!
//! Detector sub-populations are amplitude-weighted:
//!   Q_n = sum_i a_i exp(i n phi_i) / sum_i a_i
//! Track sub-populations use the transverse momentum as the summand and the
//! track count as the normalisation:
//!   Q_n = sum_j pt_j exp(i n phi_j) / N

use std::collections::HashSet;
use std::ops::{Index, IndexMut};

use num_complex::Complex;
use tracing::warn;

use crate::event::{ChannelAmplitude, Ft0Signals, Track};
use crate::geom::{ChannelAngles, Detector, FT0_C_CHANNEL_OFFSET};
use crate::tables::GainTable;

/// Summed weights at or below this are treated as zero.
pub const EPSILON: f64 = 1e-8;
/// Reported when the source is requested but carries no weight.
pub const EMPTY_SENTINEL: f64 = 999.0;
/// Reported when the source is missing for the event or not requested.
pub const ABSENT_SENTINEL: f64 = -999.0;

pub const MIN_ABS_ETA: f64 = 0.1;
pub const MAX_ABS_ETA: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubPopulation {
    Ft0C,
    Ft0A,
    Ft0M,
    Fv0A,
    BPos,
    BNeg,
}

impl SubPopulation {
    pub const COUNT: usize = 6;
    pub const ALL: [SubPopulation; 6] = [
        SubPopulation::Ft0C,
        SubPopulation::Ft0A,
        SubPopulation::Ft0M,
        SubPopulation::Fv0A,
        SubPopulation::BPos,
        SubPopulation::BNeg,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SubPopulation::Ft0C => "FT0C",
            SubPopulation::Ft0A => "FT0A",
            SubPopulation::Ft0M => "FT0M",
            SubPopulation::Fv0A => "FV0A",
            SubPopulation::BPos => "BPos",
            SubPopulation::BNeg => "BNeg",
        }
    }

    pub fn is_track(self) -> bool {
        matches!(self, SubPopulation::BPos | SubPopulation::BNeg)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        SubPopulation::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(raw.trim()))
    }
}

/// One value per sub-population, indexed by [`SubPopulation`].
#[derive(Clone, Debug, PartialEq)]
pub struct PerSubPopulation<T>(pub [T; SubPopulation::COUNT]);

impl<T> PerSubPopulation<T> {
    pub fn from_fn(mut f: impl FnMut(SubPopulation) -> T) -> Self {
        Self(SubPopulation::ALL.map(&mut f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubPopulation, &T)> {
        SubPopulation::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<SubPopulation> for PerSubPopulation<T> {
    type Output = T;

    fn index(&self, sub: SubPopulation) -> &T {
        &self.0[sub.index()]
    }
}

impl<T> IndexMut<SubPopulation> for PerSubPopulation<T> {
    fn index_mut(&mut self, sub: SubPopulation) -> &mut T {
        &mut self.0[sub.index()]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QVector {
    pub re: f64,
    pub im: f64,
}

impl QVector {
    pub const EMPTY: QVector = QVector {
        re: EMPTY_SENTINEL,
        im: EMPTY_SENTINEL,
    };
    pub const ABSENT: QVector = QVector {
        re: ABSENT_SENTINEL,
        im: ABSENT_SENTINEL,
    };

    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn magnitude(&self) -> f64 {
        self.re.hypot(self.im)
    }
}

impl From<Complex<f64>> for QVector {
    fn from(z: Complex<f64>) -> Self {
        Self { re: z.re, im: z.im }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QStatus {
    Computed,
    Empty,
    Absent,
}

/// Normalised Q-vector of one sub-population with its weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawQVector {
    pub q: QVector,
    pub weight: f64,
    pub status: QStatus,
}

impl RawQVector {
    pub fn absent() -> Self {
        Self {
            q: QVector::ABSENT,
            weight: 0.0,
            status: QStatus::Absent,
        }
    }

    pub fn is_computed(&self) -> bool {
        self.status == QStatus::Computed
    }
}

#[derive(Clone, Debug)]
pub struct QAccumulator {
    harmonic: f64,
    sum: Complex<f64>,
    weight: f64,
}

impl QAccumulator {
    pub fn new(harmonic: u32) -> Self {
        Self {
            harmonic: f64::from(harmonic),
            sum: Complex::new(0.0, 0.0),
            weight: 0.0,
        }
    }

    /// Adds `amplitude * exp(i n phi)` and `amplitude` to the normalisation.
    pub fn add(&mut self, phi: f64, amplitude: f64) {
        self.sum += Complex::from_polar(amplitude, self.harmonic * phi);
        self.weight += amplitude;
    }

    /// Adds `pt * exp(i n phi)` and one unit to the normalisation.
    pub fn add_track(&mut self, phi: f64, pt: f64) {
        self.sum += Complex::from_polar(pt, self.harmonic * phi);
        self.weight += 1.0;
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn finish(self) -> RawQVector {
        if self.weight > EPSILON {
            RawQVector {
                q: (self.sum / self.weight).into(),
                weight: self.weight,
                status: QStatus::Computed,
            }
        } else {
            RawQVector {
                q: QVector::EMPTY,
                weight: self.weight.max(0.0),
                status: QStatus::Empty,
            }
        }
    }
}

/// A channel with its aligned angle and amplitudes before and after gain
/// equalisation. FT0 ids are in the combined A+C index space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub channel: u32,
    pub phi: f64,
    pub raw: f32,
    pub corrected: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ft0Hits {
    pub a: Vec<Hit>,
    pub c: Vec<Hit>,
}

/// Channel ids already warned about during the current run.
#[derive(Debug, Default)]
pub struct ChannelWarnings {
    seen: HashSet<(Detector, u32)>,
}

impl ChannelWarnings {
    pub fn clear(&mut self) {
        self.seen.clear();
    }

    fn warn_once(&mut self, detector: Detector, channel: u32, what: &str) {
        if self.seen.insert((detector, channel)) {
            warn!("[qvec] {} channel {} skipped: {}", detector.name(), channel, what);
        }
    }
}

/// Attach angles and gain corrections; channels without either are dropped.
pub fn resolve_hits(
    detector: Detector,
    signals: &[ChannelAmplitude],
    id_offset: u32,
    angles: &ChannelAngles,
    gains: &GainTable,
    warnings: &mut ChannelWarnings,
) -> Vec<Hit> {
    let mut hits = Vec::with_capacity(signals.len());
    for s in signals {
        let channel = s.channel.saturating_add(id_offset);
        let Some(phi) = angles.phi(detector, channel) else {
            warnings.warn_once(detector, channel, "no geometry");
            continue;
        };
        let Some(corrected) = gains.correct(channel, s.amplitude) else {
            warnings.warn_once(detector, channel, "no usable gain");
            continue;
        };
        hits.push(Hit {
            channel,
            phi,
            raw: s.amplitude,
            corrected,
        });
    }
    hits
}

pub fn resolve_ft0(
    signals: &Ft0Signals,
    angles: &ChannelAngles,
    gains: &GainTable,
    warnings: &mut ChannelWarnings,
) -> Ft0Hits {
    Ft0Hits {
        a: resolve_hits(Detector::Ft0, &signals.a, 0, angles, gains, warnings),
        c: resolve_hits(
            Detector::Ft0,
            &signals.c,
            FT0_C_CHANNEL_OFFSET,
            angles,
            gains,
            warnings,
        ),
    }
}

/// FT0 A, C and M Q-vectors. M is its own accumulator fed by both sides.
pub fn accumulate_ft0(
    harmonic: u32,
    hits: Option<&Ft0Hits>,
    enabled: &SubPopulationSet,
) -> (RawQVector, RawQVector, RawQVector) {
    let Some(hits) = hits else {
        return (RawQVector::absent(), RawQVector::absent(), RawQVector::absent());
    };
    let want_a = enabled.contains(SubPopulation::Ft0A);
    let want_c = enabled.contains(SubPopulation::Ft0C);
    let want_m = enabled.contains(SubPopulation::Ft0M);

    let mut acc_a = QAccumulator::new(harmonic);
    let mut acc_c = QAccumulator::new(harmonic);
    let mut acc_m = QAccumulator::new(harmonic);
    if want_a || want_m {
        for h in &hits.a {
            if want_a {
                acc_a.add(h.phi, h.corrected);
            }
            if want_m {
                acc_m.add(h.phi, h.corrected);
            }
        }
    }
    if want_c || want_m {
        for h in &hits.c {
            if want_c {
                acc_c.add(h.phi, h.corrected);
            }
            if want_m {
                acc_m.add(h.phi, h.corrected);
            }
        }
    }

    let finish = |want: bool, acc: QAccumulator| {
        if want {
            acc.finish()
        } else {
            RawQVector::absent()
        }
    };
    (
        finish(want_a, acc_a),
        finish(want_c, acc_c),
        finish(want_m, acc_m),
    )
}

pub fn accumulate_fv0(harmonic: u32, hits: Option<&[Hit]>, enabled: &SubPopulationSet) -> RawQVector {
    match hits {
        Some(hits) if enabled.contains(SubPopulation::Fv0A) => {
            let mut acc = QAccumulator::new(harmonic);
            for h in hits {
                acc.add(h.phi, h.corrected);
            }
            acc.finish()
        }
        _ => RawQVector::absent(),
    }
}

/// Transverse-momentum window plus the track quality flags.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackSelection {
    pub min_pt: f64,
    pub max_pt: f64,
}

impl Default for TrackSelection {
    fn default() -> Self {
        Self {
            min_pt: 0.15,
            max_pt: 5.0,
        }
    }
}

impl TrackSelection {
    pub fn accepts(&self, track: &Track) -> bool {
        track.pt >= self.min_pt && track.pt <= self.max_pt && track.quality.all_passed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtaSide {
    Positive,
    Negative,
}

impl EtaSide {
    /// Side of the fiducial window `0.1 <= |eta| <= 0.8`, `None` outside it.
    pub fn of(eta: f64) -> Option<Self> {
        let abs = eta.abs();
        if !(MIN_ABS_ETA..=MAX_ABS_ETA).contains(&abs) {
            return None;
        }
        Some(if eta > 0.0 {
            EtaSide::Positive
        } else {
            EtaSide::Negative
        })
    }
}

/// Tracks that passed the selection, split by eta side. `selected` also
/// holds tracks outside the eta window.
#[derive(Debug, Default)]
pub struct TrackSplit<'a> {
    pub selected: Vec<&'a Track>,
    pub positive: Vec<&'a Track>,
    pub negative: Vec<&'a Track>,
}

impl<'a> TrackSplit<'a> {
    pub fn new(tracks: &'a [Track], selection: &TrackSelection) -> Self {
        let mut split = TrackSplit::default();
        for track in tracks.iter().filter(|t| selection.accepts(t)) {
            split.selected.push(track);
            match EtaSide::of(track.eta) {
                Some(EtaSide::Positive) => split.positive.push(track),
                Some(EtaSide::Negative) => split.negative.push(track),
                None => {}
            }
        }
        split
    }

    /// Contributing track ids for `side`, empty when that side is disabled.
    pub fn ids(&self, side: EtaSide, enabled: &SubPopulationSet) -> Vec<i64> {
        let (tracks, sub) = match side {
            EtaSide::Positive => (&self.positive, SubPopulation::BPos),
            EtaSide::Negative => (&self.negative, SubPopulation::BNeg),
        };
        if !enabled.contains(sub) {
            return Vec::new();
        }
        tracks.iter().map(|t| t.global_id).collect()
    }
}

pub fn accumulate_tracks(
    harmonic: u32,
    split: &TrackSplit<'_>,
    enabled: &SubPopulationSet,
) -> (RawQVector, RawQVector) {
    let side = |tracks: &[&Track], sub: SubPopulation| {
        if !enabled.contains(sub) {
            return RawQVector::absent();
        }
        let mut acc = QAccumulator::new(harmonic);
        for t in tracks {
            acc.add_track(t.phi, t.pt);
        }
        acc.finish()
    };
    (
        side(&split.positive, SubPopulation::BPos),
        side(&split.negative, SubPopulation::BNeg),
    )
}

/// Which sub-populations are requested downstream. Fixed at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubPopulationSet {
    mask: u8,
}

impl Default for SubPopulationSet {
    fn default() -> Self {
        Self::all()
    }
}

impl SubPopulationSet {
    pub fn all() -> Self {
        Self {
            mask: (1 << SubPopulation::COUNT) - 1,
        }
    }

    pub fn none() -> Self {
        Self { mask: 0 }
    }

    pub fn with(mut self, sub: SubPopulation) -> Self {
        self.mask |= 1 << sub.index();
        self
    }

    pub fn contains(&self, sub: SubPopulation) -> bool {
        self.mask & (1 << sub.index()) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = SubPopulation> + '_ {
        SubPopulation::ALL.into_iter().filter(|s| self.contains(*s))
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Parse a comma separated list such as `ft0c,fv0a,bpos`, or `all`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        }
        let mut set = Self::none();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let sub = SubPopulation::parse(part)
                .ok_or_else(|| format!("unknown sub-population '{part}'"))?;
            set = set.with(sub);
        }
        if set.is_empty() {
            return Err("no sub-population requested".into());
        }
        Ok(set)
    }
}
