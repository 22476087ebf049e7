//! Tree apex detection on a canopy height model.
//!
//! Two detectors share the same output type:
//!
//! - [`FixedWindowMaxima`]: one maximum-filter pass with a fixed suppression
//!   distance, thresholding, border exclusion and an optional peak cap.
//! - [`VariableWindowMaxima`]: maximum-filter candidates refined with a
//!   height-dependent (allometric) window, after Popescu et al. (2002).
//!
//! Candidates are always ranked by `(height desc, row asc, col asc)` before any
//! selection step, so results do not depend on iteration or thread order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use log::debug;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::TreeSegError;
use crate::filter::{maximum_filter, FilterBorder};
use crate::params::{non_negative, optional_non_negative, pixel_distance, HeightFloor};
use crate::projection::{CoordinateProjector, GeoPoint};
use crate::raster::{BoundingBox, GridIndex, HeightModel};
use crate::Result;

// ---------------------------------------------------------------------------
// Public result type
// ---------------------------------------------------------------------------

/// Set of detected apex cells on a borrowed [`HeightModel`].
///
/// Marks are unique and kept in row-major order. The projector and extent are
/// resolved once at construction; if the model carries no usable affine,
/// the georeference error is kept and returned by the geographic accessors.
#[derive(Debug, Clone)]
pub struct DetectionResult<'a> {
    model: &'a HeightModel,
    marks: Vec<GridIndex>,
    georef: std::result::Result<(CoordinateProjector, BoundingBox), TreeSegError>,
}

impl<'a> DetectionResult<'a> {
    fn new(model: &'a HeightModel, mut marks: Vec<GridIndex>) -> Self {
        marks.sort_unstable();
        marks.dedup();
        let georef = model
            .projector()
            .and_then(|p| Ok((p, model.bounding_box()?)));
        Self {
            model,
            marks,
            georef,
        }
    }

    /// Build a result from externally chosen cells.
    pub fn from_marks(
        model: &'a HeightModel,
        marks: impl IntoIterator<Item = GridIndex>,
    ) -> Result<Self> {
        let marks: Vec<GridIndex> = marks.into_iter().collect();
        if let Some(bad) = marks.iter().find(|m| !model.contains_index(**m)) {
            return Err(TreeSegError::IndexOutOfBounds {
                row: bad.row,
                col: bad.col,
                nrow: model.nrow(),
                ncol: model.ncol(),
            });
        }
        Ok(Self::new(model, marks))
    }

    pub fn model(&self) -> &'a HeightModel {
        self.model
    }

    pub fn marks(&self) -> &[GridIndex] {
        &self.marks
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Grid dimensions, identical to the source model.
    pub fn shape(&self) -> (usize, usize) {
        self.model.shape()
    }

    pub fn contains(&self, index: GridIndex) -> bool {
        self.marks.binary_search(&index).is_ok()
    }

    /// Row-major boolean mask with `true` on every mark.
    pub fn mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.model.len()];
        for m in &self.marks {
            mask[m.row * self.model.ncol() + m.col] = true;
        }
        mask
    }

    /// Height at each mark, in mark order.
    pub fn heights(&self) -> Vec<f64> {
        self.marks.iter().map(|&m| self.model[m]).collect()
    }

    /// Cell-centre coordinates of each mark, in mark order.
    pub fn coordinates(&self) -> Result<Vec<GeoPoint>> {
        let (projector, _) = self.georef.as_ref().map_err(Clone::clone)?;
        Ok(projector.project_batch(&self.marks))
    }

    pub fn bounding_box(&self) -> Result<BoundingBox> {
        let (_, bbox) = self.georef.as_ref().map_err(Clone::clone)?;
        Ok(*bbox)
    }

    pub fn crs(&self) -> Option<&str> {
        self.model.crs()
    }
}

/// Common interface of the apex detectors.
pub trait MaximaDetector {
    /// Detect apices. Never mutates `model`; an empty result is not an error.
    fn detect<'a>(&self, model: &'a HeightModel) -> Result<DetectionResult<'a>>;
}

// ---------------------------------------------------------------------------
// Candidate ranking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: GridIndex,
    height: f64,
}

impl Candidate {
    /// Tallest first; ties go to the lowest row, then the lowest column.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .height
            .total_cmp(&self.height)
            .then(self.index.row.cmp(&other.index.row))
            .then(self.index.col.cmp(&other.index.col))
    }
}

/// Cells equal to their filtered value that pass `keep`, ranked.
fn ranked_candidates(
    model: &HeightModel,
    filtered: &[f64],
    keep: impl Fn(GridIndex, f64) -> bool,
) -> Vec<Candidate> {
    let ncol = model.ncol();
    let mut candidates: Vec<Candidate> = model
        .data()
        .iter()
        .zip(filtered)
        .enumerate()
        .filter_map(|(i, (&h, &f))| {
            let index = GridIndex::new(i / ncol, i % ncol);
            (h == f && keep(index, h)).then_some(Candidate { index, height: h })
        })
        .collect();
    candidates.sort_by(Candidate::rank);
    candidates
}

/// True when no cell of equal height precedes `c` in row-major order inside
/// its `(2 * radius + 1)²` window.
fn first_in_window(model: &HeightModel, c: &Candidate, radius: usize) -> bool {
    let ncol = model.ncol();
    let GridIndex { row, col } = c.index;
    let c0 = col.saturating_sub(radius);
    let c1 = col.saturating_add(radius).min(ncol - 1);
    let earlier_rows = row.saturating_sub(radius)..row;
    let ties_above = earlier_rows
        .flat_map(|r| (c0..=c1).map(move |k| (r, k)))
        .any(|cell| model[cell] == c.height);
    let ties_left = (c0..col).any(|k| model[(row, k)] == c.height);
    !(ties_above || ties_left)
}

// ---------------------------------------------------------------------------
// FixedWindowMaxima
// ---------------------------------------------------------------------------

/// Upper bound on the number of returned peaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakLimit {
    #[default]
    Unbounded,
    AtMost(usize),
}

/// Margin along the raster edges in which peaks are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BorderExclusion {
    Disabled,
    /// Margin equal to the pixel suppression distance.
    #[default]
    MinDistance,
    /// Margin in map units.
    Margin(f64),
}

/// Parameters of [`FixedWindowMaxima`]. Distances are in map units.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedWindowParams {
    /// Minimum distance between two peaks.
    pub min_distance: f64,
    /// Minimum apex height. When unset, peaks must rise above the raster minimum.
    pub threshold_abs: Option<f64>,
    pub exclude_border: BorderExclusion,
    pub max_peaks: PeakLimit,
}

impl Default for FixedWindowParams {
    fn default() -> Self {
        Self {
            min_distance: 1.0,
            threshold_abs: None,
            exclude_border: BorderExclusion::MinDistance,
            max_peaks: PeakLimit::Unbounded,
        }
    }
}

/// Fixed-window local maxima with minimum-distance suppression.
#[derive(Debug, Clone)]
pub struct FixedWindowMaxima {
    params: FixedWindowParams,
}

impl FixedWindowMaxima {
    pub fn new(params: FixedWindowParams) -> Result<Self> {
        non_negative("min_distance", params.min_distance)?;
        optional_non_negative("threshold_abs", params.threshold_abs)?;
        if let BorderExclusion::Margin(m) = params.exclude_border {
            non_negative("exclude_border", m)?;
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &FixedWindowParams {
        &self.params
    }
}

impl MaximaDetector for FixedWindowMaxima {
    fn detect<'a>(&self, model: &'a HeightModel) -> Result<DetectionResult<'a>> {
        let radius = pixel_distance(model, self.params.min_distance)?;
        let border = match self.params.exclude_border {
            BorderExclusion::Disabled => 0,
            BorderExclusion::MinDistance => radius,
            BorderExclusion::Margin(m) => pixel_distance(model, m)?,
        };
        if model.is_empty() {
            return Ok(DetectionResult::new(model, Vec::new()));
        }

        let floor = match self.params.threshold_abs {
            Some(t) => HeightFloor::AtLeast(t),
            None => match model.min_value() {
                Some(min) => HeightFloor::Above(min),
                None => HeightFloor::Any,
            },
        };
        let (nrow, ncol) = model.shape();
        let inside = |i: GridIndex| {
            i.row >= border
                && i.col >= border
                && i.row < nrow.saturating_sub(border)
                && i.col < ncol.saturating_sub(border)
        };

        let filtered = maximum_filter(model, radius, FilterBorder::Nearest);
        let candidates =
            ranked_candidates(model, &filtered, |i, h| floor.admits(h) && inside(i));

        // Within `radius` of a candidate every other candidate has the same
        // height, so spacing only breaks ties: keep a candidate when no equal
        // cell precedes it in its window. The kept set shrinks as the radius grows.
        let limit = match self.params.max_peaks {
            PeakLimit::Unbounded => usize::MAX,
            PeakLimit::AtMost(n) => n,
        };
        let kept: Vec<GridIndex> = candidates
            .iter()
            .filter(|c| first_in_window(model, c, radius))
            .take(limit)
            .map(|c| c.index)
            .collect();

        debug!(
            "fixed window: radius={}px border={}px candidates={} kept={}",
            radius,
            border,
            candidates.len(),
            kept.len()
        );
        Ok(DetectionResult::new(model, kept))
    }
}

// ---------------------------------------------------------------------------
// VariableWindowMaxima
// ---------------------------------------------------------------------------

/// Height → crown window width (map units).
#[derive(Clone)]
pub struct Allometry(Arc<dyn Fn(f64) -> f64 + Send + Sync>);

impl Allometry {
    pub const DEFAULT_A: f64 = 2.21;
    pub const DEFAULT_B: f64 = 0.01022;

    /// `width = a + b * h²`
    pub fn quadratic(a: f64, b: f64) -> Self {
        Self(Arc::new(move |h| a + b * h * h))
    }

    pub fn from_fn(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    #[inline]
    pub fn window_width(&self, height: f64) -> f64 {
        (self.0)(height)
    }
}

impl Default for Allometry {
    fn default() -> Self {
        Self::quadratic(Self::DEFAULT_A, Self::DEFAULT_B)
    }
}

impl fmt::Debug for Allometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Allometry(<fn>)")
    }
}

/// Parameters of [`VariableWindowMaxima`].
#[derive(Debug, Clone)]
pub struct VariableWindowParams {
    /// Half-size of the candidate maximum filter, in map units.
    pub min_distance: f64,
    /// Minimum apex height.
    pub threshold_abs: Option<f64>,
    pub allometry: Allometry,
}

impl Default for VariableWindowParams {
    fn default() -> Self {
        Self {
            min_distance: 1.0,
            threshold_abs: Some(2.0),
            allometry: Allometry::default(),
        }
    }
}

/// Two-stage variable-window local maxima.
///
/// Stage 1 keeps every cell equal to its `2p+1` maximum filter (zero padded).
/// Stage 2 keeps a candidate only if nothing in its allometric window is
/// taller, which removes subordinate peaks inside a taller crown.
#[derive(Debug, Clone)]
pub struct VariableWindowMaxima {
    params: VariableWindowParams,
}

impl VariableWindowMaxima {
    pub fn new(params: VariableWindowParams) -> Result<Self> {
        non_negative("min_distance", params.min_distance)?;
        optional_non_negative("threshold_abs", params.threshold_abs)?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &VariableWindowParams {
        &self.params
    }

    /// True when `c` is at least as tall as every cell of its allometric window.
    fn is_dominant(&self, model: &HeightModel, cell_size: f64, c: &Candidate) -> bool {
        let half = window_half_size(self.params.allometry.window_width(c.height), cell_size);
        let GridIndex { row, col } = c.index;
        let r0 = row.saturating_sub(half);
        let r1 = row.saturating_add(half).min(model.nrow() - 1);
        let c0 = col.saturating_sub(half);
        let c1 = col.saturating_add(half).min(model.ncol() - 1);
        let ncol = model.ncol();
        let data = model.data();
        (r0..=r1).all(|r| data[r * ncol + c0..=r * ncol + c1].iter().all(|&v| !(v > c.height)))
    }
}

/// Window half-size in cells for a full window `width`. Non-positive or NaN
/// widths collapse to the centre cell.
fn window_half_size(width: f64, cell_size: f64) -> usize {
    if width.is_finite() && width > 0.0 {
        ((width / cell_size).ceil() as usize) / 2
    } else {
        0
    }
}

impl MaximaDetector for VariableWindowMaxima {
    fn detect<'a>(&self, model: &'a HeightModel) -> Result<DetectionResult<'a>> {
        let radius = pixel_distance(model, self.params.min_distance)?;
        let cell_size = model.cell_size_x()?;
        if model.is_empty() {
            return Ok(DetectionResult::new(model, Vec::new()));
        }

        let floor = match self.params.threshold_abs {
            Some(t) => HeightFloor::AtLeast(t),
            None => HeightFloor::Any,
        };
        let filtered = maximum_filter(model, radius, FilterBorder::Constant(0.0));
        let candidates = ranked_candidates(model, &filtered, |_, h| floor.admits(h));

        #[cfg(feature = "parallel")]
        let survivors: Vec<GridIndex> = candidates
            .par_iter()
            .filter(|c| self.is_dominant(model, cell_size, c))
            .map(|c| c.index)
            .collect();
        #[cfg(not(feature = "parallel"))]
        let survivors: Vec<GridIndex> = candidates
            .iter()
            .filter(|c| self.is_dominant(model, cell_size, c))
            .map(|c| c.index)
            .collect();

        debug!(
            "variable window: radius={}px candidates={} survivors={}",
            radius,
            candidates.len(),
            survivors.len()
        );
        Ok(DetectionResult::new(model, survivors))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Affine;

    fn unit_model(nrow: usize, ncol: usize, data: Vec<f64>) -> HeightModel {
        HeightModel::new(nrow, ncol, data)
            .unwrap()
            .with_affine(Affine::north_up(0.0, nrow as f64, 1.0, 1.0))
            .unwrap()
    }

    fn with_peaks(nrow: usize, ncol: usize, peaks: &[(usize, usize, f64)]) -> HeightModel {
        let mut data = vec![0.0; nrow * ncol];
        for &(r, c, h) in peaks {
            data[r * ncol + c] = h;
        }
        unit_model(nrow, ncol, data)
    }

    fn fixed(min_distance: f64) -> FixedWindowMaxima {
        FixedWindowMaxima::new(FixedWindowParams {
            min_distance,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_single_peak_fixed() {
        let model = with_peaks(5, 5, &[(2, 2, 10.0)]);
        let result = fixed(1.0).detect(&model).unwrap();
        assert_eq!(result.marks(), &[GridIndex::new(2, 2)]);
        assert_eq!(result.heights(), vec![10.0]);
    }

    #[test]
    fn test_constant_array_no_peaks() {
        let model = unit_model(6, 6, vec![3.0; 36]);
        let result = fixed(1.0).detect(&model).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.shape(), (6, 6));
    }

    #[test]
    fn test_plateau_yields_one_peak() {
        let model = with_peaks(7, 7, &[(3, 3, 8.0), (3, 4, 8.0), (4, 3, 8.0)]);
        let a = fixed(1.0).detect(&model).unwrap();
        let b = fixed(1.0).detect(&model).unwrap();
        assert_eq!(a.marks(), &[GridIndex::new(3, 3)]);
        assert_eq!(a.marks(), b.marks());
    }

    #[test]
    fn test_plateau_spacing_shrinks_with_radius() {
        #[rustfmt::skip]
        let model = unit_model(5, 6, vec![
            0.0, 1.0, 0.0, 2.0, 1.0, 1.0,
            1.0, 0.0, 2.0, 2.0, 2.0, 2.0,
            0.0, 1.0, 2.0, 2.0, 2.0, 0.0,
            1.0, 0.0, 0.0, 2.0, 2.0, 1.0,
            1.0, 2.0, 1.0, 2.0, 1.0, 2.0,
        ]);
        let run = |min_distance| {
            FixedWindowMaxima::new(FixedWindowParams {
                min_distance,
                exclude_border: BorderExclusion::Disabled,
                ..Default::default()
            })
            .unwrap()
            .detect(&model)
            .unwrap()
            .marks()
            .to_vec()
        };
        let mut previous = usize::MAX;
        for d in 0..=6 {
            let marks = run(d as f64);
            assert!(marks.len() <= previous, "min_distance {d}: {marks:?}");
            previous = marks.len();
        }
        assert_eq!(run(2.0), vec![GridIndex::new(0, 3)]);
        assert_eq!(run(3.0), vec![GridIndex::new(0, 3)]);
        // (4, 1) only touches the plateau at radius 2.
        assert_eq!(run(1.0), vec![GridIndex::new(0, 3), GridIndex::new(4, 1)]);
    }

    #[test]
    fn test_threshold_filters_low_peaks() {
        let model = with_peaks(9, 9, &[(2, 2, 10.0), (6, 6, 3.0)]);
        let det = FixedWindowMaxima::new(FixedWindowParams {
            threshold_abs: Some(5.0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(det.detect(&model).unwrap().marks(), &[GridIndex::new(2, 2)]);
        assert_eq!(fixed(1.0).detect(&model).unwrap().len(), 2);
    }

    #[test]
    fn test_border_exclusion_modes() {
        let model = with_peaks(8, 8, &[(0, 4, 9.0), (4, 4, 7.0), (1, 1, 5.0)]);
        let run = |exclude_border| {
            FixedWindowMaxima::new(FixedWindowParams {
                exclude_border,
                ..Default::default()
            })
            .unwrap()
            .detect(&model)
            .unwrap()
            .marks()
            .to_vec()
        };
        assert_eq!(
            run(BorderExclusion::Disabled),
            vec![GridIndex::new(0, 4), GridIndex::new(1, 1), GridIndex::new(4, 4)]
        );
        assert_eq!(
            run(BorderExclusion::MinDistance),
            vec![GridIndex::new(1, 1), GridIndex::new(4, 4)]
        );
        assert_eq!(run(BorderExclusion::Margin(2.0)), vec![GridIndex::new(4, 4)]);
    }

    #[test]
    fn test_max_peaks_keeps_tallest_with_position_ties() {
        let model = with_peaks(
            10,
            10,
            &[(2, 2, 5.0), (2, 6, 9.0), (6, 2, 9.0), (6, 6, 9.0)],
        );
        let det = FixedWindowMaxima::new(FixedWindowParams {
            max_peaks: PeakLimit::AtMost(2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            det.detect(&model).unwrap().marks(),
            &[GridIndex::new(2, 6), GridIndex::new(6, 2)]
        );
    }

    #[test]
    fn test_min_distance_suppresses_close_peaks() {
        let model = with_peaks(13, 13, &[(6, 4, 10.0), (6, 7, 9.0)]);
        assert_eq!(fixed(1.0).detect(&model).unwrap().len(), 2);
        assert_eq!(
            fixed(3.0).detect(&model).unwrap().marks(),
            &[GridIndex::new(6, 4)]
        );
    }

    #[test]
    fn test_negative_parameters_rejected() {
        assert!(matches!(
            FixedWindowMaxima::new(FixedWindowParams {
                min_distance: -1.0,
                ..Default::default()
            }),
            Err(TreeSegError::ParameterOutOfRange { name: "min_distance", .. })
        ));
        assert!(FixedWindowMaxima::new(FixedWindowParams {
            threshold_abs: Some(-1.0),
            ..Default::default()
        })
        .is_err());
        assert!(FixedWindowMaxima::new(FixedWindowParams {
            exclude_border: BorderExclusion::Margin(-0.5),
            ..Default::default()
        })
        .is_err());
        assert!(VariableWindowMaxima::new(VariableWindowParams {
            min_distance: f64::NAN,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_detect_without_affine_fails() {
        let model = HeightModel::filled(4, 4, 1.0).unwrap();
        assert!(matches!(
            fixed(1.0).detect(&model),
            Err(TreeSegError::InvalidGeoreference { .. })
        ));
        let vw = VariableWindowMaxima::new(VariableWindowParams::default()).unwrap();
        assert!(vw.detect(&model).is_err());
    }

    #[test]
    fn test_variable_window_suppresses_subordinate_peak() {
        let model = with_peaks(10, 10, &[(1, 1, 20.0), (1, 2, 5.0)]);
        let vw = VariableWindowMaxima::new(VariableWindowParams::default()).unwrap();
        assert_eq!(vw.detect(&model).unwrap().marks(), &[GridIndex::new(1, 1)]);
    }

    #[test]
    fn test_variable_window_allometric_suppression() {
        // 2 cells apart: both survive the 3x3 candidate filter, but the
        // 15 m peak's own window (2.21 + 0.01022 * 225 ≈ 4.5 m → ±2 cells)
        // reaches the 20 m apex.
        let model = with_peaks(12, 12, &[(5, 3, 20.0), (5, 5, 15.0)]);
        let vw = VariableWindowMaxima::new(VariableWindowParams::default()).unwrap();
        assert_eq!(vw.detect(&model).unwrap().marks(), &[GridIndex::new(5, 3)]);
        // Small constant window: both survive.
        let narrow = VariableWindowMaxima::new(VariableWindowParams {
            allometry: Allometry::from_fn(|_| 1.0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(narrow.detect(&model).unwrap().len(), 2);
    }

    #[test]
    fn test_variable_window_degenerate_width() {
        let model = with_peaks(5, 5, &[(2, 2, 6.0)]);
        let vw = VariableWindowMaxima::new(VariableWindowParams {
            allometry: Allometry::from_fn(|_| f64::NAN),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(vw.detect(&model).unwrap().marks(), &[GridIndex::new(2, 2)]);
        assert_eq!(window_half_size(-3.0, 1.0), 0);
        assert_eq!(window_half_size(6.3, 1.0), 3);
        assert_eq!(window_half_size(2.9, 1.0), 1);
    }

    #[test]
    fn test_allometry_default() {
        let a = Allometry::default();
        assert!((a.window_width(10.0) - (2.21 + 1.022)).abs() < 1e-12);
    }

    #[test]
    fn test_from_marks_bounds_checked() {
        let model = unit_model(3, 3, vec![0.0; 9]);
        assert!(DetectionResult::from_marks(&model, [GridIndex::new(3, 0)]).is_err());
        let r = DetectionResult::from_marks(
            &model,
            [GridIndex::new(2, 1), GridIndex::new(0, 0), GridIndex::new(2, 1)],
        )
        .unwrap();
        assert_eq!(r.marks(), &[GridIndex::new(0, 0), GridIndex::new(2, 1)]);
        assert!(r.contains(GridIndex::new(2, 1)));
        let mask = r.mask();
        assert_eq!(mask.iter().filter(|m| **m).count(), 2);
        assert!(mask[7]);
    }

    #[test]
    fn test_coordinates_use_cell_centres() {
        let model = with_peaks(5, 5, &[(2, 2, 10.0)]);
        let result = fixed(1.0).detect(&model).unwrap();
        assert_eq!(result.coordinates().unwrap(), vec![GeoPoint::new(2.5, 2.5)]);
    }
}
