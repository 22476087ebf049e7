//! Canopy height raster with its affine georeference.

use std::ops::Index;

use crate::error::TreeSegError;
use crate::projection::{CoordinateProjector, GeoPoint};
use crate::Result;

/// Integer position of a cell, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridIndex {
    pub row: usize,
    pub col: usize,
}

impl GridIndex {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Six-coefficient affine transform in `(a, b, c, d, e, f)` order:
///
/// ```text
/// x = a * col + b * row + c
/// y = d * col + e * row + f
/// ```
///
/// `a` is the pixel width, `e` the pixel height (negative for north-up
/// rasters), `c`/`f` the coordinates of the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Affine {
    pub const fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// North-up transform from the top-left corner and positive cell sizes.
    pub fn north_up(origin_x: f64, origin_y: f64, cell_size_x: f64, cell_size_y: f64) -> Self {
        Self::new(cell_size_x, 0.0, origin_x, 0.0, -cell_size_y.abs(), origin_y)
    }

    /// Build from a GDAL geotransform `(c, a, b, f, d, e)`.
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self::new(gt[1], gt[2], gt[0], gt[4], gt[5], gt[3])
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.c, self.a, self.b, self.f, self.d, self.e]
    }

    /// Horizontal cell size (pixel width).
    pub fn cell_size_x(&self) -> f64 {
        self.a
    }

    /// Vertical cell size as a magnitude.
    pub fn cell_size_y(&self) -> f64 {
        self.e.abs()
    }

    /// Checks that the transform can map physical units onto cells.
    pub fn validate(&self) -> Result<()> {
        let coefficients = [self.a, self.b, self.c, self.d, self.e, self.f];
        if coefficients.iter().any(|v| !v.is_finite()) {
            return Err(TreeSegError::georeference("affine has non-finite coefficients"));
        }
        if self.a <= 0.0 {
            return Err(TreeSegError::georeference(format!(
                "pixel width must be strictly positive, got {}",
                self.a
            )));
        }
        if self.e == 0.0 {
            return Err(TreeSegError::georeference("pixel height is zero"));
        }
        if self.b != 0.0 || self.d != 0.0 {
            return Err(TreeSegError::georeference(format!(
                "rotated grids are not supported (b = {}, d = {})",
                self.b, self.d
            )));
        }
        Ok(())
    }
}

/// Axis-aligned geographic rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Same rectangle shifted by `-offset`.
    pub fn translate(&self, offset: GeoPoint) -> Self {
        Self {
            min_x: self.min_x - offset.x,
            min_y: self.min_y - offset.y,
            max_x: self.max_x - offset.x,
            max_y: self.max_y - offset.y,
        }
    }
}

/// A canopy height raster (row-major, origin top-left) with an optional
/// affine georeference and CRS descriptor.
///
/// NaN samples are no-data. The model is immutable once built: detectors and
/// the segmenter only ever borrow it.
#[derive(Debug, Clone)]
pub struct HeightModel {
    nrow: usize,
    ncol: usize,
    data: Vec<f64>,
    affine: Option<Affine>,
    crs: Option<String>,
}

impl HeightModel {
    /// Wrap a row-major array of `nrow × ncol` heights.
    pub fn new(nrow: usize, ncol: usize, data: Vec<f64>) -> Result<Self> {
        let expected = cell_count(nrow, ncol, data.len())?;
        if data.len() != expected {
            return Err(TreeSegError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            nrow,
            ncol,
            data,
            affine: None,
            crs: None,
        })
    }

    /// A model filled with a constant value.
    pub fn filled(nrow: usize, ncol: usize, fill: f64) -> Result<Self> {
        let len = cell_count(nrow, ncol, 0)?;
        Self::new(nrow, ncol, vec![fill; len])
    }

    /// Attach a georeference. Fails if the transform is degenerate.
    pub fn with_affine(mut self, affine: Affine) -> Result<Self> {
        affine.validate()?;
        self.affine = Some(affine);
        Ok(self)
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    pub fn nrow(&self) -> usize {
        self.nrow
    }

    pub fn ncol(&self) -> usize {
        self.ncol
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn affine(&self) -> Option<&Affine> {
        self.affine.as_ref()
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value at (row, col), NaN if out of bounds.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        if row < self.nrow && col < self.ncol {
            self.data[row * self.ncol + col]
        } else {
            f64::NAN
        }
    }

    pub fn contains_index(&self, index: GridIndex) -> bool {
        index.row < self.nrow && index.col < self.ncol
    }

    /// Smallest non-NaN height.
    pub fn min_value(&self) -> Option<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .min_by(f64::total_cmp)
    }

    fn require_affine(&self) -> Result<&Affine> {
        self.affine
            .as_ref()
            .ok_or_else(|| TreeSegError::georeference("height model has no affine transform"))
    }

    /// Pixel width in map units.
    pub fn cell_size_x(&self) -> Result<f64> {
        Ok(self.require_affine()?.cell_size_x())
    }

    /// Pixel height magnitude in map units.
    pub fn cell_size_y(&self) -> Result<f64> {
        Ok(self.require_affine()?.cell_size_y())
    }

    pub fn projector(&self) -> Result<CoordinateProjector> {
        CoordinateProjector::new(self.require_affine()?)
    }

    /// Geographic extent of the whole raster (cell edges, not centres).
    pub fn bounding_box(&self) -> Result<BoundingBox> {
        let affine = self.require_affine()?;
        let x0 = affine.c;
        let y0 = affine.f;
        let x1 = x0 + self.ncol as f64 * affine.cell_size_x();
        let y1 = y0 - self.nrow as f64 * affine.cell_size_y();
        Ok(BoundingBox::new(x0, y1, x1, y0))
    }

    /// Cell whose centre is nearest to `point`, `None` outside the raster.
    pub fn index_of(&self, point: GeoPoint) -> Result<Option<GridIndex>> {
        let (row, col) = self.projector()?.nearest_index(point);
        if row < 0 || col < 0 {
            return Ok(None);
        }
        let index = GridIndex::new(row as usize, col as usize);
        Ok(self.contains_index(index).then_some(index))
    }
}

/// `nrow × ncol`, or `ShapeMismatch` when the product does not fit in `usize`.
fn cell_count(nrow: usize, ncol: usize, actual: usize) -> Result<usize> {
    nrow.checked_mul(ncol).ok_or(TreeSegError::ShapeMismatch {
        expected: usize::MAX,
        actual,
    })
}

impl Index<(usize, usize)> for HeightModel {
    type Output = f64;
    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r * self.ncol + c]
    }
}

impl Index<GridIndex> for HeightModel {
    type Output = f64;
    fn index(&self, index: GridIndex) -> &f64 {
        &self.data[index.row * self.ncol + index.col]
    }
}
