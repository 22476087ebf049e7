//! Raster index ↔ geographic coordinate conversion.
//!
//! Cell (row, col) maps to the centre of the cell:
//!   x = origin_x + (col + 0.5) * cell_size_x
//!   y = origin_y - (row + 0.5) * cell_size_y

use std::ops::{Add, Mul, Sub};

use crate::error::TreeSegError;
use crate::raster::{Affine, GridIndex};
use crate::Result;

/// A geographic (x, y) position in the raster's CRS.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeoPoint {
    pub x: f64,
    pub y: f64,
}

impl GeoPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn dot(self, other: GeoPoint) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn distance2(self, other: GeoPoint) -> f64 {
        let d = self - other;
        d.dot(d)
    }
}

impl Add for GeoPoint {
    type Output = GeoPoint;
    fn add(self, rhs: GeoPoint) -> GeoPoint {
        GeoPoint::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for GeoPoint {
    type Output = GeoPoint;
    fn sub(self, rhs: GeoPoint) -> GeoPoint {
        GeoPoint::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for GeoPoint {
    type Output = GeoPoint;
    fn mul(self, rhs: f64) -> GeoPoint {
        GeoPoint::new(self.x * rhs, self.y * rhs)
    }
}

/// Converts cell indices to cell-centre coordinates.
///
/// Built from a validated [`Affine`]; holds only the four numbers the
/// north-up mapping needs, so it is `Copy` and cheap to share across threads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateProjector {
    origin_x: f64,
    origin_y: f64,
    cell_size_x: f64,
    cell_size_y: f64,
}

impl CoordinateProjector {
    pub fn new(affine: &Affine) -> Result<Self> {
        affine.validate()?;
        Ok(Self {
            origin_x: affine.c,
            origin_y: affine.f,
            cell_size_x: affine.cell_size_x(),
            cell_size_y: affine.cell_size_y(),
        })
    }

    pub fn cell_size_x(&self) -> f64 {
        self.cell_size_x
    }

    pub fn cell_size_y(&self) -> f64 {
        self.cell_size_y
    }

    #[inline]
    pub fn project(&self, index: GridIndex) -> GeoPoint {
        GeoPoint::new(
            index.col as f64 * self.cell_size_x + self.origin_x + self.cell_size_x / 2.0,
            self.origin_y - index.row as f64 * self.cell_size_y - self.cell_size_y / 2.0,
        )
    }

    /// Project a batch of indices, preserving order.
    pub fn project_batch(&self, indices: &[GridIndex]) -> Vec<GeoPoint> {
        indices.iter().map(|&i| self.project(i)).collect()
    }

    /// Project parallel row / column arrays.
    pub fn project_rows_cols(&self, rows: &[usize], cols: &[usize]) -> Result<Vec<GeoPoint>> {
        if rows.len() != cols.len() {
            return Err(TreeSegError::ShapeMismatch {
                expected: rows.len(),
                actual: cols.len(),
            });
        }
        Ok(rows
            .iter()
            .zip(cols)
            .map(|(&row, &col)| self.project(GridIndex::new(row, col)))
            .collect())
    }

    /// Signed (row, col) of the cell containing `point`. May lie outside the grid.
    pub fn nearest_index(&self, point: GeoPoint) -> (isize, isize) {
        let col = ((point.x - self.origin_x) / self.cell_size_x).floor();
        let row = ((self.origin_y - point.y) / self.cell_size_y).floor();
        (row as isize, col as isize)
    }
}
