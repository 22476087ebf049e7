//! Voronoi partition of the canopy around detected apices.
//!
//! Each seed's cell is the working square cut by the perpendicular bisectors
//! of its neighbours, visited nearest first through an R-tree. Coordinates are
//! recentred on the raster midpoint while cells are built.
//!
//! A seed on the convex hull of the seed set has an unbounded cell. Such
//! cells are dropped by default, so only interior seeds get a crown; this is
//! a boundary limitation, not an error. [`HullCells::CloseAtExtent`] closes
//! them against the raster extent instead.

use log::{debug, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;

use crate::geometry::{
    clip_bisector, clip_to_rect, convex_hull, rect_ring, signed_area, strictly_inside,
};
use crate::projection::GeoPoint;
use crate::raster::BoundingBox;
use crate::tree_detection::DetectionResult;
use crate::Result;

/// Working square half-size, as a multiple of the seed/extent span.
const WORK_SCALE: f64 = 1.0e4;
/// Relative length tolerance.
const REL_TOL: f64 = 1.0e-12;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Closed counter-clockwise ring of geographic points.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<GeoPoint>,
}

impl Polygon {
    /// Close an open ring. Consecutive vertices closer than `tol` are merged;
    /// rings that collapse below three vertices or to no area give `None`.
    fn from_open_ring(points: Vec<GeoPoint>, tol: f64) -> Option<Self> {
        let tol2 = tol * tol;
        let mut ring: Vec<GeoPoint> = Vec::with_capacity(points.len() + 1);
        for p in points {
            if ring.last().map_or(true, |last| last.distance2(p) > tol2) {
                ring.push(p);
            }
        }
        while ring.len() > 1 && ring[0].distance2(ring[ring.len() - 1]) <= tol2 {
            ring.pop();
        }
        if ring.len() < 3 {
            return None;
        }
        let area = signed_area(&ring);
        if area.abs() <= tol2 {
            return None;
        }
        if area < 0.0 {
            ring.reverse();
        }
        ring.push(ring[0]);
        Some(Self { ring })
    }

    /// Vertices; the last equals the first.
    pub fn exterior(&self) -> &[GeoPoint] {
        &self.ring
    }

    pub fn area(&self) -> f64 {
        signed_area(&self.ring[..self.ring.len() - 1])
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, p: GeoPoint) -> bool {
        let mut inside = false;
        for w in self.ring.windows(2) {
            let (a, b) = (w[0], w[1]);
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Well-known-text rendering, millimetre precision for metric CRSs.
    pub fn to_wkt(&self) -> String {
        let coords: Vec<String> = self
            .ring
            .iter()
            .map(|p| format!("{:.3} {:.3}", p.x, p.y))
            .collect();
        format!("POLYGON(({}))", coords.join(","))
    }
}

/// One crown: the cell of a single seed.
#[derive(Debug, Clone, PartialEq)]
pub struct Crown {
    /// Index of the seed (detection mark order, or input order).
    pub seed: usize,
    pub apex: GeoPoint,
    pub polygon: Polygon,
}

/// Output of [`VoronoiSegmenter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentationResult {
    crowns: Vec<Crown>,
    degenerate: Vec<usize>,
    crs: Option<String>,
}

impl SegmentationResult {
    /// Crowns in seed order.
    pub fn crowns(&self) -> &[Crown] {
        &self.crowns
    }

    pub fn into_crowns(self) -> Vec<Crown> {
        self.crowns
    }

    /// Seeds coincident with an earlier seed, when reported.
    pub fn degenerate(&self) -> &[usize] {
        &self.degenerate
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    pub fn len(&self) -> usize {
        self.crowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crowns.is_empty()
    }

    pub fn polygons(&self) -> impl Iterator<Item = &Polygon> {
        self.crowns.iter().map(|c| &c.polygon)
    }

    pub fn total_area(&self) -> f64 {
        self.polygons().map(Polygon::area).sum()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Handling of seeds on the convex hull, whose cells are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HullCells {
    #[default]
    Drop,
    /// Close the cell against the raster extent.
    CloseAtExtent,
}

/// Handling of seeds sharing the exact same position.
///
/// In both modes the shared cell goes to the lowest-index seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePoints {
    /// Later duplicates are silently dropped.
    #[default]
    Merge,
    /// Later duplicates are listed in [`SegmentationResult::degenerate`].
    Report,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoronoiParams {
    /// Intersect interior cells with the raster extent.
    pub clip_to_extent: bool,
    pub hull_cells: HullCells,
    pub duplicates: DuplicatePoints,
}

impl Default for VoronoiParams {
    fn default() -> Self {
        Self {
            clip_to_extent: true,
            hull_cells: HullCells::Drop,
            duplicates: DuplicatePoints::Merge,
        }
    }
}

// ---------------------------------------------------------------------------
// VoronoiSegmenter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct VoronoiSegmenter {
    params: VoronoiParams,
}

type SeedPoint = GeomWithData<[f64; 2], usize>;

/// Shared, read-only state for building every cell of one run.
struct CellBuilder<'a> {
    seeds: &'a [GeoPoint],
    local: Vec<GeoPoint>,
    origin: GeoPoint,
    tree: RTree<SeedPoint>,
    hull: Vec<GeoPoint>,
    work: BoundingBox,
    extent: BoundingBox,
    tol: f64,
    hull_eps: f64,
}

impl VoronoiSegmenter {
    pub fn new(params: VoronoiParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &VoronoiParams {
        &self.params
    }

    /// Partition the raster extent around the marks of `detections`.
    ///
    /// Fails only if the detections' model has no usable georeference.
    pub fn segment(&self, detections: &DetectionResult<'_>) -> Result<SegmentationResult> {
        let seeds = detections.coordinates()?;
        let extent = detections.bounding_box()?;
        Ok(self.segment_points(&seeds, &extent, detections.crs().map(str::to_owned)))
    }

    /// Partition `extent` around arbitrary geographic seeds.
    pub fn segment_points(
        &self,
        seeds: &[GeoPoint],
        extent: &BoundingBox,
        crs: Option<String>,
    ) -> SegmentationResult {
        let (unique, duplicates) = split_duplicates(seeds);
        let degenerate = match self.params.duplicates {
            DuplicatePoints::Merge => Vec::new(),
            DuplicatePoints::Report => duplicates,
        };
        if unique.len() < 2 {
            debug!("voronoi: {} distinct seed(s), nothing to partition", unique.len());
            return SegmentationResult {
                crowns: Vec::new(),
                degenerate,
                crs,
            };
        }

        let builder = CellBuilder::new(seeds, &unique, extent);

        #[cfg(feature = "parallel")]
        let cells: Vec<Option<Crown>> = unique
            .par_iter()
            .map(|&seed| builder.crown(seed, &self.params))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let cells: Vec<Option<Crown>> = unique
            .iter()
            .map(|&seed| builder.crown(seed, &self.params))
            .collect();

        let crowns: Vec<Crown> = cells.into_iter().flatten().collect();
        debug!(
            "voronoi: seeds={} distinct={} crowns={}",
            seeds.len(),
            unique.len(),
            crowns.len()
        );
        SegmentationResult {
            crowns,
            degenerate,
            crs,
        }
    }
}

/// Split seed indices into first occurrences (ascending) and later
/// duplicates of an identical position (ascending).
fn split_duplicates(seeds: &[GeoPoint]) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..seeds.len()).collect();
    order.sort_by(|&a, &b| {
        seeds[a]
            .x
            .total_cmp(&seeds[b].x)
            .then(seeds[a].y.total_cmp(&seeds[b].y))
            .then(a.cmp(&b))
    });
    let mut unique = Vec::with_capacity(seeds.len());
    let mut duplicates = Vec::new();
    for (k, &i) in order.iter().enumerate() {
        if k > 0 && seeds[order[k - 1]] == seeds[i] {
            duplicates.push(i);
        } else {
            unique.push(i);
        }
    }
    unique.sort_unstable();
    duplicates.sort_unstable();
    (unique, duplicates)
}

fn max_distance2(site: GeoPoint, ring: &[GeoPoint]) -> f64 {
    ring.iter()
        .map(|&v| site.distance2(v))
        .fold(0.0, f64::max)
}

impl<'a> CellBuilder<'a> {
    fn new(seeds: &'a [GeoPoint], unique: &[usize], extent: &BoundingBox) -> Self {
        let origin = extent.center();
        let local: Vec<GeoPoint> = seeds.iter().map(|&p| p - origin).collect();
        let extent = extent.translate(origin);

        let distinct: Vec<GeoPoint> = unique.iter().map(|&i| local[i]).collect();
        let (mut min_x, mut min_y) = (extent.min_x, extent.min_y);
        let (mut max_x, mut max_y) = (extent.max_x, extent.max_y);
        for p in &distinct {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        let span = (max_x - min_x).max(max_y - min_y).max(f64::MIN_POSITIVE);
        let reach = span * WORK_SCALE;
        let work = BoundingBox::new(min_x - reach, min_y - reach, max_x + reach, max_y + reach);

        let tree = RTree::bulk_load(
            unique
                .iter()
                .map(|&i| SeedPoint::new([local[i].x, local[i].y], i))
                .collect(),
        );

        Self {
            seeds,
            local,
            origin,
            tree,
            hull: convex_hull(&distinct),
            work,
            extent,
            tol: span * REL_TOL,
            hull_eps: span * span * REL_TOL,
        }
    }

    /// Cell of `seed` inside the working square.
    fn cell(&self, seed: usize) -> Vec<GeoPoint> {
        let site = self.local[seed];
        let mut cell = rect_ring(&self.work);
        let mut reach2 = max_distance2(site, &cell);
        for neighbour in self.tree.nearest_neighbor_iter(&[site.x, site.y]) {
            if neighbour.data == seed {
                continue;
            }
            let other = self.local[neighbour.data];
            // a bisector farther than the farthest vertex cannot cut the cell
            if site.distance2(other) > 4.0 * reach2 {
                break;
            }
            cell = clip_bisector(&cell, site, other);
            if cell.is_empty() {
                break;
            }
            reach2 = max_distance2(site, &cell);
        }
        cell
    }

    fn touches_work(&self, ring: &[GeoPoint]) -> bool {
        let w = &self.work;
        ring.iter().any(|v| {
            (v.x - w.min_x).abs() <= self.tol
                || (v.x - w.max_x).abs() <= self.tol
                || (v.y - w.min_y).abs() <= self.tol
                || (v.y - w.max_y).abs() <= self.tol
        })
    }

    fn crown(&self, seed: usize, params: &VoronoiParams) -> Option<Crown> {
        let bounded = strictly_inside(&self.hull, self.local[seed], self.hull_eps);
        if !bounded && params.hull_cells == HullCells::Drop {
            return None;
        }
        let mut ring = self.cell(seed);
        if bounded && self.touches_work(&ring) {
            warn!("voronoi: interior seed {seed} has a numerically unbounded cell, dropped");
            return None;
        }
        if !bounded || params.clip_to_extent {
            ring = clip_to_rect(&ring, &self.extent);
        }
        let ring: Vec<GeoPoint> = ring.into_iter().map(|p| p + self.origin).collect();
        let polygon = Polygon::from_open_ring(ring, self.tol)?;
        Some(Crown {
            seed,
            apex: self.seeds[seed],
            polygon,
        })
    }
}
