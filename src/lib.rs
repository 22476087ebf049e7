//! # treeseg: tree apex detection and crown partitioning
//!
//! Locates individual tree tops in a canopy height raster and partitions the
//! canopy around them.
//!
//! Pipeline: [`HeightModel`] → [`FixedWindowMaxima`] | [`VariableWindowMaxima`]
//! → [`DetectionResult`] → [`VoronoiSegmenter`] → [`SegmentationResult`].
//!
//! ```no_run
//! use treeseg::{
//!     Affine, HeightModel, MaximaDetector, VariableWindowMaxima, VariableWindowParams,
//!     VoronoiSegmenter,
//! };
//!
//! # fn main() -> treeseg::Result<()> {
//! let chm = HeightModel::new(2, 2, vec![0.0, 12.0, 3.0, 1.0])?
//!     .with_affine(Affine::north_up(500_000.0, 6_400_000.0, 0.5, 0.5))?;
//! let tops = VariableWindowMaxima::new(VariableWindowParams::default())?.detect(&chm)?;
//! let crowns = VoronoiSegmenter::default().segment(&tops)?;
//! println!("{} tops, {} crowns", tops.len(), crowns.len());
//! # Ok(())
//! # }
//! ```
//!
//! Raster loading and plotting are left to the host application; the
//! `treeseg` binary (feature `cli`) shows a GeoTIFF → CSV pipeline.

pub mod error;
pub mod filter;
mod geometry;
mod params;
pub mod projection;
pub mod raster;
pub mod segmentation;
pub mod tree_detection;

pub use error::TreeSegError;
pub use projection::{CoordinateProjector, GeoPoint};
pub use raster::{Affine, BoundingBox, GridIndex, HeightModel};
pub use segmentation::{
    Crown, DuplicatePoints, HullCells, Polygon, SegmentationResult, VoronoiParams,
    VoronoiSegmenter,
};
pub use tree_detection::{
    Allometry, BorderExclusion, DetectionResult, FixedWindowMaxima, FixedWindowParams,
    MaximaDetector, PeakLimit, VariableWindowMaxima, VariableWindowParams,
};

pub type Result<T> = std::result::Result<T, TreeSegError>;
