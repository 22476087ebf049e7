//! Error type shared by every stage of the pipeline.

use thiserror::Error;

/// Failures raised while building detectors or converting physical units.
///
/// Sparse or uniform input never produces an error: an empty detection set or
/// a segmentation with fewer than two distinct seeds is returned as a valid,
/// empty result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeSegError {
    /// The affine transform is missing or cannot map physical units to cells.
    #[error("invalid georeference: {reason}")]
    InvalidGeoreference { reason: String },

    /// A detector or segmenter parameter is outside its admissible range.
    #[error("parameter `{name}` out of range ({value}): {reason}")]
    ParameterOutOfRange {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// The height array does not hold `nrow × ncol` samples.
    #[error("height array holds {actual} samples, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// A mark lies outside the height model it is attached to.
    #[error("cell ({row}, {col}) is outside a {nrow}x{ncol} grid")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        nrow: usize,
        ncol: usize,
    },
}

impl TreeSegError {
    pub(crate) fn georeference(reason: impl Into<String>) -> Self {
        Self::InvalidGeoreference {
            reason: reason.into(),
        }
    }
}
