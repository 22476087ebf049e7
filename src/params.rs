//! Parameter validation and physical → pixel conversion shared by the detectors.

use crate::error::TreeSegError;
use crate::raster::HeightModel;
use crate::Result;

/// Accept finite values `>= 0`.
pub(crate) fn non_negative(name: &'static str, value: f64) -> Result<f64> {
    if !value.is_finite() {
        return Err(TreeSegError::ParameterOutOfRange {
            name,
            value,
            reason: "must be finite",
        });
    }
    if value < 0.0 {
        return Err(TreeSegError::ParameterOutOfRange {
            name,
            value,
            reason: "must not be negative",
        });
    }
    Ok(value)
}

pub(crate) fn optional_non_negative(name: &'static str, value: Option<f64>) -> Result<()> {
    if let Some(v) = value {
        non_negative(name, v)?;
    }
    Ok(())
}

/// Whole number of cells covered by a physical distance: `floor(distance / cell_size_x)`.
pub(crate) fn pixel_distance(model: &HeightModel, distance: f64) -> Result<usize> {
    let cell = model.cell_size_x()?;
    let pixels = (distance / cell).floor();
    if !pixels.is_finite() || pixels < 0.0 {
        return Err(TreeSegError::georeference(format!(
            "cannot convert distance {distance} with cell size {cell} to pixels"
        )));
    }
    Ok(pixels as usize)
}

/// Lower bound a candidate height must satisfy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum HeightFloor {
    /// `height >= value`
    AtLeast(f64),
    /// `height > value`
    Above(f64),
    Any,
}

impl HeightFloor {
    #[inline]
    pub(crate) fn admits(&self, height: f64) -> bool {
        match *self {
            HeightFloor::AtLeast(t) => height >= t,
            HeightFloor::Above(t) => height > t,
            HeightFloor::Any => !height.is_nan(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Affine;

    #[test]
    fn test_non_negative() {
        assert_eq!(non_negative("d", 0.0), Ok(0.0));
        assert!(non_negative("d", -0.1).is_err());
        assert!(non_negative("d", f64::NAN).is_err());
        assert!(non_negative("d", f64::INFINITY).is_err());
        assert!(optional_non_negative("t", None).is_ok());
        assert!(optional_non_negative("t", Some(-2.0)).is_err());
    }

    #[test]
    fn test_pixel_distance_floors() {
        let model = HeightModel::filled(3, 3, 0.0)
            .unwrap()
            .with_affine(Affine::north_up(0.0, 3.0, 0.5, 0.5))
            .unwrap();
        assert_eq!(pixel_distance(&model, 1.0), Ok(2));
        assert_eq!(pixel_distance(&model, 1.49), Ok(2));
        assert_eq!(pixel_distance(&model, 0.4), Ok(0));
    }

    #[test]
    fn test_pixel_distance_without_affine() {
        let model = HeightModel::filled(3, 3, 0.0).unwrap();
        assert!(matches!(
            pixel_distance(&model, 1.0),
            Err(TreeSegError::InvalidGeoreference { .. })
        ));
    }

    #[test]
    fn test_height_floor() {
        assert!(HeightFloor::AtLeast(2.0).admits(2.0));
        assert!(!HeightFloor::Above(2.0).admits(2.0));
        assert!(HeightFloor::Any.admits(-5.0));
        assert!(!HeightFloor::Any.admits(f64::NAN));
        assert!(!HeightFloor::AtLeast(2.0).admits(f64::NAN));
    }
}
