//! Square-window maximum filter.
//!
//! Separable: a horizontal pass takes the maximum over each row segment, a
//! vertical pass takes the maximum of those. NaN cells never contribute.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::raster::HeightModel;

/// Treatment of window cells that fall outside the raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterBorder {
    /// Outside cells are ignored (equivalent to nearest-edge padding).
    Nearest,
    /// Outside cells take a constant value.
    Constant(f64),
}

impl FilterBorder {
    #[inline]
    fn pad(self) -> f64 {
        match self {
            FilterBorder::Nearest => f64::NEG_INFINITY,
            FilterBorder::Constant(v) => v,
        }
    }
}

/// Maximum over the `(2 * radius + 1)²` window centred on every cell.
///
/// Windows holding only NaN yield `-inf`. Output is row-major like the input.
pub fn maximum_filter(model: &HeightModel, radius: usize, border: FilterBorder) -> Vec<f64> {
    let (nrow, ncol) = model.shape();
    if model.is_empty() {
        return Vec::new();
    }
    let data = model.data();
    let pad = border.pad();

    let mut horizontal = vec![f64::NEG_INFINITY; nrow * ncol];
    for_each_row(&mut horizontal, ncol, |r, out| {
        let src = &data[r * ncol..(r + 1) * ncol];
        for (c, slot) in out.iter_mut().enumerate() {
            *slot = window_max(src, c, radius, pad);
        }
    });

    let mut filtered = vec![f64::NEG_INFINITY; nrow * ncol];
    for_each_row(&mut filtered, ncol, |r, out| {
        let lo = r.saturating_sub(radius);
        let hi = r.saturating_add(radius).min(nrow - 1);
        let clipped = r < radius || r.saturating_add(radius) >= nrow;
        for (c, slot) in out.iter_mut().enumerate() {
            let mut m = if clipped { pad } else { f64::NEG_INFINITY };
            for rr in lo..=hi {
                let v = horizontal[rr * ncol + c];
                if v > m {
                    m = v;
                }
            }
            *slot = m;
        }
    });

    filtered
}

/// Maximum of `line[center - radius ..= center + radius]`, padding outside.
#[inline]
fn window_max(line: &[f64], center: usize, radius: usize, pad: f64) -> f64 {
    let lo = center.saturating_sub(radius);
    let hi = center.saturating_add(radius).min(line.len() - 1);
    let clipped = center < radius || center.saturating_add(radius) >= line.len();
    let mut m = if clipped { pad } else { f64::NEG_INFINITY };
    for &v in &line[lo..=hi] {
        // NaN compares false and is skipped
        if v > m {
            m = v;
        }
    }
    m
}

#[cfg(feature = "parallel")]
fn for_each_row<F>(buf: &mut [f64], ncol: usize, f: F)
where
    F: Fn(usize, &mut [f64]) + Sync + Send,
{
    buf.par_chunks_mut(ncol)
        .enumerate()
        .for_each(|(r, row)| f(r, row));
}

#[cfg(not(feature = "parallel"))]
fn for_each_row<F>(buf: &mut [f64], ncol: usize, f: F)
where
    F: Fn(usize, &mut [f64]),
{
    buf.chunks_mut(ncol)
        .enumerate()
        .for_each(|(r, row)| f(r, row));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(nrow: usize, ncol: usize, data: Vec<f64>) -> HeightModel {
        HeightModel::new(nrow, ncol, data).unwrap()
    }

    /// Direct 2D evaluation for comparison.
    fn brute_force(m: &HeightModel, radius: usize, border: FilterBorder) -> Vec<f64> {
        let r = radius as isize;
        let mut out = Vec::with_capacity(m.len());
        for row in 0..m.nrow() as isize {
            for col in 0..m.ncol() as isize {
                let mut best = f64::NEG_INFINITY;
                for dr in -r..=r {
                    for dc in -r..=r {
                        let (rr, cc) = (row + dr, col + dc);
                        let inside = rr >= 0
                            && cc >= 0
                            && (rr as usize) < m.nrow()
                            && (cc as usize) < m.ncol();
                        let v = if inside {
                            m.get(rr as usize, cc as usize)
                        } else {
                            border.pad()
                        };
                        if v > best {
                            best = v;
                        }
                    }
                }
                out.push(best);
            }
        }
        out
    }

    #[test]
    fn test_matches_brute_force() {
        let data: Vec<f64> = (0..42)
            .map(|i| ((i * 37 + 11) % 17) as f64 - 4.0)
            .collect();
        let m = model(6, 7, data);
        for radius in 0..4 {
            for border in [FilterBorder::Nearest, FilterBorder::Constant(0.0)] {
                assert_eq!(
                    maximum_filter(&m, radius, border),
                    brute_force(&m, radius, border),
                    "radius {radius}, border {border:?}"
                );
            }
        }
    }

    #[test]
    fn test_constant_padding_masks_negative_border() {
        let m = model(1, 3, vec![-1.0, -2.0, -3.0]);
        assert_eq!(
            maximum_filter(&m, 1, FilterBorder::Constant(0.0)),
            vec![0.0, 0.0, 0.0]
        );
        assert_eq!(
            maximum_filter(&m, 1, FilterBorder::Nearest),
            vec![-1.0, -1.0, -2.0]
        );
    }

    #[test]
    fn test_nan_ignored() {
        let m = model(1, 3, vec![f64::NAN, 1.0, f64::NAN]);
        assert_eq!(maximum_filter(&m, 1, FilterBorder::Nearest), vec![1.0; 3]);
        let m = model(1, 1, vec![f64::NAN]);
        assert_eq!(
            maximum_filter(&m, 0, FilterBorder::Nearest),
            vec![f64::NEG_INFINITY]
        );
    }

    #[test]
    fn test_empty_model() {
        let m = HeightModel::filled(0, 5, 0.0).unwrap();
        assert!(maximum_filter(&m, 2, FilterBorder::Nearest).is_empty());
    }
}
