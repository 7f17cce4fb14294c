//! Reciprocal-space distance maps for sampled images and volumes.

use crate::prelude::{StageError, StageResult};
use ndarray::{Array1, Array2, Array3};

/// Frequencies along one axis of length `n`, zero at index `floor(n / 2)`.
fn axis_frequencies(n: usize, pixelsize: f64) -> Array1<f64> {
    let offset = (n / 2) as f64;
    let extent = n as f64 * pixelsize;
    Array1::from_iter((0..n).map(|i| (i as f64 - offset) / extent))
}

fn check_pixelsize(pixelsize: f64) -> StageResult<()> {
    if pixelsize.is_finite() && pixelsize > 0.0 {
        Ok(())
    } else {
        Err(StageError::Config(format!(
            "pixel size must be a positive number of Å, got {}",
            pixelsize
        )))
    }
}

/// Distance from the centred zero frequency, in cycles/Å, for every pixel of
/// a `(rows, cols)` image.
pub fn frequency_grid_2d(shape: (usize, usize), pixelsize: f64) -> StageResult<Array2<f64>> {
    check_pixelsize(pixelsize)?;
    let fr = axis_frequencies(shape.0, pixelsize);
    let fc = axis_frequencies(shape.1, pixelsize);
    Ok(Array2::from_shape_fn(shape, |(r, c)| fr[r].hypot(fc[c])))
}

/// Volume counterpart of [`frequency_grid_2d`].
pub fn frequency_grid_3d(
    shape: (usize, usize, usize),
    pixelsize: f64,
) -> StageResult<Array3<f64>> {
    check_pixelsize(pixelsize)?;
    let fz = axis_frequencies(shape.0, pixelsize);
    let fr = axis_frequencies(shape.1, pixelsize);
    let fc = axis_frequencies(shape.2, pixelsize);
    Ok(Array3::from_shape_fn(shape, |(z, r, c)| {
        (fz[z] * fz[z] + fr[r] * fr[r] + fc[c] * fc[c]).sqrt()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn zero_frequency_sits_at_floor_half() {
        let grid = frequency_grid_2d((6, 5), 2.0).unwrap();
        assert_eq!(grid[[3, 2]], 0.0);
        assert!(grid.iter().all(|&f| f >= 0.0));
    }

    #[test]
    fn axis_spacing_is_one_over_extent() {
        let grid = frequency_grid_2d((4, 8), 1.5).unwrap();
        assert_abs_diff_eq!(grid[[2, 5]], 1.0 / (8.0 * 1.5), epsilon = 1e-12);
        assert_abs_diff_eq!(grid[[0, 4]], 2.0 / (4.0 * 1.5), epsilon = 1e-12);
        // Nyquist corner: half a cycle per pixel on each axis.
        let nyquist = 0.5 / 1.5;
        assert_abs_diff_eq!(grid[[0, 0]], nyquist * 2f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn even_grid_is_symmetric_under_half_turn() {
        for &n in &[2usize, 4, 8, 16] {
            for &pixelsize in &[0.8, 1.0, 3.37] {
                let grid = frequency_grid_2d((n, n), pixelsize).unwrap();
                for r in 1..n {
                    for c in 1..n {
                        assert_abs_diff_eq!(grid[[r, c]], grid[[n - r, n - c]], epsilon = 1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn volume_grid_matches_plane_at_centre_slice() {
        let volume = frequency_grid_3d((4, 6, 6), 2.0).unwrap();
        let plane = frequency_grid_2d((6, 6), 2.0).unwrap();
        for r in 0..6 {
            for c in 0..6 {
                assert_abs_diff_eq!(volume[[2, r, c]], plane[[r, c]], epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(volume[[0, 3, 3]], 2.0 / (4.0 * 2.0), epsilon = 1e-12);
    }

    #[test]
    fn non_positive_pixel_size_is_rejected() {
        assert!(matches!(
            frequency_grid_2d((4, 4), 0.0),
            Err(StageError::Config(_))
        ));
        assert!(frequency_grid_3d((2, 2, 2), f64::NAN).is_err());
    }
}
