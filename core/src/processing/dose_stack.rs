use crate::math::fft::FftHelper;
use crate::math::frequency::frequency_grid_2d;
use crate::prelude::{StageError, StageResult};
use crate::processing::exposure::{exposure_kernel, DoseFilterParams};
use log::debug;
use ndarray::{Array3, ArrayView3};

/// Low-pass filters every image of a summed tilt stack by its own dose.
///
/// `stack` is slice-first, `(images, rows, cols)`, and `doses` holds the
/// cumulative dose of each image in stack order. No spectral reweighting is
/// done; the images keep their individual attenuation.
pub fn dose_filter_stack(
    stack: ArrayView3<f32>,
    pixelsize: f64,
    doses: &[f64],
    params: &DoseFilterParams,
) -> StageResult<Array3<f32>> {
    let (count, rows, cols) = stack.dim();
    if doses.len() != count {
        return Err(StageError::Config(format!(
            "stack holds {} images but the dose list has {} entries",
            count,
            doses.len()
        )));
    }

    let mut output = Array3::<f32>::zeros((count, rows, cols));
    if count == 0 {
        return Ok(output);
    }

    let frequencies = frequency_grid_2d((rows, cols), pixelsize)?;
    let mut fft = FftHelper::new((rows, cols));

    for (index, ((image, mut filtered), &dose)) in stack
        .outer_iter()
        .zip(output.outer_iter_mut())
        .zip(doses)
        .enumerate()
    {
        let kernel = exposure_kernel(&frequencies, dose, params);
        let mut spectrum = fft.forward(image);
        spectrum.zip_mut_with(&kernel, |value, &weight| *value *= weight);
        filtered.assign(&fft.inverse_real(spectrum));
        debug!("image {} of {} filtered at {:.2} e/A^2", index + 1, count, dose);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn textured(count: usize, rows: usize, cols: usize) -> Array3<f32> {
        Array3::from_shape_fn((count, rows, cols), |(z, r, c)| {
            ((r * 13 + c * 7 + z * 3) % 11) as f32 - 4.0
        })
    }

    #[test]
    fn dose_list_must_match_image_count() {
        let stack = textured(3, 8, 8);
        let params = DoseFilterParams::default();
        for n in 0..6 {
            let doses = vec![10.0; n];
            let result = dose_filter_stack(stack.view(), 1.0, &doses, &params);
            assert_eq!(result.is_err(), n != 3, "dose list length {}", n);
            if n != 3 {
                assert!(matches!(result, Err(StageError::Config(_))));
            }
        }
    }

    #[test]
    fn zero_dose_is_identity() {
        let stack = textured(2, 10, 12);
        let filtered = dose_filter_stack(stack.view(), 2.1, &[0.0, 0.0], &Default::default()).unwrap();
        for (a, b) in stack.iter().zip(filtered.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn flat_image_is_unchanged_at_any_dose() {
        let stack = Array3::from_elem((3, 16, 16), 7.5f32);
        let filtered =
            dose_filter_stack(stack.view(), 1.35, &[5.0, 60.0, 240.0], &Default::default()).unwrap();
        for value in filtered.iter() {
            assert_abs_diff_eq!(*value, 7.5, epsilon = 1e-4);
        }
    }

    #[test]
    fn higher_dose_removes_more_detail() {
        let image = Array2::from_shape_fn((16, 16), |(r, c)| if (r + c) % 2 == 0 { 1.0f32 } else { -1.0 });
        let stack = ndarray::stack![ndarray::Axis(0), image.view(), image.view()];
        let filtered = dose_filter_stack(stack.view(), 1.0, &[5.0, 80.0], &Default::default()).unwrap();
        let energy = |z: usize| filtered.index_axis(ndarray::Axis(0), z).iter().map(|v| v * v).sum::<f32>();
        assert!(energy(1) < energy(0));
    }

    #[test]
    fn empty_stack_with_empty_doses_is_fine() {
        let stack = Array3::<f32>::zeros((0, 4, 4));
        let filtered = dose_filter_stack(stack.view(), 1.0, &[], &Default::default()).unwrap();
        assert_eq!(filtered.dim(), (0, 4, 4));
    }
}
