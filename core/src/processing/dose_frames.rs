use crate::math::fft::FftHelper;
use crate::math::frequency::frequency_grid_2d;
use crate::prelude::{StageError, StageResult};
use crate::processing::exposure::{exposure_kernel, DoseFilterParams};
use log::debug;
use ndarray::{Array2, ArrayView3, Zip};
use num_complex::Complex64;

/// Exposure filters the raw frames of one tilt and sums them into one image.
///
/// Frame `i` (counting from one) is filtered at `initial_dose + dose_per_frame * i`.
/// The weighted sum of spectra is then multiplied by
/// `k_first / sqrt(mean(k_i^2))`, so the summed image carries no more
/// high-resolution signal than the first, least exposed frame.
pub fn dose_filter_frames(
    frames: ArrayView3<f32>,
    pixelsize: f64,
    initial_dose: f64,
    dose_per_frame: f64,
    params: &DoseFilterParams,
) -> StageResult<Array2<f32>> {
    let (count, rows, cols) = frames.dim();
    if count == 0 {
        return Err(StageError::Config("frame stack holds no frames".into()));
    }

    let frequencies = frequency_grid_2d((rows, cols), pixelsize)?;
    let mut fft = FftHelper::new((rows, cols));

    let mut weighted = Array2::<Complex64>::zeros((rows, cols));
    let mut first_kernel = Array2::<f64>::zeros((rows, cols));
    let mut sum_of_squares = Array2::<f64>::zeros((rows, cols));

    for (index, frame) in frames.outer_iter().enumerate() {
        let dose = initial_dose + dose_per_frame * (index + 1) as f64;
        let kernel = exposure_kernel(&frequencies, dose, params);
        let spectrum = fft.forward(frame);

        Zip::from(&mut weighted)
            .and(&spectrum)
            .and(&kernel)
            .for_each(|acc, &value, &weight| *acc += value * weight);
        sum_of_squares.zip_mut_with(&kernel, |acc, &weight| *acc += weight * weight);
        if index == 0 {
            first_kernel = kernel;
        }
        debug!("frame {} of {} filtered at {:.2} e/A^2", index + 1, count, dose);
    }

    let reweight = Zip::from(&first_kernel)
        .and(&sum_of_squares)
        .map_collect(|&first, &squares| {
            let rms = (squares / count as f64).sqrt();
            if rms > 0.0 {
                first / rms
            } else {
                0.0
            }
        });
    weighted.zip_mut_with(&reweight, |value, &weight| *value *= weight);

    Ok(fft.inverse_real(weighted))
}
