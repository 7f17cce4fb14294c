use ndarray::{Array2, ArrayView2, Axis};
use num_complex::Complex64;
use rustfft::{num_traits::Zero, Fft, FftPlanner};
use std::sync::Arc;

/// Planned forward and inverse 2-D transforms for one image shape.
///
/// Rows are transformed first, then columns. The inverse is normalised by
/// `1 / (rows * cols)` so that `inverse_real(forward(x)) == x`.
pub struct FftHelper {
    shape: (usize, usize),
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
    lane: Vec<Complex64>,
    scratch: Vec<Complex64>,
}

impl FftHelper {
    pub fn new(shape: (usize, usize)) -> Self {
        let (rows, cols) = shape;
        let mut planner = FftPlanner::new();
        let row_forward = planner.plan_fft_forward(cols.max(1));
        let row_inverse = planner.plan_fft_inverse(cols.max(1));
        let col_forward = planner.plan_fft_forward(rows.max(1));
        let col_inverse = planner.plan_fft_inverse(rows.max(1));
        let scratch_len = [&row_forward, &row_inverse, &col_forward, &col_inverse]
            .iter()
            .map(|fft| fft.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);
        Self {
            shape,
            row_forward,
            row_inverse,
            col_forward,
            col_inverse,
            lane: Vec::with_capacity(rows.max(cols)),
            scratch: vec![Complex64::zero(); scratch_len],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn forward(&mut self, image: ArrayView2<f32>) -> Array2<Complex64> {
        debug_assert_eq!(image.dim(), self.shape);
        let mut spectrum = Array2::from_shape_fn(self.shape, |idx| {
            Complex64::new(f64::from(image[idx]), 0.0)
        });
        let (rows, cols) = (Arc::clone(&self.row_forward), Arc::clone(&self.col_forward));
        self.process(&mut spectrum, rows.as_ref(), cols.as_ref());
        spectrum
    }

    /// Inverse transform keeping only the real part.
    pub fn inverse_real(&mut self, mut spectrum: Array2<Complex64>) -> Array2<f32> {
        debug_assert_eq!(spectrum.dim(), self.shape);
        let (rows, cols) = (Arc::clone(&self.row_inverse), Arc::clone(&self.col_inverse));
        self.process(&mut spectrum, rows.as_ref(), cols.as_ref());
        let norm = 1.0 / (self.shape.0 * self.shape.1).max(1) as f64;
        spectrum.mapv(|value| (value.re * norm) as f32)
    }

    fn process(&mut self, data: &mut Array2<Complex64>, rows: &dyn Fft<f64>, cols: &dyn Fft<f64>) {
        if data.is_empty() {
            return;
        }
        // Axis(1) lanes are rows, Axis(0) lanes are columns.
        self.process_lanes(data, Axis(1), rows);
        self.process_lanes(data, Axis(0), cols);
    }

    fn process_lanes(&mut self, data: &mut Array2<Complex64>, axis: Axis, fft: &dyn Fft<f64>) {
        for mut lane in data.lanes_mut(axis) {
            self.lane.clear();
            self.lane.extend(lane.iter().copied());
            fft.process_with_scratch(&mut self.lane, &mut self.scratch);
            for (dst, src) in lane.iter_mut().zip(self.lane.iter()) {
                *dst = *src;
            }
        }
    }
}

/// Moves the zero-frequency element from the grid centre to `(0, 0)`.
pub fn ifftshift<T: Copy>(centered: &Array2<T>) -> Array2<T> {
    let (rows, cols) = centered.dim();
    let (dr, dc) = (rows / 2, cols / 2);
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        centered[[(r + dr) % rows, (c + dc) % cols]]
    })
}
