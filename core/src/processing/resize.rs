//! Canvas resizing for tilt images: symmetric crop or centred padding.

use crate::math::stats::StatsHelper;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::ops::Range;

/// Where the source lands on one axis of the target canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AxisPlacement {
    target: Range<usize>,
    source: Range<usize>,
}

impl AxisPlacement {
    fn new(source_len: usize, target_len: usize) -> Self {
        if source_len >= target_len {
            let offset = (source_len - target_len) / 2;
            Self {
                target: 0..target_len,
                source: offset..offset + target_len,
            }
        } else {
            let offset = (target_len - source_len) / 2;
            Self {
                target: offset..offset + source_len,
                source: 0..source_len,
            }
        }
    }

    /// Index into the placed region of the nearest placed pixel.
    fn clamp(&self, index: usize) -> usize {
        index.clamp(self.target.start, self.target.end - 1) - self.target.start
    }
}

/// Resizes one image to `target = (x, y)` columns and rows.
///
/// Larger sources are cropped about their centre; smaller ones are centred on
/// a canvas filled with the mean of the placed pixels, or, with
/// `edge_padding`, with the nearest edge pixel of the source.
pub fn resize_image(image: ArrayView2<f32>, target: (usize, usize), edge_padding: bool) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let (target_x, target_y) = target;
    if (cols, rows) == (target_x, target_y) {
        return image.to_owned();
    }
    if rows == 0 || cols == 0 || target_x == 0 || target_y == 0 {
        return Array2::zeros((target_y, target_x));
    }

    let y = AxisPlacement::new(rows, target_y);
    let x = AxisPlacement::new(cols, target_x);
    let region = image.slice(s![y.source.clone(), x.source.clone()]);

    if edge_padding {
        Array2::from_shape_fn((target_y, target_x), |(r, c)| region[[y.clamp(r), x.clamp(c)]])
    } else {
        let mut canvas = Array2::from_elem((target_y, target_x), StatsHelper::mean(region));
        canvas
            .slice_mut(s![y.target.clone(), x.target.clone()])
            .assign(&region);
        canvas
    }
}

/// Applies [`resize_image`] to every slice of a `(images, rows, cols)` stack.
pub fn resize_stack(stack: ArrayView3<f32>, target: (usize, usize), edge_padding: bool) -> Array3<f32> {
    let (count, rows, cols) = stack.dim();
    let (target_x, target_y) = target;
    if (cols, rows) == (target_x, target_y) {
        return stack.to_owned();
    }
    let mut resized = Array3::zeros((count, target_y, target_x));
    for (image, mut slot) in stack.axis_iter(Axis(0)).zip(resized.axis_iter_mut(Axis(0))) {
        slot.assign(&resize_image(image, target, edge_padding));
    }
    resized
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ramp(count: usize, rows: usize, cols: usize) -> Array3<f32> {
        Array3::from_shape_fn((count, rows, cols), |(z, r, c)| (z * 100 + r * 10 + c) as f32)
    }

    #[test]
    fn matching_size_is_a_no_op() {
        let stack = ramp(2, 4, 6);
        assert_eq!(resize_stack(stack.view(), (6, 4), false), stack);
    }

    #[test]
    fn crop_keeps_the_centre() {
        let image = Array2::from_shape_fn((6, 6), |(r, c)| (r * 10 + c) as f32);
        let cropped = resize_image(image.view(), (2, 4), false);
        assert_eq!(cropped.dim(), (4, 2));
        assert_eq!(cropped[[0, 0]], 12.0);
        assert_eq!(cropped[[3, 1]], 43.0);
    }

    #[test]
    fn padding_fills_with_placed_mean() {
        let image = array![[1.0f32, 3.0], [5.0, 7.0]];
        let padded = resize_image(image.view(), (4, 4), false);
        assert_eq!(padded[[0, 0]], 4.0);
        assert_eq!(padded[[3, 3]], 4.0);
        assert_eq!(padded[[1, 1]], 1.0);
        assert_eq!(padded[[2, 2]], 7.0);
    }

    #[test]
    fn edge_padding_replicates_outermost_pixels() {
        let image = array![[1.0f32, 2.0], [3.0, 4.0]];
        let padded = resize_image(image.view(), (5, 4), true);
        assert_eq!(padded.dim(), (4, 5));
        // Source occupies rows 1..3 and columns 1..3.
        assert_eq!(padded.row(0).to_vec(), vec![1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(padded.row(3).to_vec(), vec![3.0, 3.0, 4.0, 4.0, 4.0]);
        assert_eq!(padded.column(4).to_vec(), vec![2.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn pad_then_crop_restores_the_original() {
        let stack = ramp(3, 5, 7);
        for &edge in &[false, true] {
            for &(x, y) in &[(7usize, 5usize), (8, 5), (9, 9), (12, 6)] {
                let padded = resize_stack(stack.view(), (x, y), edge);
                assert_eq!(padded.dim(), (3, y, x));
                let restored = resize_stack(padded.view(), (7, 5), edge);
                assert_eq!(restored, stack, "target {}x{} edge {}", x, y, edge);
            }
        }
    }

    #[test]
    fn mixed_crop_and_pad() {
        let image = Array2::from_shape_fn((2, 6), |(r, c)| (r * 10 + c) as f32);
        let resized = resize_image(image.view(), (4, 4), true);
        assert_eq!(resized.dim(), (4, 4));
        assert_eq!(resized.row(1).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(resized.row(0), resized.row(1));
        assert_eq!(resized.row(3).to_vec(), vec![11.0, 12.0, 13.0, 14.0]);
    }
}
