use ndarray::ArrayView2;

pub struct StatsHelper;

impl StatsHelper {
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|&v| v * v).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// Mean of an image, accumulated in double precision.
    pub fn mean(image: ArrayView2<f32>) -> f32 {
        if image.is_empty() {
            return 0.0;
        }
        let sum: f64 = image.iter().map(|&v| f64::from(v)).sum();
        (sum / image.len() as f64) as f32
    }

    /// `(min, max, mean)` of a set of pixel values; zeros when empty.
    pub fn summary<'a, I>(values: I) -> (f32, f32, f32)
    where
        I: IntoIterator<Item = &'a f32>,
    {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for &value in values {
            min = min.min(value);
            max = max.max(value);
            sum += f64::from(value);
            count += 1;
        }
        if count == 0 {
            return (0.0, 0.0, 0.0);
        }
        (min, max, (sum / count as f64) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rms_zero_sequence_yields_zero() {
        assert_eq!(StatsHelper::rms(&[]), 0.0);
        assert_eq!(StatsHelper::rms(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn rms_handles_single_value() {
        assert_eq!(StatsHelper::rms(&[4.0]), 4.0);
    }

    #[test]
    fn mean_of_image() {
        let image = array![[1.0f32, 2.0], [3.0, 6.0]];
        assert_eq!(StatsHelper::mean(image.view()), 3.0);
    }

    #[test]
    fn summary_tracks_extremes() {
        assert_eq!(StatsHelper::summary(&[2.0, -1.0, 5.0]), (-1.0, 5.0, 2.0));
        assert_eq!(StatsHelper::summary(&[]), (0.0, 0.0, 0.0));
    }
}
