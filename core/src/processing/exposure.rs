//! Resolution-dependent exposure (dose) attenuation.
//!
//! The critical exposure at spatial frequency `f` is `a * f^b + c`; a pixel of
//! an image that received `dose` e/Å² is attenuated by
//! `exp(-dose / (2 * (a * f^b + c)))`.

use crate::math::fft::ifftshift;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Stand-in for exactly-zero frequency bins, where `f^b` diverges for `b < 0`.
pub const ZERO_FREQUENCY_EPSILON: f64 = 1e-10;

/// Critical-exposure constants `(a, b, c)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseFilterParams {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for DoseFilterParams {
    fn default() -> Self {
        Self {
            a: 0.245,
            b: -1.665,
            c: 2.81,
        }
    }
}

impl DoseFilterParams {
    /// Uses the given constants only when all three are set.
    pub fn from_optional(a: Option<f64>, b: Option<f64>, c: Option<f64>) -> Self {
        match (a, b, c) {
            (Some(a), Some(b), Some(c)) => Self { a, b, c },
            _ => Self::default(),
        }
    }

    pub fn critical_exposure(&self, frequency: f64) -> f64 {
        let frequency = if frequency == 0.0 {
            ZERO_FREQUENCY_EPSILON
        } else {
            frequency
        };
        self.a * frequency.powf(self.b) + self.c
    }

    pub fn attenuation(&self, frequency: f64, dose: f64) -> f64 {
        (-dose / (2.0 * self.critical_exposure(frequency))).exp()
    }
}

/// Attenuation for every bin of a centred frequency grid, returned with the
/// zero frequency at `(0, 0)` to line up with an unshifted FFT.
pub fn exposure_kernel(frequencies: &Array2<f64>, dose: f64, params: &DoseFilterParams) -> Array2<f64> {
    let centered = frequencies.mapv(|f| params.attenuation(f, dose));
    ifftshift(&centered)
}
