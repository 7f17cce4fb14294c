pub mod fft;
pub mod frequency;
pub mod stats;

pub use fft::{ifftshift, FftHelper};
pub use frequency::{frequency_grid_2d, frequency_grid_3d};
pub use stats::StatsHelper;
