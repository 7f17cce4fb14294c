pub mod dose_frames;
pub mod dose_stack;
pub mod exposure;
pub mod mirror;
pub mod resize;

pub use dose_frames::dose_filter_frames;
pub use dose_stack::dose_filter_stack;
pub use exposure::{exposure_kernel, DoseFilterParams};
pub use mirror::{mirror, MirrorAxis};
pub use resize::{resize_image, resize_stack};
