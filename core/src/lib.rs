//! Core of the tilt-series preprocessing pipeline.
//!
//! Holds the persisted tomogram records, the resumability rule shared by all
//! stages, the exposure filter and geometry kernels, the image container and
//! metadata codecs, and the concrete stages that tie them together.

pub mod io;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod record;
pub mod stages;
pub mod telemetry;

pub use prelude::{should_run, ProcessingStage, StageError, StageId, StageOutcome, StageResult};
pub use record::{RecordStore, TomogramRecord};
