//! Concrete pipeline stages and their configuration.

pub mod alignment;
pub mod cleaning;
pub mod config;
pub mod dose_filter;
pub mod external;
pub mod tool;

pub use alignment::FrameAlignmentStage;
pub use cleaning::CleaningStage;
pub use config::{
    CleaningConfig, DoseFilterConfig, FrameAlignmentConfig, StackConfig, TiltExclusion,
    ToolStageConfig,
};
pub use dose_filter::DoseFilterStage;
pub use external::ExternalStage;
pub use tool::{CommandRunner, ToolInvocation, ToolRunner};
