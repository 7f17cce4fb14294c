//! Per-stage configuration sections.
//!
//! Every section deserializes with defaults, so a workflow file only names
//! what it changes. Sections are validated once, right after loading.

use crate::prelude::{StageError, StageId, StageResult};
use crate::processing::exposure::DoseFilterParams;
use crate::record::{TiltOrder, TomogramRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stack naming and layout shared by all stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Apply `image_size` and `prealigned` to every record before its stages.
    pub update_stack: bool,
    /// Target `[x, y]` size of assembled stacks.
    pub image_size: Option<[usize; 2]>,
    /// Name stacks `<prefix><num>.st` rather than `<num>.st`.
    pub stack_prefix: bool,
    pub prefix: String,
    pub digits: usize,
    pub tilt_order: TiltOrder,
    /// Algorithm that already aligned the raw stacks, if any.
    pub prealigned: Option<String>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            update_stack: false,
            image_size: None,
            stack_prefix: true,
            prefix: "tomo_".into(),
            digits: 3,
            tilt_order: TiltOrder::Ascend,
            prealigned: None,
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> StageResult<()> {
        if self.update_stack {
            match self.image_size {
                Some([x, y]) if x > 0 && y > 0 => {}
                _ => {
                    return Err(StageError::Config(
                        "stack.update_stack needs a positive stack.image_size".into(),
                    ))
                }
            }
        }
        if self.digits == 0 {
            return Err(StageError::Config("stack.digits must be at least 1".into()));
        }
        Ok(())
    }

    /// Applies the stack parameters to `record`.
    pub fn apply(&self, record: &mut TomogramRecord) {
        if !self.update_stack {
            return;
        }
        record.image_size = self.image_size;
        if let Some(algorithm) = self.prealigned.as_deref().filter(|a| !a.trim().is_empty()) {
            record.stack_name = record.raw_stack_name.clone();
            record.stages.mark_done(
                StageId::FrameAlignment,
                algorithm.to_string(),
                Some(record.raw_stack_name.clone()),
            );
        }
    }

    pub fn stack_name(&self, record: &TomogramRecord) -> String {
        let tomo_str = record.tomo_str(self.digits);
        if self.stack_prefix {
            format!("{}{}.st", self.prefix, tomo_str)
        } else {
            format!("{}.st", tomo_str)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameAlignmentConfig {
    pub enabled: bool,
    pub force: bool,
    pub program: String,
    /// Argument template, expanded per tilt. See [`crate::stages::tool::expand_template`].
    pub args: Vec<String>,
    /// Folder under the stack directory receiving per-tilt sums.
    pub work_dir: String,
    pub keep_intermediate: bool,
    pub input_format: String,
}

impl Default for FrameAlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
            program: "MotionCor3".into(),
            args: vec![
                "-In{format}".into(),
                "{input}".into(),
                "-OutMrc".into(),
                "{output}".into(),
                "-LogFile".into(),
                "{output}.log".into(),
            ],
            work_dir: "MotionCor3".into(),
            keep_intermediate: false,
            input_format: "Tiff".into(),
        }
    }
}

/// Tilts to remove from one tomogram, or a request to skip it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiltExclusion {
    pub tomogram: u32,
    /// Positions in the current stack, counting from one.
    pub tilts: Vec<usize>,
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub enabled: bool,
    pub force: bool,
    /// Appended to cleaned stack names. Empty overwrites the stack.
    pub clean_append: String,
    pub program: String,
    pub args: Vec<String>,
    pub exclusions: Vec<TiltExclusion>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
            clean_append: String::new(),
            program: "newstack".into(),
            args: vec![
                "-input".into(),
                "{input}".into(),
                "-output".into(),
                "{output}".into(),
                "-exclude".into(),
                "{exclude}".into(),
            ],
            exclusions: Vec::new(),
        }
    }
}

impl CleaningConfig {
    pub fn validate(&self) -> StageResult<()> {
        let mut seen = std::collections::BTreeSet::new();
        for exclusion in &self.exclusions {
            if !seen.insert(exclusion.tomogram) {
                return Err(StageError::Config(format!(
                    "cleaning lists tomogram {} twice",
                    exclusion.tomogram
                )));
            }
            if exclusion.tilts.contains(&0) {
                return Err(StageError::Config(format!(
                    "cleaning of tomogram {}: tilt positions count from one",
                    exclusion.tomogram
                )));
            }
        }
        Ok(())
    }

    pub fn exclusion_for(&self, tomo_num: u32) -> Option<&TiltExclusion> {
        self.exclusions.iter().find(|e| e.tomogram == tomo_num)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoseFilterConfig {
    pub enabled: bool,
    pub force: bool,
    /// Appended to the filtered stack name.
    pub dfilt_append: String,
    /// Filter aligned frame stacks instead of summed images.
    pub filter_frames: bool,
    /// Dose received before the first exposure, e/Å².
    pub preexposure: f64,
    pub a: Option<f64>,
    pub b: Option<f64>,
    pub c: Option<f64>,
    /// Folder under the stack directory holding aligned frame stacks.
    pub frame_stack_dir: String,
}

impl Default for DoseFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
            dfilt_append: "_dose-filt".into(),
            filter_frames: false,
            preexposure: 0.0,
            a: None,
            b: None,
            c: None,
            frame_stack_dir: "MotionCor3".into(),
        }
    }
}

impl DoseFilterConfig {
    pub fn validate(&self) -> StageResult<()> {
        if self.preexposure < 0.0 || !self.preexposure.is_finite() {
            return Err(StageError::Config(format!(
                "dose_filter.preexposure must be a non-negative number, got {}",
                self.preexposure
            )));
        }
        Ok(())
    }

    pub fn params(&self) -> DoseFilterParams {
        DoseFilterParams::from_optional(self.a, self.b, self.c)
    }
}

/// A stage that runs one templated external command per record.
///
/// [`ToolStageConfig::preprocess`] and [`ToolStageConfig::defocus`] are the
/// presets used when a workflow omits the section. A section that is present
/// replaces the preset; fields it leaves out take neutral defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolStageConfig {
    pub enabled: bool,
    pub force: bool,
    pub program: String,
    pub args: Vec<String>,
    /// Files, relative to the stack directory, that must exist afterwards.
    pub outputs: Vec<String>,
    /// Tag recorded as the stage algorithm.
    pub algorithm: String,
    /// Extra template values.
    pub vars: BTreeMap<String, String>,
    /// Search width around the target defocus, Å. Only used for defocus.
    pub defocus_width: f64,
}

impl ToolStageConfig {
    pub fn preprocess() -> Self {
        Self {
            enabled: false,
            force: false,
            program: "batchruntomo".into(),
            args: vec!["-directive".into(), "{stack_dir}/{stack_stem}.adoc".into()],
            outputs: Vec::new(),
            algorithm: "imod".into(),
            vars: BTreeMap::new(),
            defocus_width: 0.0,
        }
    }

    pub fn defocus() -> Self {
        Self {
            enabled: false,
            force: false,
            program: "gctf".into(),
            args: vec![
                "--apix".into(),
                "{pixelsize}".into(),
                "--defL".into(),
                "{defocus_low}".into(),
                "--defH".into(),
                "{defocus_high}".into(),
                "{stack}".into(),
            ],
            outputs: Vec::new(),
            algorithm: "GCTF-stack".into(),
            vars: BTreeMap::new(),
            defocus_width: 20000.0,
        }
    }

    pub fn validate(&self, stage: StageId) -> StageResult<()> {
        if self.enabled && self.program.trim().is_empty() {
            return Err(StageError::Config(format!("{} needs a program", stage)));
        }
        if self.enabled && self.algorithm.trim().is_empty() {
            return Err(StageError::Config(format!("{} needs an algorithm tag", stage)));
        }
        if self.defocus_width < 0.0 {
            return Err(StageError::Config(format!(
                "{}: defocus_width must not be negative",
                stage
            )));
        }
        Ok(())
    }
}

impl Default for ToolStageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            force: false,
            program: String::new(),
            args: Vec::new(),
            outputs: Vec::new(),
            algorithm: String::new(),
            vars: BTreeMap::new(),
            defocus_width: 20000.0,
        }
    }
}
