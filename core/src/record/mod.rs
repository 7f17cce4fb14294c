//! Persisted per-tomogram state shared by every pipeline stage.

pub mod ingest;
pub mod store;

pub use ingest::{ingest_mdoc, IngestConfig};
pub use store::RecordStore;

use crate::prelude::{StageError, StageId, StageResult};
use crate::processing::mirror::MirrorAxis;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Two tilt angles closer than this are treated as the same tilt.
pub const TILT_TOLERANCE: f64 = 1e-3;

/// Order in which usable tilts are listed in stacks and `.rawtlt` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiltOrder {
    #[default]
    Ascend,
    Descend,
}

impl TiltOrder {
    pub fn sort(self, tilts: &mut [f64]) {
        match self {
            TiltOrder::Ascend => tilts.sort_by(|a, b| a.total_cmp(b)),
            TiltOrder::Descend => tilts.sort_by(|a, b| b.total_cmp(a)),
        }
    }
}

/// Number of detector frames per tilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameCount {
    Uniform(u32),
    PerTilt(Vec<u32>),
}

impl Default for FrameCount {
    fn default() -> Self {
        FrameCount::Uniform(1)
    }
}

impl FrameCount {
    /// Frames recorded for the tilt at `index` in collection order.
    pub fn for_tilt(&self, index: usize) -> StageResult<u32> {
        match self {
            FrameCount::Uniform(count) => Ok(*count),
            FrameCount::PerTilt(counts) => counts.get(index).copied().ok_or_else(|| {
                StageError::Config(format!(
                    "no frame count recorded for tilt {} ({} entries)",
                    index,
                    counts.len()
                ))
            }),
        }
    }
}

/// Completion state of a single stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub done: bool,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

/// Completion state of every stage of one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageLedger {
    pub frame_alignment: StageState,
    pub cleaning: StageState,
    pub dose_filter: StageState,
    pub preprocess: StageState,
    pub defocus: StageState,
}

impl StageLedger {
    pub fn get(&self, stage: StageId) -> &StageState {
        match stage {
            StageId::FrameAlignment => &self.frame_alignment,
            StageId::Cleaning => &self.cleaning,
            StageId::DoseFilter => &self.dose_filter,
            StageId::Preprocess => &self.preprocess,
            StageId::Defocus => &self.defocus,
        }
    }

    fn get_mut(&mut self, stage: StageId) -> &mut StageState {
        match stage {
            StageId::FrameAlignment => &mut self.frame_alignment,
            StageId::Cleaning => &mut self.cleaning,
            StageId::DoseFilter => &mut self.dose_filter,
            StageId::Preprocess => &mut self.preprocess,
            StageId::Defocus => &mut self.defocus,
        }
    }

    /// Marks `stage` done. There is no way back to not-done.
    pub fn mark_done(&mut self, stage: StageId, algorithm: String, output: Option<String>) {
        let state = self.get_mut(stage);
        state.done = true;
        state.algorithm = Some(algorithm);
        state.output = output;
    }

    /// Renames the output artifact of a finished stage.
    pub fn rename_output(&mut self, stage: StageId, output: String) {
        let state = self.get_mut(stage);
        if state.done {
            state.output = Some(output);
        }
    }
}

/// One tilt series and everything the pipeline knows about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomogramRecord {
    pub tomo_num: u32,
    #[serde(default)]
    pub root_dir: PathBuf,
    pub stack_dir: PathBuf,
    #[serde(default)]
    pub frame_dir: PathBuf,
    #[serde(default)]
    pub mdoc_name: String,
    #[serde(default)]
    pub frame_names: Vec<String>,
    #[serde(default)]
    pub raw_stack_name: String,
    #[serde(default)]
    pub stack_name: String,
    /// Tilt angles in collection order, degrees.
    pub collected_tilts: Vec<f64>,
    #[serde(default)]
    pub removed_tilts: Vec<f64>,
    #[serde(default)]
    pub rawtlt: Vec<f64>,
    #[serde(default)]
    pub min_tilt: Option<f64>,
    #[serde(default)]
    pub max_tilt: Option<f64>,
    #[serde(default)]
    pub tilt_axis_angle: f64,
    /// Pixel size in Å.
    pub pixelsize: f64,
    /// Target `[x, y]` size of assembled stacks.
    #[serde(default)]
    pub image_size: Option<[usize; 2]>,
    #[serde(default)]
    pub cumulative_exposure_time: Vec<f64>,
    /// Cumulative dose in e/Å² after each tilt, collection order.
    pub dose: Vec<f64>,
    #[serde(default)]
    pub target_defocus: f64,
    #[serde(default)]
    pub n_frames: FrameCount,
    #[serde(default)]
    pub gainref: Option<PathBuf>,
    #[serde(default)]
    pub defects_file: Option<PathBuf>,
    #[serde(default)]
    pub rotate_gain: i32,
    #[serde(default)]
    pub flip_gain: i32,
    #[serde(default)]
    pub mirror_stack: Option<MirrorAxis>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub stages: StageLedger,
}

impl TomogramRecord {
    /// Zero-padded tomogram number used in file names.
    pub fn tomo_str(&self, digits: usize) -> String {
        format!("{:0width$}", self.tomo_num, width = digits)
    }

    pub fn stack_path(&self) -> PathBuf {
        self.stack_dir.join(&self.stack_name)
    }

    /// Usable tilts paired with their collection index, sorted by `order`.
    pub fn usable_tilts(&self, order: TiltOrder) -> Vec<(usize, f64)> {
        let mut tilts: Vec<(usize, f64)> = self
            .collected_tilts
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, tilt)| !contains_tilt(&self.removed_tilts, *tilt))
            .collect();
        match order {
            TiltOrder::Ascend => tilts.sort_by(|a, b| a.1.total_cmp(&b.1)),
            TiltOrder::Descend => tilts.sort_by(|a, b| b.1.total_cmp(&a.1)),
        }
        tilts
    }

    /// Recomputes `rawtlt` and the tilt range from the removed-tilt set.
    pub fn refresh_rawtlt(&mut self, order: TiltOrder) {
        self.rawtlt = self
            .usable_tilts(order)
            .into_iter()
            .map(|(_, tilt)| tilt)
            .collect();
        self.min_tilt = self.rawtlt.iter().copied().reduce(f64::min);
        self.max_tilt = self.rawtlt.iter().copied().reduce(f64::max);
    }

    /// Adds `angles` to the removed-tilt set.
    ///
    /// Every angle must be a collected tilt; nothing is changed otherwise.
    pub fn remove_tilts(&mut self, angles: &[f64], order: TiltOrder) -> StageResult<()> {
        if let Some(unknown) = angles
            .iter()
            .find(|angle| !contains_tilt(&self.collected_tilts, **angle))
        {
            return Err(StageError::Config(format!(
                "tilt {:.2} was never collected for tomogram {}",
                unknown, self.tomo_num
            )));
        }
        for &angle in angles {
            if !contains_tilt(&self.removed_tilts, angle) {
                self.removed_tilts.push(angle);
            }
        }
        order.sort(&mut self.removed_tilts);
        self.refresh_rawtlt(order);
        Ok(())
    }
}

fn contains_tilt(tilts: &[f64], angle: f64) -> bool {
    tilts
        .iter()
        .any(|tilt| (tilt - angle).abs() < TILT_TOLERANCE)
}

/// Splits a file name into stem and extension, keeping the leading dot.
pub fn split_name(name: &str) -> (String, String) {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TomogramRecord {
        TomogramRecord {
            tomo_num: 7,
            collected_tilts: vec![0.0, 3.0, -3.0, 6.0, -6.0],
            dose: vec![3.0, 6.0, 9.0, 12.0, 15.0],
            pixelsize: 2.7,
            ..Default::default()
        }
    }

    #[test]
    fn usable_tilts_follow_order_and_keep_indices() {
        let record = sample();
        let ascending = record.usable_tilts(TiltOrder::Ascend);
        assert_eq!(
            ascending,
            vec![(4, -6.0), (2, -3.0), (0, 0.0), (1, 3.0), (3, 6.0)]
        );
        let descending = record.usable_tilts(TiltOrder::Descend);
        assert_eq!(descending.first(), Some(&(3, 6.0)));
    }

    #[test]
    fn removing_tilts_updates_rawtlt_and_range() {
        let mut record = sample();
        record.remove_tilts(&[6.0, -6.0], TiltOrder::Ascend).unwrap();
        assert_eq!(record.removed_tilts, vec![-6.0, 6.0]);
        assert_eq!(record.rawtlt, vec![-3.0, 0.0, 3.0]);
        assert_eq!(record.min_tilt, Some(-3.0));
        assert_eq!(record.max_tilt, Some(3.0));
    }

    #[test]
    fn removing_unknown_tilt_is_rejected_without_changes() {
        let mut record = sample();
        let err = record.remove_tilts(&[3.0, 42.0], TiltOrder::Ascend);
        assert!(matches!(err, Err(StageError::Config(_))));
        assert!(record.removed_tilts.is_empty());
    }

    #[test]
    fn removal_is_idempotent() {
        let mut record = sample();
        record.remove_tilts(&[3.0], TiltOrder::Descend).unwrap();
        record.remove_tilts(&[3.0], TiltOrder::Descend).unwrap();
        assert_eq!(record.removed_tilts, vec![3.0]);
        assert_eq!(record.rawtlt, vec![6.0, 0.0, -3.0, -6.0]);
    }

    #[test]
    fn frame_count_lookup() {
        assert_eq!(FrameCount::Uniform(8).for_tilt(40).unwrap(), 8);
        let per_tilt = FrameCount::PerTilt(vec![8, 10]);
        assert_eq!(per_tilt.for_tilt(1).unwrap(), 10);
        assert!(per_tilt.for_tilt(2).is_err());
    }

    #[test]
    fn ledger_rename_only_touches_finished_stages() {
        let mut ledger = StageLedger::default();
        ledger.rename_output(StageId::DoseFilter, "x.st".into());
        assert_eq!(ledger.dose_filter.output, None);
        ledger.mark_done(StageId::DoseFilter, "images".into(), Some("a.st".into()));
        ledger.rename_output(StageId::DoseFilter, "b.st".into());
        assert_eq!(ledger.dose_filter.output.as_deref(), Some("b.st"));
        assert!(ledger.dose_filter.done);
    }

    #[test]
    fn split_name_keeps_dot() {
        assert_eq!(
            split_name("tomo_001.st"),
            ("tomo_001".to_string(), ".st".to_string())
        );
        assert_eq!(split_name("plain"), ("plain".to_string(), String::new()));
    }

    #[test]
    fn record_serializes_frame_count_untagged() {
        let mut record = sample();
        record.n_frames = FrameCount::PerTilt(vec![5, 6]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"n_frames\":[5,6]"));
        let back: TomogramRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
