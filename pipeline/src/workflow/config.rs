use crate::generator::synthetic::SyntheticConfig;
use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tomocore::prelude::StageId;
use tomocore::record::IngestConfig;
use tomocore::stages::{
    CleaningConfig, DoseFilterConfig, FrameAlignmentConfig, StackConfig, ToolStageConfig,
};

/// How records and stages are interleaved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// One tomogram through every stage, then the next tomogram.
    #[default]
    Single,
    /// Every tomogram through one stage, then the next stage.
    Step,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub root_dir: PathBuf,
    /// Record store file, relative to `root_dir`.
    pub record_store: String,
    /// Run report appended after every run, relative to `root_dir`.
    pub log_name: String,
    pub batch_mode: BatchMode,
    pub halt_on_error: bool,
    pub ingest: IngestConfig,
    pub stack: StackConfig,
    pub frame_alignment: FrameAlignmentConfig,
    pub cleaning: CleaningConfig,
    pub dose_filter: DoseFilterConfig,
    pub preprocess: ToolStageConfig,
    pub defocus: ToolStageConfig,
    pub synthetic: SyntheticConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            record_store: "tomolist.json".into(),
            log_name: "pipeline.log".into(),
            batch_mode: BatchMode::Single,
            halt_on_error: false,
            ingest: IngestConfig::default(),
            stack: StackConfig::default(),
            frame_alignment: FrameAlignmentConfig::default(),
            cleaning: CleaningConfig::default(),
            dose_filter: DoseFilterConfig::default(),
            preprocess: ToolStageConfig::preprocess(),
            defocus: ToolStageConfig::defocus(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config
            .validate()
            .with_context(|| format!("validating workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.record_store.trim().is_empty() {
            anyhow::bail!("record_store must name a file");
        }
        self.ingest.validate().context("ingest section")?;
        self.stack.validate().context("stack section")?;
        self.cleaning.validate().context("cleaning section")?;
        self.dose_filter.validate().context("dose_filter section")?;
        self.preprocess
            .validate(StageId::Preprocess)
            .context("preprocess section")?;
        self.defocus
            .validate(StageId::Defocus)
            .context("defocus section")?;
        self.synthetic.validate().context("synthetic section")?;
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.root_dir.join(&self.record_store)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root_dir.join(&self.log_name)
    }
}
