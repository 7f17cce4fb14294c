use crate::workflow::config::{BatchMode, WorkflowConfig};
use anyhow::Context;
use log::debug;
use std::sync::Arc;
use tomocore::prelude::{should_run, ProcessingStage, StageId, StageOutcome};
use tomocore::record::{RecordStore, TomogramRecord};
use tomocore::stages::{
    CleaningStage, DoseFilterStage, ExternalStage, FrameAlignmentStage, ToolRunner,
};
use tomocore::telemetry::{LogManager, Metrics, MetricsRecorder};

/// A stage that failed for one tomogram during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub tomo_num: u32,
    pub stage: StageId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub metrics: Metrics,
    pub failures: Vec<StageFailure>,
}

/// What the control loop does with a record after one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Abandon,
}

pub struct Runner {
    config: WorkflowConfig,
    stages: Vec<Box<dyn ProcessingStage>>,
    logger: LogManager,
}

impl Runner {
    /// Builds every enabled stage in pipeline order.
    pub fn new(config: WorkflowConfig, tools: Arc<dyn ToolRunner>) -> Self {
        let mut stages: Vec<Box<dyn ProcessingStage>> = Vec::new();
        if config.frame_alignment.enabled {
            stages.push(Box::new(FrameAlignmentStage::new(
                config.frame_alignment.clone(),
                config.stack.clone(),
                Arc::clone(&tools),
            )));
        }
        if config.cleaning.enabled {
            stages.push(Box::new(CleaningStage::new(
                config.cleaning.clone(),
                config.stack.clone(),
                Arc::clone(&tools),
            )));
        }
        if config.dose_filter.enabled {
            stages.push(Box::new(DoseFilterStage::new(
                config.dose_filter.clone(),
                config.stack.clone(),
            )));
        }
        if config.preprocess.enabled {
            stages.push(Box::new(ExternalStage::preprocess(
                config.preprocess.clone(),
                config.stack.clone(),
                Arc::clone(&tools),
            )));
        }
        if config.defocus.enabled {
            stages.push(Box::new(ExternalStage::defocus(
                config.defocus.clone(),
                config.stack.clone(),
                tools,
            )));
        }
        Self::with_stages(config, stages)
    }

    pub fn with_stages(config: WorkflowConfig, stages: Vec<Box<dyn ProcessingStage>>) -> Self {
        Self {
            config,
            stages,
            logger: LogManager::scoped("runner"),
        }
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|stage| stage.id()).collect()
    }

    /// Runs every pending stage of every record in `store`.
    ///
    /// A failed stage abandons the remaining stages of its record for this
    /// run. With `halt_on_error` the first failure is returned instead.
    pub fn execute(&mut self, store: &mut RecordStore) -> anyhow::Result<RunSummary> {
        self.apply_stack_params(store)
            .context("applying stack parameters")?;

        let metrics = MetricsRecorder::new();
        let mut failures = Vec::new();
        let mut abandoned = vec![false; store.len()];

        match self.config.batch_mode {
            BatchMode::Single => {
                for index in 0..store.len() {
                    for slot in 0..self.stages.len() {
                        let step = self.run_one(store, index, slot, &metrics, &mut failures)?;
                        if step == Step::Abandon {
                            break;
                        }
                    }
                }
            }
            BatchMode::Step => {
                for slot in 0..self.stages.len() {
                    for index in 0..store.len() {
                        if abandoned[index] {
                            continue;
                        }
                        let step = self.run_one(store, index, slot, &metrics, &mut failures)?;
                        abandoned[index] = step == Step::Abandon;
                    }
                }
            }
        }

        let summary = RunSummary {
            metrics: metrics.snapshot(),
            failures,
        };
        self.logger.record(&format!(
            "{} executed, {} skipped, {} failed",
            summary.metrics.executed, summary.metrics.skipped, summary.metrics.errors
        ));
        Ok(summary)
    }

    fn apply_stack_params(&self, store: &mut RecordStore) -> anyhow::Result<()> {
        let mut changed = false;
        for index in 0..store.len() {
            let mut record = snapshot(store, index)?;
            self.config.stack.apply(&mut record);
            changed |= store.replace(index, record)?;
        }
        if changed {
            store.persist()?;
        }
        Ok(())
    }

    fn run_one(
        &mut self,
        store: &mut RecordStore,
        index: usize,
        slot: usize,
        metrics: &MetricsRecorder,
        failures: &mut Vec<StageFailure>,
    ) -> anyhow::Result<Step> {
        let record = snapshot(store, index)?;
        let tomo_num = record.tomo_num;
        let logger = self.logger.for_tomogram(tomo_num);
        let stage = &mut self.stages[slot];
        let id = stage.id();

        if !should_run(&record, id, stage.force()) {
            debug!("tomogram {}: {} not pending", tomo_num, id);
            metrics.record_skipped();
            return Ok(Step::Continue);
        }

        logger.record(&format!("running {}", id));
        match stage.execute(record) {
            Ok(StageOutcome::Completed {
                mut record,
                algorithm,
                output,
            }) => {
                record.stages.mark_done(id, algorithm, output);
                commit(store, index, record)
                    .with_context(|| format!("recording {} for tomogram {}", id, tomo_num))?;
                metrics.record_executed();
                Ok(Step::Continue)
            }
            Ok(StageOutcome::Deferred { record }) => {
                logger.record(&format!("{} deferred", id));
                commit(store, index, record)
                    .with_context(|| format!("recording {} for tomogram {}", id, tomo_num))?;
                metrics.record_executed();
                Ok(Step::Continue)
            }
            Err(err) => {
                metrics.record_error();
                logger.warn(&format!("{} failed: {}", id, err));
                if self.config.halt_on_error {
                    return Err(anyhow::Error::new(err)
                        .context(format!("executing {} stage for tomogram {}", id, tomo_num)));
                }
                failures.push(StageFailure {
                    tomo_num,
                    stage: id,
                    message: err.to_string(),
                });
                Ok(Step::Abandon)
            }
        }
    }
}

fn snapshot(store: &RecordStore, index: usize) -> anyhow::Result<TomogramRecord> {
    store
        .snapshot(index)
        .with_context(|| format!("no record at position {}", index))
}

fn commit(store: &mut RecordStore, index: usize, record: TomogramRecord) -> anyhow::Result<()> {
    if store.replace(index, record)? {
        store.persist()?;
    }
    Ok(())
}
