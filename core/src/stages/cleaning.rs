use crate::io::rawtlt::write_rawtlt;
use crate::prelude::{ProcessingStage, StageError, StageId, StageOutcome, StageResult};
use crate::record::{split_name, TomogramRecord};
use crate::stages::config::{CleaningConfig, StackConfig};
use crate::stages::tool::{expand_template, path_value, ToolInvocation, ToolRunner};
use crate::telemetry::log::LogManager;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CLEANING_ALGORITHM: &str = "exclusion-list";

/// Removes operator-selected tilts from the current stack and, when present,
/// from the dose-filtered stack.
///
/// Tilts are chosen by their one-based position in the current stack. A
/// record flagged `skip` in the exclusion list is marked skipped and the stage
/// stays pending.
pub struct CleaningStage {
    config: CleaningConfig,
    stack: StackConfig,
    runner: Arc<dyn ToolRunner>,
    logger: LogManager,
}

impl CleaningStage {
    pub fn new(config: CleaningConfig, stack: StackConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config,
            stack,
            runner,
            logger: LogManager::scoped(StageId::Cleaning.name()),
        }
    }

    fn rewrite(&self, record: &TomogramRecord, input: &str, output: &str, exclude: &str) -> StageResult<()> {
        let input = record.stack_dir.join(input);
        let output = record.stack_dir.join(output);
        let mut values = BTreeMap::new();
        values.insert("input".to_string(), path_value(&input));
        values.insert("output".to_string(), path_value(&output));
        values.insert("exclude".to_string(), exclude.to_string());
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| expand_template(arg, &values))
            .collect();
        let invocation = ToolInvocation::new(self.config.program.clone())
            .args(args)
            .expect_output(output)
            .in_dir(&record.stack_dir);
        self.runner.run(&invocation)
    }
}

impl ProcessingStage for CleaningStage {
    fn id(&self) -> StageId {
        StageId::Cleaning
    }

    fn force(&self) -> bool {
        self.config.force
    }

    fn execute(&mut self, mut record: TomogramRecord) -> StageResult<StageOutcome> {
        let logger = self.logger.for_tomogram(record.tomo_num);
        let exclusion = self.config.exclusion_for(record.tomo_num).cloned().unwrap_or_default();
        if exclusion.skip {
            logger.warn("set to skip");
            record.skip = true;
            return Ok(StageOutcome::Deferred { record });
        }
        if record.stack_name.is_empty() {
            return Err(StageError::Config(format!(
                "tomogram {} has no stack to clean",
                record.tomo_num
            )));
        }

        let order = self.stack.tilt_order;
        let tilts = record.usable_tilts(order);
        if let Some(&bad) = exclusion.tilts.iter().find(|&&p| p == 0 || p > tilts.len()) {
            return Err(StageError::Config(format!(
                "tilt position {} is outside the {} tilts of tomogram {}",
                bad,
                tilts.len(),
                record.tomo_num
            )));
        }

        let (stem, ext) = split_name(&record.stack_name);
        let append = &self.config.clean_append;
        let filtered = record
            .stages
            .dose_filter
            .output
            .clone()
            .filter(|_| record.stages.dose_filter.done);

        if exclusion.tilts.is_empty() {
            logger.record("no bad tilts");
        } else {
            let exclude = exclusion
                .tilts
                .iter()
                .map(|p| (p - 1).to_string())
                .collect::<Vec<_>>()
                .join(",");
            logger.record(&format!("removing tilts {}", exclude));

            let cleaned = format!("{}{}{}", stem, append, ext);
            self.rewrite(&record, &record.stack_name, &cleaned, &exclude)?;
            if let Some(filtered) = &filtered {
                let (df_stem, df_ext) = split_name(filtered);
                let df_cleaned = format!("{}{}{}", df_stem, append, df_ext);
                self.rewrite(&record, filtered, &df_cleaned, &exclude)?;
                record.stages.rename_output(StageId::DoseFilter, df_cleaned);
            }

            let angles: Vec<f64> = exclusion.tilts.iter().map(|p| tilts[p - 1].1).collect();
            record.remove_tilts(&angles, order)?;
            record.stack_name = cleaned;
        }
        record.refresh_rawtlt(order);

        write_rawtlt(
            record.stack_dir.join(format!("{}{}.rawtlt", stem, append)),
            &record.rawtlt,
        )?;
        if let Some(filtered) = &filtered {
            let (df_stem, _) = split_name(filtered);
            write_rawtlt(
                record.stack_dir.join(format!("{}{}.rawtlt", df_stem, append)),
                &record.rawtlt,
            )?;
        }

        let output = Some(record.stack_name.clone());
        Ok(StageOutcome::Completed {
            record,
            algorithm: CLEANING_ALGORITHM.to_string(),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::rawtlt::read_rawtlt;
    use crate::stages::config::TiltExclusion;
    use crate::stages::testing::{fake_tool, sample_record};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn touching_runner(calls: Arc<Mutex<Vec<ToolInvocation>>>) -> Arc<dyn ToolRunner> {
        fake_tool(calls, |invocation| {
            for output in &invocation.expected_outputs {
                fs::write(output, b"stack").map_err(|err| StageError::io(output, err))?;
            }
            Ok(())
        })
    }

    fn config(tomogram: u32, tilts: Vec<usize>, skip: bool) -> CleaningConfig {
        CleaningConfig {
            clean_append: "_clean".into(),
            exclusions: vec![TiltExclusion { tomogram, tilts, skip }],
            ..Default::default()
        }
    }

    #[test]
    fn excluded_positions_become_removed_tilts() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001.st".into();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = CleaningStage::new(config(1, vec![3], false), StackConfig::default(), touching_runner(Arc::clone(&calls)));

        let StageOutcome::Completed { record, algorithm, output } = stage.execute(record).unwrap() else {
            panic!("cleaning must complete");
        };
        assert_eq!(algorithm, CLEANING_ALGORITHM);
        assert_eq!(output.as_deref(), Some("tomo_001_clean.st"));
        assert_eq!(record.removed_tilts, vec![3.0]);
        assert_eq!(record.rawtlt, vec![-3.0, 0.0]);
        assert_eq!(record.max_tilt, Some(0.0));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "newstack");
        assert_eq!(calls[0].args.last().map(String::as_str), Some("2"));
        let rawtlt = read_rawtlt(dir.path().join("tomo_001").join("tomo_001_clean.rawtlt")).unwrap();
        assert_eq!(rawtlt, vec![-3.0, 0.0]);
    }

    #[test]
    fn dose_filtered_stack_is_cleaned_alongside() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001.st".into();
        record
            .stages
            .mark_done(StageId::DoseFilter, "exposure-filter-images".into(), Some("tomo_001_dose-filt.st".into()));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = CleaningStage::new(config(1, vec![1, 2], false), StackConfig::default(), touching_runner(Arc::clone(&calls)));

        let StageOutcome::Completed { record, .. } = stage.execute(record).unwrap() else {
            panic!("cleaning must complete");
        };
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(
            record.stages.dose_filter.output.as_deref(),
            Some("tomo_001_dose-filt_clean.st")
        );
        assert_eq!(record.rawtlt, vec![3.0]);
        assert!(dir.path().join("tomo_001").join("tomo_001_dose-filt_clean.rawtlt").is_file());
    }

    #[test]
    fn empty_exclusion_keeps_the_stack() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001.st".into();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = CleaningStage::new(CleaningConfig::default(), StackConfig::default(), touching_runner(Arc::clone(&calls)));

        let StageOutcome::Completed { record, output, .. } = stage.execute(record).unwrap() else {
            panic!("cleaning must complete");
        };
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(output.as_deref(), Some("tomo_001.st"));
        assert!(record.removed_tilts.is_empty());
        assert!(dir.path().join("tomo_001").join("tomo_001.rawtlt").is_file());
    }

    #[test]
    fn skip_request_defers_the_stage() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001.st".into();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = CleaningStage::new(config(1, Vec::new(), true), StackConfig::default(), touching_runner(calls));

        let StageOutcome::Deferred { record } = stage.execute(record).unwrap() else {
            panic!("skip must defer");
        };
        assert!(record.skip);
        assert!(!record.stages.cleaning.done);
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001.st".into();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = CleaningStage::new(config(1, vec![4], false), StackConfig::default(), touching_runner(calls));
        assert!(matches!(stage.execute(record), Err(StageError::Config(_))));
    }
}
