use crate::prelude::{ProcessingStage, StageError, StageId, StageOutcome, StageResult};
use crate::record::{split_name, TomogramRecord};
use crate::stages::config::{StackConfig, ToolStageConfig};
use crate::stages::tool::{expand_template, path_value, ToolInvocation, ToolRunner};
use crate::telemetry::log::LogManager;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A stage delegated entirely to one external program per record.
///
/// Used for tomography preprocessing and defocus determination. Arguments and
/// expected outputs are templates over the record's current state.
pub struct ExternalStage {
    id: StageId,
    config: ToolStageConfig,
    stack: StackConfig,
    runner: Arc<dyn ToolRunner>,
    logger: LogManager,
}

impl ExternalStage {
    pub fn new(id: StageId, config: ToolStageConfig, stack: StackConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            id,
            config,
            stack,
            runner,
            logger: LogManager::scoped(id.name()),
        }
    }

    pub fn preprocess(config: ToolStageConfig, stack: StackConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self::new(StageId::Preprocess, config, stack, runner)
    }

    pub fn defocus(config: ToolStageConfig, stack: StackConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self::new(StageId::Defocus, config, stack, runner)
    }

    fn template_values(&self, record: &TomogramRecord) -> BTreeMap<String, String> {
        let mut values = self.config.vars.clone();
        let (stem, _) = split_name(&record.stack_name);
        let optional = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();
        // Target defocus is in µm, underfocus negative; the search range is in Å.
        let defocus = record.target_defocus * -10_000.0;

        let builtins = [
            ("tomo", record.tomo_str(self.stack.digits)),
            ("tomo_num", record.tomo_num.to_string()),
            ("root_dir", path_value(&record.root_dir)),
            ("stack_dir", path_value(&record.stack_dir)),
            ("stack", path_value(&record.stack_path())),
            ("stack_name", record.stack_name.clone()),
            ("stack_stem", stem.clone()),
            ("rawtlt", path_value(&record.stack_dir.join(format!("{}.rawtlt", stem)))),
            ("pixelsize", record.pixelsize.to_string()),
            ("tilt_axis_angle", record.tilt_axis_angle.to_string()),
            ("target_defocus", record.target_defocus.to_string()),
            ("defocus_low", (defocus - self.config.defocus_width).to_string()),
            ("defocus_high", (defocus + self.config.defocus_width).to_string()),
            ("min_tilt", optional(record.min_tilt)),
            ("max_tilt", optional(record.max_tilt)),
            ("n_tilts", record.rawtlt.len().to_string()),
        ];
        for (key, value) in builtins {
            values.insert(key.to_string(), value);
        }
        values
    }
}

impl ProcessingStage for ExternalStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn force(&self) -> bool {
        self.config.force
    }

    fn execute(&mut self, record: TomogramRecord) -> StageResult<StageOutcome> {
        let logger = self.logger.for_tomogram(record.tomo_num);
        if record.stack_name.is_empty() {
            return Err(StageError::Config(format!(
                "tomogram {} has no stack for {}",
                record.tomo_num, self.id
            )));
        }
        let values = self.template_values(&record);
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| expand_template(arg, &values))
            .collect();
        let outputs: Vec<String> = self
            .config
            .outputs
            .iter()
            .map(|output| expand_template(output, &values))
            .collect();

        let mut invocation = ToolInvocation::new(self.config.program.clone())
            .args(args)
            .in_dir(&record.stack_dir);
        for output in &outputs {
            invocation = invocation.expect_output(record.stack_dir.join(output));
        }
        logger.record(&format!("running {}", self.config.program));
        self.runner.run(&invocation)?;

        Ok(StageOutcome::Completed {
            record,
            algorithm: self.config.algorithm.clone(),
            output: outputs.into_iter().next(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{fake_tool, sample_record};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn recording_runner(calls: Arc<Mutex<Vec<ToolInvocation>>>) -> Arc<dyn ToolRunner> {
        fake_tool(calls, |_| Ok(()))
    }

    #[test]
    fn defocus_range_brackets_the_target() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001.st".into();
        record.target_defocus = -3.5;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = ExternalStage::defocus(
            ToolStageConfig::defocus(),
            StackConfig::default(),
            recording_runner(Arc::clone(&calls)),
        );

        let StageOutcome::Completed { algorithm, output, .. } = stage.execute(record).unwrap() else {
            panic!("defocus determination must complete");
        };
        assert_eq!(algorithm, "GCTF-stack");
        assert_eq!(output, None);

        let calls = calls.lock().unwrap();
        let args = &calls[0].args;
        let low = args.iter().position(|a| a == "--defL").unwrap();
        assert_eq!(args[low + 1], "15000");
        let high = args.iter().position(|a| a == "--defH").unwrap();
        assert_eq!(args[high + 1], "55000");
        assert!(args.last().unwrap().ends_with("tomo_001.st"));
    }

    #[test]
    fn outputs_and_vars_are_templated() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.stack_name = "tomo_001_clean.st".into();
        let mut config = ToolStageConfig::preprocess();
        config.enabled = true;
        config.args = vec!["-gold".into(), "{goldsize}".into(), "{stack_stem}".into()];
        config.outputs = vec!["{stack_stem}.preali".into()];
        config.vars.insert("goldsize".into(), "10".into());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = ExternalStage::preprocess(config, StackConfig::default(), recording_runner(Arc::clone(&calls)));

        let StageOutcome::Completed { output, .. } = stage.execute(record).unwrap() else {
            panic!("preprocessing must complete");
        };
        assert_eq!(output.as_deref(), Some("tomo_001_clean.preali"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].args, vec!["-gold", "10", "tomo_001_clean"]);
        assert_eq!(
            calls[0].expected_outputs,
            vec![dir.path().join("tomo_001").join("tomo_001_clean.preali")]
        );
        assert_eq!(calls[0].working_dir.as_deref(), Some(dir.path().join("tomo_001").as_path()));
    }

    #[test]
    fn missing_stack_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let record = sample_record(dir.path());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = ExternalStage::preprocess(
            ToolStageConfig::preprocess(),
            StackConfig::default(),
            recording_runner(calls),
        );
        assert!(matches!(stage.execute(record), Err(StageError::Config(_))));
    }
}
