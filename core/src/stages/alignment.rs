use crate::io::mrc::{read_mrc, write_mrc, MrcHeader};
use crate::io::rawtlt::write_rawtlt;
use crate::prelude::{ProcessingStage, StageError, StageId, StageOutcome, StageResult};
use crate::processing::mirror::mirror;
use crate::processing::resize::resize_image;
use crate::record::{split_name, TomogramRecord};
use crate::stages::config::{FrameAlignmentConfig, StackConfig};
use crate::stages::tool::{expand_template, path_value, ToolInvocation, ToolRunner};
use crate::telemetry::log::LogManager;
use ndarray::{s, Array3, Axis};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Motion-corrects every tilt's frames with an external program and
/// assembles the sums into one stack ordered by tilt angle.
pub struct FrameAlignmentStage {
    config: FrameAlignmentConfig,
    stack: StackConfig,
    runner: Arc<dyn ToolRunner>,
    logger: LogManager,
}

impl FrameAlignmentStage {
    pub fn new(config: FrameAlignmentConfig, stack: StackConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config,
            stack,
            runner,
            logger: LogManager::scoped(StageId::FrameAlignment.name()),
        }
    }

    fn invocation(&self, record: &TomogramRecord, input: &Path, output: &Path) -> ToolInvocation {
        let mut values = BTreeMap::new();
        values.insert("input".to_string(), path_value(input));
        values.insert("output".to_string(), path_value(output));
        values.insert("format".to_string(), self.config.input_format.clone());
        values.insert("pixelsize".to_string(), record.pixelsize.to_string());
        values.insert("tomo".to_string(), record.tomo_str(self.stack.digits));

        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| expand_template(arg, &values))
            .collect();
        if let Some(gainref) = &record.gainref {
            args.extend([
                "-Gain".to_string(),
                path_value(gainref),
                "-RotGain".to_string(),
                record.rotate_gain.to_string(),
                "-FlipGain".to_string(),
                record.flip_gain.to_string(),
            ]);
        }
        if let Some(defects) = &record.defects_file {
            args.extend(["-DefectFile".to_string(), path_value(defects)]);
        }
        ToolInvocation::new(self.config.program.clone())
            .args(args)
            .expect_output(output)
            .in_dir(&record.stack_dir)
    }
}

impl ProcessingStage for FrameAlignmentStage {
    fn id(&self) -> StageId {
        StageId::FrameAlignment
    }

    fn force(&self) -> bool {
        self.config.force
    }

    fn execute(&mut self, mut record: TomogramRecord) -> StageResult<StageOutcome> {
        let logger = self.logger.for_tomogram(record.tomo_num);
        let tomo_str = record.tomo_str(self.stack.digits);
        let n_tilts = record.collected_tilts.len();
        if record.frame_names.len() < n_tilts {
            return Err(StageError::Config(format!(
                "tomogram {} lists {} frame files for {} tilts",
                record.tomo_num,
                record.frame_names.len(),
                n_tilts
            )));
        }

        let work_dir = record.stack_dir.join(&self.config.work_dir);
        fs::create_dir_all(&work_dir).map_err(|err| StageError::io(&work_dir, err))?;
        let sums: Vec<_> = (0..n_tilts)
            .map(|i| work_dir.join(format!("{}_{}.mrc", tomo_str, i)))
            .collect();

        logger.record(&format!("aligning {} tilts with {}", n_tilts, self.config.program));
        for (i, output) in sums.iter().enumerate() {
            let input = record.frame_dir.join(&record.frame_names[i]);
            let invocation = self.invocation(&record, &input, output);
            self.runner.run(&invocation)?;
        }

        let usable = record.usable_tilts(self.stack.tilt_order);
        let Some(&(first_idx, _)) = usable.first() else {
            return Err(StageError::Config(format!(
                "tomogram {} has no usable tilts",
                record.tomo_num
            )));
        };
        let [size_x, size_y] = match record.image_size {
            Some(size) => size,
            None => {
                let first = read_mrc(&sums[first_idx])?;
                let (_, rows, cols) = first.data.dim();
                [cols, rows]
            }
        };

        logger.record("assembling stack");
        let mut stack = Array3::<f32>::zeros((usable.len(), size_y, size_x));
        for (slot, &(idx, _)) in usable.iter().enumerate() {
            let sum = read_mrc(&sums[idx])?;
            if sum.data.len_of(Axis(0)) == 0 {
                return Err(StageError::Format {
                    path: sums[idx].clone(),
                    reason: "aligned sum holds no image".into(),
                });
            }
            let image = resize_image(sum.data.index_axis(Axis(0), 0), (size_x, size_y), true);
            let image = match record.mirror_stack {
                Some(axis) => mirror(image.insert_axis(Axis(0)).view(), axis, None)?
                    .index_axis_move(Axis(0), 0),
                None => image,
            };
            stack.slice_mut(s![slot, .., ..]).assign(&image);
        }

        let stack_name = self.stack.stack_name(&record);
        let mut header = MrcHeader::default();
        header.push_label(&format!("Frames aligned with {}.", self.config.program));
        write_mrc(
            record.stack_dir.join(&stack_name),
            stack.view(),
            &header,
            Some(record.pixelsize),
        )?;

        record.refresh_rawtlt(self.stack.tilt_order);
        let (stem, _) = split_name(&stack_name);
        write_rawtlt(record.stack_dir.join(format!("{}.rawtlt", stem)), &record.rawtlt)?;

        if !self.config.keep_intermediate {
            for sum in &sums {
                fs::remove_file(sum).map_err(|err| StageError::io(sum, err))?;
                let log = sum.with_extension("mrc.log");
                if log.exists() {
                    fs::remove_file(&log).map_err(|err| StageError::io(&log, err))?;
                }
            }
        }

        record.image_size = Some([size_x, size_y]);
        record.stack_name = stack_name.clone();
        logger.record(&format!("wrote {}", stack_name));
        Ok(StageOutcome::Completed {
            record,
            algorithm: self.config.program.clone(),
            output: Some(stack_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mrc::read_mrc;
    use crate::processing::mirror::MirrorAxis;
    use crate::stages::testing::{fake_tool, sample_record};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Writes a 2x3 sum whose pixels all equal the tilt's collection index.
    fn writing_runner(calls: Arc<Mutex<Vec<ToolInvocation>>>) -> Arc<dyn ToolRunner> {
        fake_tool(calls, |invocation| {
            let output = &invocation.expected_outputs[0];
            let index: f32 = output
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.rsplit('_').next())
                .and_then(|s| s.parse().ok())
                .unwrap_or(-1.0);
            let data = Array3::from_elem((1, 2, 3), index);
            write_mrc(output, data.view(), &MrcHeader::default(), Some(1.0))
        })
    }

    #[test]
    fn aligned_sums_are_stacked_by_tilt_angle() {
        let dir = tempdir().unwrap();
        let record = sample_record(dir.path());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut stage = FrameAlignmentStage::new(
            FrameAlignmentConfig::default(),
            StackConfig::default(),
            writing_runner(Arc::clone(&calls)),
        );

        let outcome = stage.execute(record).unwrap();
        let StageOutcome::Completed { record, algorithm, output } = outcome else {
            panic!("frame alignment must complete");
        };
        assert_eq!(algorithm, "MotionCor3");
        assert_eq!(output.as_deref(), Some("tomo_001.st"));
        assert_eq!(record.stack_name, "tomo_001.st");
        assert_eq!(record.image_size, Some([3, 2]));
        assert_eq!(calls.lock().unwrap().len(), 3);

        // Collected 0, 3, -3: ascending order is indices 2, 0, 1.
        let stack = read_mrc(dir.path().join("tomo_001").join("tomo_001.st")).unwrap();
        assert_eq!(stack.data.dim(), (3, 2, 3));
        let firsts: Vec<f32> = (0..3).map(|z| stack.data[[z, 0, 0]]).collect();
        assert_eq!(firsts, vec![2.0, 0.0, 1.0]);
        assert_eq!(stack.header.labels, vec!["Frames aligned with MotionCor3.".to_string()]);

        let rawtlt = fs::read_to_string(dir.path().join("tomo_001").join("tomo_001.rawtlt")).unwrap();
        assert_eq!(rawtlt, "-3.000000\n0.000000\n3.000000\n");
        assert!(!dir.path().join("tomo_001").join("MotionCor3").join("001_0.mrc").exists());
    }

    #[test]
    fn gain_reference_and_target_size_are_honoured() {
        let dir = tempdir().unwrap();
        let mut record = sample_record(dir.path());
        record.gainref = Some(dir.path().join("gain.mrc"));
        record.rotate_gain = 1;
        record.image_size = Some([5, 4]);
        record.mirror_stack = Some(MirrorAxis::X);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let config = FrameAlignmentConfig {
            keep_intermediate: true,
            ..Default::default()
        };
        let mut stage = FrameAlignmentStage::new(config, StackConfig::default(), writing_runner(Arc::clone(&calls)));

        let StageOutcome::Completed { record, .. } = stage.execute(record).unwrap() else {
            panic!("frame alignment must complete");
        };
        assert_eq!(record.image_size, Some([5, 4]));
        let stack = read_mrc(record.stack_path()).unwrap();
        assert_eq!(stack.data.dim(), (3, 4, 5));

        let calls = calls.lock().unwrap();
        let args = &calls[0].args;
        let gain = args.iter().position(|a| a == "-Gain").unwrap();
        assert_eq!(args[gain + 3], "1");
        assert!(dir.path().join("tomo_001").join("MotionCor3").join("001_0.mrc").exists());
    }

    #[test]
    fn failing_tool_aborts_the_stage() {
        let dir = tempdir().unwrap();
        let record = sample_record(dir.path());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = fake_tool(calls, |invocation| {
            Err(StageError::Tool {
                tool: invocation.program.clone(),
                detail: "exit status 1".into(),
            })
        });
        let mut stage = FrameAlignmentStage::new(FrameAlignmentConfig::default(), StackConfig::default(), runner);
        assert!(matches!(stage.execute(record), Err(StageError::Tool { .. })));
    }
}
