use crate::io::mrc::{read_header, read_mrc, write_mrc, MrcHeader};
use crate::io::rawtlt::write_rawtlt;
use crate::prelude::{ProcessingStage, StageError, StageId, StageOutcome, StageResult};
use crate::processing::dose_frames::dose_filter_frames;
use crate::processing::dose_stack::dose_filter_stack;
use crate::processing::mirror::mirror;
use crate::processing::resize::resize_image;
use crate::record::{split_name, TomogramRecord};
use crate::stages::config::{DoseFilterConfig, StackConfig};
use crate::telemetry::log::LogManager;
use ndarray::{s, Array3, Axis};

pub const IMAGE_ALGORITHM: &str = "exposure-filter-images";
pub const FRAME_ALGORITHM: &str = "exposure-filter-frames";

/// Exposure filters a tilt series, either on the summed stack or on the
/// aligned frame stacks of each tilt.
pub struct DoseFilterStage {
    config: DoseFilterConfig,
    stack: StackConfig,
    logger: LogManager,
}

/// One usable tilt in stack order.
struct TiltDose {
    /// Index in collection order.
    index: usize,
    /// Cumulative dose after this tilt, pre-exposure included.
    dose: f64,
}

impl DoseFilterStage {
    pub fn new(config: DoseFilterConfig, stack: StackConfig) -> Self {
        Self {
            config,
            stack,
            logger: LogManager::scoped(StageId::DoseFilter.name()),
        }
    }

    fn tilt_doses(&self, record: &TomogramRecord) -> StageResult<Vec<TiltDose>> {
        record
            .usable_tilts(self.stack.tilt_order)
            .into_iter()
            .map(|(index, _)| {
                let dose = record.dose.get(index).ok_or_else(|| {
                    StageError::Config(format!(
                        "tomogram {} has no dose for tilt {}",
                        record.tomo_num, index
                    ))
                })?;
                Ok(TiltDose {
                    index,
                    dose: dose + self.config.preexposure,
                })
            })
            .collect()
    }

    fn filter_images(&self, record: &TomogramRecord, tilts: &[TiltDose]) -> StageResult<(Array3<f32>, MrcHeader)> {
        let volume = read_mrc(record.stack_path())?;
        let doses: Vec<f64> = tilts.iter().map(|t| t.dose).collect();
        let filtered = dose_filter_stack(
            volume.data.view(),
            record.pixelsize,
            &doses,
            &self.config.params(),
        )?;
        Ok((filtered, volume.header))
    }

    fn filter_frames(
        &self,
        record: &TomogramRecord,
        tilts: &[TiltDose],
        logger: &LogManager,
    ) -> StageResult<(Array3<f32>, MrcHeader)> {
        let [size_x, size_y] = record.image_size.ok_or_else(|| {
            StageError::Config(format!(
                "tomogram {} needs an image size to filter frames",
                record.tomo_num
            ))
        })?;
        let tomo_str = record.tomo_str(self.stack.digits);
        let frame_dir = record.stack_dir.join(&self.config.frame_stack_dir);

        // Frame stacks are numbered by ascending collected tilt, from one.
        let mut ascending: Vec<usize> = (0..record.collected_tilts.len()).collect();
        ascending.sort_by(|&a, &b| record.collected_tilts[a].total_cmp(&record.collected_tilts[b]));

        let params = self.config.params();
        let mut stack = Array3::<f32>::zeros((tilts.len(), size_y, size_x));
        for (slot, tilt) in tilts.iter().enumerate() {
            let frame_idx = ascending
                .iter()
                .position(|&i| i == tilt.index)
                .map_or(0, |p| p + 1);
            let path = frame_dir.join(format!("{}_{}_Stk.mrc", tomo_str, frame_idx));

            let initial = match tilt.index {
                0 => 0.0,
                i => record.dose[i - 1],
            } + self.config.preexposure;
            let n_frames = record.n_frames.for_tilt(tilt.index)?;
            if n_frames == 0 {
                return Err(StageError::Config(format!(
                    "tomogram {} records zero frames for tilt {}",
                    record.tomo_num, tilt.index
                )));
            }
            let per_frame = (tilt.dose - initial) / f64::from(n_frames);

            let frames = read_mrc(&path)?;
            let image = dose_filter_frames(frames.data.view(), record.pixelsize, initial, per_frame, &params)?;
            let image = resize_image(image.view(), (size_x, size_y), true);
            let image = match record.mirror_stack {
                Some(axis) => mirror(image.insert_axis(Axis(0)).view(), axis, None)?
                    .index_axis_move(Axis(0), 0),
                None => image,
            };
            stack.slice_mut(s![slot, .., ..]).assign(&image);
        }

        let header = match read_header(record.stack_path()) {
            Ok(header) => header,
            Err(StageError::MissingResource(path)) => {
                logger.warn(&format!("{} not found, writing a fresh header", path.display()));
                MrcHeader::default()
            }
            Err(err) => return Err(err),
        };
        Ok((stack, header))
    }
}

impl ProcessingStage for DoseFilterStage {
    fn id(&self) -> StageId {
        StageId::DoseFilter
    }

    fn force(&self) -> bool {
        self.config.force
    }

    fn execute(&mut self, mut record: TomogramRecord) -> StageResult<StageOutcome> {
        let logger = self.logger.for_tomogram(record.tomo_num);
        if record.stack_name.is_empty() {
            return Err(StageError::Config(format!(
                "tomogram {} has no stack to filter",
                record.tomo_num
            )));
        }
        let tilts = self.tilt_doses(&record)?;

        let (stem, ext) = split_name(&record.stack_name);
        let filtered_name = format!("{}{}{}", stem, self.config.dfilt_append, ext);
        let rate = match (record.dose.first(), record.cumulative_exposure_time.first()) {
            (Some(dose), Some(time)) if *time > 0.0 => dose / time,
            _ => 0.0,
        };

        let (stack, mut header, source, algorithm) = if self.config.filter_frames {
            logger.record("filtering frame stacks");
            let (stack, header) = self.filter_frames(&record, &tilts, &logger)?;
            (stack, header, "frames", FRAME_ALGORITHM)
        } else {
            logger.record(&format!("filtering {}", record.stack_name));
            let (stack, header) = self.filter_images(&record, &tilts)?;
            (stack, header, "images", IMAGE_ALGORITHM)
        };
        header.push_label(&format!(
            "Exposure filtered on {} with {:.4} e/(A^2)/s",
            source, rate
        ));
        write_mrc(
            record.stack_dir.join(&filtered_name),
            stack.view(),
            &header,
            Some(record.pixelsize),
        )?;

        record.refresh_rawtlt(self.stack.tilt_order);
        write_rawtlt(
            record.stack_dir.join(format!("{}{}.rawtlt", stem, self.config.dfilt_append)),
            &record.rawtlt,
        )?;
        logger.record(&format!("wrote {}", filtered_name));

        Ok(StageOutcome::Completed {
            record,
            algorithm: algorithm.to_string(),
            output: Some(filtered_name),
        })
    }
}
