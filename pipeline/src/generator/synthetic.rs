use anyhow::Context;
use log::info;
use ndarray::{Array2, Array3, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tomocore::io::{write_mrc, write_rawtlt, MrcHeader};
use tomocore::prelude::StageId;
use tomocore::record::{split_name, FrameCount, RecordStore, TomogramRecord};
use tomocore::stages::StackConfig;

pub const SYNTHETIC_ALGORITHM: &str = "synthetic";

/// Configuration for generating synthetic tilt series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub tomograms: usize,
    /// `[x, y]` size of every image.
    pub image_size: [usize; 2],
    pub max_tilt: f64,
    pub tilt_step: f64,
    pub pixelsize: f64,
    /// Dose per tilt, e/Å².
    pub dose_per_tilt: f64,
    /// Exposure time per tilt, seconds.
    pub exposure_time: f64,
    pub frames_per_tilt: u32,
    /// Also write aligned frame stacks for frame-mode filtering.
    pub write_frames: bool,
    /// Folder under the stack directory receiving the frame stacks.
    pub frame_stack_dir: String,
    pub blobs: usize,
    pub noise: f32,
    pub target_defocus: f64,
    pub tilt_axis_angle: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            tomograms: 2,
            image_size: [128, 128],
            max_tilt: 60.0,
            tilt_step: 3.0,
            pixelsize: 2.7,
            dose_per_tilt: 3.0,
            exposure_time: 1.0,
            frames_per_tilt: 8,
            write_frames: false,
            frame_stack_dir: "MotionCor3".into(),
            blobs: 12,
            noise: 0.3,
            target_defocus: -3.0,
            tilt_axis_angle: 85.0,
            seed: 0,
        }
    }
}

impl SyntheticConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.image_size.iter().any(|&n| n == 0) {
            anyhow::bail!("image_size must be positive");
        }
        if self.tilt_step <= 0.0 || self.max_tilt < 0.0 {
            anyhow::bail!("tilt_step must be positive and max_tilt non-negative");
        }
        if self.pixelsize <= 0.0 {
            anyhow::bail!("pixelsize must be positive");
        }
        if self.frames_per_tilt == 0 {
            anyhow::bail!("frames_per_tilt must be at least 1");
        }
        if self.noise < 0.0 || self.dose_per_tilt < 0.0 || self.exposure_time <= 0.0 {
            anyhow::bail!("noise and dose must be non-negative, exposure time positive");
        }
        Ok(())
    }

    /// Tilt angles in dose-symmetric collection order: 0, +s, -s, +2s, -2s, ...
    pub fn collection_order(&self) -> Vec<f64> {
        let steps = (self.max_tilt / self.tilt_step + 1e-9).floor() as usize;
        let mut tilts = vec![0.0];
        for step in 1..=steps {
            let angle = step as f64 * self.tilt_step;
            tilts.push(angle);
            tilts.push(-angle);
        }
        tilts
    }
}

/// A blob in the specimen, in pixels relative to the image centre.
struct Blob {
    x: f64,
    y: f64,
    z: f64,
    sigma: f64,
    weight: f64,
}

fn specimen(config: &SyntheticConfig, rng: &mut StdRng) -> Vec<Blob> {
    let [nx, ny] = config.image_size;
    let (hx, hy) = (nx as f64 / 2.0, ny as f64 / 2.0);
    (0..config.blobs)
        .map(|_| Blob {
            x: rng.gen_range(-0.6..0.6) * hx,
            y: rng.gen_range(-0.8..0.8) * hy,
            z: rng.gen_range(-0.3..0.3) * hx,
            sigma: rng.gen_range(1.0..3.0),
            weight: rng.gen_range(0.5..1.5),
        })
        .collect()
}

/// Projects `blobs` at `tilt` degrees about the y axis.
fn project(config: &SyntheticConfig, blobs: &[Blob], tilt: f64, rng: &mut StdRng) -> Array2<f32> {
    let [nx, ny] = config.image_size;
    let (cx, cy) = (nx as f64 / 2.0, ny as f64 / 2.0);
    let (sin, cos) = tilt.to_radians().sin_cos();
    let centres: Vec<(f64, f64)> = blobs
        .iter()
        .map(|b| (cx + b.x * cos + b.z * sin, cy + b.y))
        .collect();
    Array2::from_shape_fn((ny, nx), |(row, col)| {
        let signal: f64 = blobs
            .iter()
            .zip(centres.iter())
            .map(|(blob, (bx, by))| {
                let d2 = (col as f64 - bx).powi(2) + (row as f64 - by).powi(2);
                blob.weight * (-d2 / (2.0 * blob.sigma * blob.sigma)).exp()
            })
            .sum();
        signal as f32 + jitter(rng, config.noise)
    })
}

fn jitter(rng: &mut StdRng, amplitude: f32) -> f32 {
    (rng.gen::<f32>() * 2.0 - 1.0) * amplitude
}

fn cumulative(step: f64, count: usize) -> Vec<f64> {
    (1..=count).map(|i| step * i as f64).collect()
}

/// Writes synthetic tilt series under `root_dir` and registers them in `store`.
///
/// Every series comes out frame-aligned, so the pipeline picks up at cleaning.
/// Returns the tomogram numbers added.
pub fn generate(
    root_dir: &Path,
    config: &SyntheticConfig,
    stack: &StackConfig,
    store: &mut RecordStore,
) -> anyhow::Result<Vec<u32>> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let collected = config.collection_order();
    let mut added = Vec::new();

    for _ in 0..config.tomograms {
        let tomo_num = store.next_tomo_num();
        let mut record = TomogramRecord {
            tomo_num,
            root_dir: root_dir.to_path_buf(),
            collected_tilts: collected.clone(),
            tilt_axis_angle: config.tilt_axis_angle,
            pixelsize: config.pixelsize,
            image_size: Some(config.image_size),
            cumulative_exposure_time: cumulative(config.exposure_time, collected.len()),
            dose: cumulative(config.dose_per_tilt, collected.len()),
            target_defocus: config.target_defocus,
            n_frames: FrameCount::Uniform(config.frames_per_tilt),
            ..Default::default()
        };
        let tomo_str = record.tomo_str(stack.digits);
        let dir_name = if stack.stack_prefix {
            format!("{}{}", stack.prefix, tomo_str)
        } else {
            tomo_str.clone()
        };
        record.stack_dir = root_dir.join(dir_name);
        record.frame_dir = record.stack_dir.join("frames");
        record.stack_name = stack.stack_name(&record);
        record.raw_stack_name = record.stack_name.clone();
        record.refresh_rawtlt(stack.tilt_order);

        let blobs = specimen(config, &mut rng);
        let [nx, ny] = config.image_size;
        let usable = record.usable_tilts(stack.tilt_order);
        let mut volume = Array3::<f32>::zeros((usable.len(), ny, nx));
        for (slot, (_, tilt)) in usable.iter().enumerate() {
            let image = project(config, &blobs, *tilt, &mut rng);
            volume.index_axis_mut(Axis(0), slot).assign(&image);
        }

        let mut header = MrcHeader::default();
        header.push_label("Synthetic tilt series.");
        write_mrc(record.stack_path(), volume.view(), &header, Some(config.pixelsize))
            .with_context(|| format!("writing stack for tomogram {}", tomo_num))?;
        let (stem, _) = split_name(&record.stack_name);
        write_rawtlt(record.stack_dir.join(format!("{}.rawtlt", stem)), &record.rawtlt)?;

        if config.write_frames {
            write_frame_stacks(config, &record, &tomo_str, &blobs, &mut rng)
                .with_context(|| format!("writing frame stacks for tomogram {}", tomo_num))?;
        }

        record.stages.mark_done(
            StageId::FrameAlignment,
            SYNTHETIC_ALGORITHM.into(),
            Some(record.stack_name.clone()),
        );
        info!("generated tomogram {} with {} tilts", tomo_num, collected.len());
        store.push(record)?;
        added.push(tomo_num);
    }

    if !added.is_empty() {
        store.persist()?;
    }
    Ok(added)
}

/// Frame stacks are numbered by ascending tilt angle, from one.
fn write_frame_stacks(
    config: &SyntheticConfig,
    record: &TomogramRecord,
    tomo_str: &str,
    blobs: &[Blob],
    rng: &mut StdRng,
) -> anyhow::Result<()> {
    let [nx, ny] = config.image_size;
    let mut ascending = record.collected_tilts.clone();
    ascending.sort_by(|a, b| a.total_cmp(b));
    let frame_dir = record.stack_dir.join(&config.frame_stack_dir);
    let share = 1.0 / config.frames_per_tilt as f32;
    let header = MrcHeader::default();

    for (position, tilt) in ascending.iter().enumerate() {
        let clean = project(
            &SyntheticConfig {
                noise: 0.0,
                ..config.clone()
            },
            blobs,
            *tilt,
            rng,
        );
        let mut frames = Array3::<f32>::zeros((config.frames_per_tilt as usize, ny, nx));
        for mut frame in frames.axis_iter_mut(Axis(0)) {
            frame.assign(&clean.mapv(|v| v * share + jitter(rng, config.noise * share)));
        }
        let path = frame_dir.join(format!("{}_{}_Stk.mrc", tomo_str, position + 1));
        write_mrc(&path, frames.view(), &header, Some(config.pixelsize))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::config::WorkflowConfig;
    use crate::workflow::runner::Runner;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tomocore::io::{read_mrc, read_rawtlt};
    use tomocore::prelude::{StageError, StageResult};
    use tomocore::stages::{ToolInvocation, ToolRunner};

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            tomograms: 2,
            image_size: [16, 12],
            max_tilt: 6.0,
            tilt_step: 3.0,
            pixelsize: 2.0,
            frames_per_tilt: 3,
            blobs: 3,
            seed: 7,
            ..Default::default()
        }
    }

    fn no_tools() -> Arc<dyn ToolRunner> {
        Arc::new(|invocation: &ToolInvocation| -> StageResult<()> {
            Err(StageError::Tool {
                tool: invocation.program.clone(),
                detail: "not available in tests".into(),
            })
        })
    }

    #[test]
    fn collection_order_is_dose_symmetric() {
        assert_eq!(small().collection_order(), vec![0.0, 3.0, -3.0, 6.0, -6.0]);
    }

    #[test]
    fn generate_writes_stacks_and_records() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("tomolist.json")).unwrap();
        let added = generate(dir.path(), &small(), &StackConfig::default(), &mut store).unwrap();
        assert_eq!(added, vec![1, 2]);

        let record = store.get(1).unwrap();
        assert_eq!(record.stack_name, "tomo_002.st");
        assert_eq!(record.dose, vec![3.0, 6.0, 9.0, 12.0, 15.0]);
        assert_eq!(record.rawtlt, vec![-6.0, -3.0, 0.0, 3.0, 6.0]);
        assert!(record.stages.frame_alignment.done);

        let volume = read_mrc(record.stack_path()).unwrap();
        assert_eq!(volume.data.dim(), (5, 12, 16));
        assert_eq!(volume.header.pixelsize(), Some(2.0));
        let tilts = read_rawtlt(record.stack_dir.join("tomo_002.rawtlt")).unwrap();
        assert_eq!(tilts, record.rawtlt);

        let reloaded = RecordStore::open(store.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn same_seed_gives_same_data() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        for dir in [&first, &second] {
            let mut store = RecordStore::open(dir.path().join("tomolist.json")).unwrap();
            generate(dir.path(), &small(), &StackConfig::default(), &mut store).unwrap();
        }
        let a = fs::read(first.path().join("tomo_001").join("tomo_001.st")).unwrap();
        let b = fs::read(second.path().join("tomo_001").join("tomo_001.st")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn frame_stacks_follow_ascending_tilts() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("tomolist.json")).unwrap();
        let config = SyntheticConfig {
            tomograms: 1,
            write_frames: true,
            ..small()
        };
        generate(dir.path(), &config, &StackConfig::default(), &mut store).unwrap();
        let frame_dir = dir.path().join("tomo_001").join("MotionCor3");
        for k in 1..=5 {
            let frames = read_mrc(frame_dir.join(format!("001_{}_Stk.mrc", k))).unwrap();
            assert_eq!(frames.data.dim(), (3, 12, 16));
        }
    }

    #[test]
    fn synthetic_series_run_through_the_pipeline() {
        let dir = tempdir().unwrap();
        let mut workflow = WorkflowConfig::from_args(dir.path().to_path_buf());
        workflow.synthetic = SyntheticConfig {
            write_frames: true,
            ..small()
        };
        let mut store = RecordStore::open(workflow.store_path()).unwrap();
        generate(dir.path(), &workflow.synthetic, &workflow.stack, &mut store).unwrap();

        let summary = Runner::new(workflow.clone(), no_tools())
            .execute(&mut store)
            .unwrap();
        assert!(summary.failures.is_empty());
        for record in store.records() {
            assert!(record.stages.cleaning.done);
            assert_eq!(
                record.stages.dose_filter.output.as_deref(),
                Some(format!("tomo_{:03}_dose-filt.st", record.tomo_num).as_str())
            );
            let filtered = format!("tomo_{:03}_dose-filt.st", record.tomo_num);
            assert!(record.stack_dir.join(filtered).exists());
        }

        workflow.dose_filter.filter_frames = true;
        workflow.dose_filter.force = true;
        workflow.dose_filter.dfilt_append = "_frames".into();
        Runner::new(workflow, no_tools()).execute(&mut store).unwrap();
        let filtered = read_mrc(dir.path().join("tomo_001").join("tomo_001_frames.st")).unwrap();
        assert_eq!(filtered.data.dim(), (5, 12, 16));
    }
}
