//! Creation of tomogram records from acquisition metadata documents.

use crate::io::mdoc::{read_mdoc, Acquisition};
use crate::prelude::{StageError, StageResult};
use crate::processing::mirror::MirrorAxis;
use crate::record::{FrameCount, RecordStore, TomogramRecord};
use crate::stages::config::StackConfig;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const VALUE_TOLERANCE: f64 = 1e-6;

/// Values that replace what the metadata documents report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub tilt_axis_angle: Option<f64>,
    /// Pixel size in Å.
    pub pixelsize: Option<f64>,
    /// Dose rate in e/pixel/s.
    pub dose_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Folder holding new `.mdoc` files and raw stacks, relative to the root.
    pub raw_stack_dir: PathBuf,
    /// Folder holding unsorted frames, relative to the root.
    pub raw_frame_dir: PathBuf,
    pub raw_stack_ext: String,
    pub gainref: Option<PathBuf>,
    pub defects_file: Option<PathBuf>,
    pub rotate_gain: i32,
    pub flip_gain: i32,
    /// `x`, `y`, `z` or `none`.
    pub mirror_stack: String,
    pub ignore_raw_stacks: bool,
    pub ignore_missing_frames: bool,
    pub overrides: Overrides,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            raw_stack_dir: PathBuf::from("mdoc"),
            raw_frame_dir: PathBuf::from("frames"),
            raw_stack_ext: ".mrc".into(),
            gainref: None,
            defects_file: None,
            rotate_gain: 0,
            flip_gain: 0,
            mirror_stack: "none".into(),
            ignore_raw_stacks: true,
            ignore_missing_frames: false,
            overrides: Overrides::default(),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> StageResult<()> {
        MirrorAxis::parse_selector(&self.mirror_stack)?;
        for (name, value) in [
            ("pixelsize", self.overrides.pixelsize),
            ("dose_rate", self.overrides.dose_rate),
        ] {
            if let Some(value) = value {
                if !(value > 0.0) {
                    return Err(StageError::Config(format!(
                        "override {} must be positive, got {}",
                        name, value
                    )));
                }
            }
        }
        Ok(())
    }

    /// Raw stack extension with its leading dot.
    pub fn stack_ext(&self) -> String {
        if self.raw_stack_ext.starts_with('.') || self.raw_stack_ext.is_empty() {
            self.raw_stack_ext.clone()
        } else {
            format!(".{}", self.raw_stack_ext)
        }
    }
}

/// Builds a record from the metadata document at `mdoc_path`.
///
/// Exposures are ordered by acquisition time before exposure times and doses
/// are accumulated. Only reads the document; no files are moved.
pub fn ingest_mdoc(
    mdoc_path: &Path,
    root_dir: &Path,
    ingest: &IngestConfig,
    stack: &StackConfig,
) -> StageResult<TomogramRecord> {
    let mdoc_name = mdoc_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StageError::Config(format!("{} is not a file", mdoc_path.display())))?;
    let ext = ingest.stack_ext();
    let num_str = mdoc_name
        .strip_prefix(stack.prefix.as_str())
        .and_then(|rest| rest.strip_suffix(".mdoc"))
        .and_then(|rest| rest.strip_suffix(ext.as_str()))
        .map(str::to_string)
        .ok_or_else(|| {
            StageError::Config(format!(
                "`{}` does not match {}<number>{}.mdoc",
                mdoc_name, stack.prefix, ext
            ))
        })?;
    let tomo_num: u32 = num_str.parse().map_err(|_| {
        StageError::Config(format!("`{}` has no tomogram number", mdoc_name))
    })?;

    let document = read_mdoc(mdoc_path)?;
    let mut acquisitions = document.acquisitions;
    if acquisitions.is_empty() {
        return Err(StageError::Metadata(format!("{} lists no exposures", mdoc_name)));
    }
    if let Some(undated) = acquisitions.iter().find(|a| a.date_time.is_none()) {
        return Err(StageError::Metadata(format!(
            "{}: exposure {} has no DateTime",
            mdoc_name, undated.z_value
        )));
    }
    acquisitions.sort_by_key(|a| a.date_time);

    let collected_tilts = acquisitions
        .iter()
        .map(|a| {
            a.tilt_angle.ok_or_else(|| {
                StageError::Metadata(format!("{}: exposure {} has no TiltAngle", mdoc_name, a.z_value))
            })
        })
        .collect::<StageResult<Vec<f64>>>()?;

    let tilt_axis_angle = match ingest
        .overrides
        .tilt_axis_angle
        .or(document.tilt_axis_angle)
        .or_else(|| acquisitions.iter().find_map(|a| a.tilt_axis_angle))
    {
        Some(angle) => angle,
        None => {
            warn!("{} reports no tilt axis angle, using 0", mdoc_name);
            0.0
        }
    };

    let pixelsize = match ingest.overrides.pixelsize {
        Some(pixelsize) => pixelsize,
        None => consistent_pixelsize(&acquisitions, document.pixel_spacing, &mdoc_name)?,
    };

    let cumulative_exposure_time = cumulative(acquisitions.iter().map(|a| a.exposure_time.unwrap_or(0.0)));
    let dose = match ingest.overrides.dose_rate {
        Some(rate) => cumulative_exposure_time
            .iter()
            .map(|time| time * rate / (pixelsize * pixelsize))
            .collect(),
        None => {
            let doses = acquisitions
                .iter()
                .map(|a| {
                    a.exposure_dose.ok_or_else(|| {
                        StageError::Metadata(format!(
                            "{}: exposure {} has no ExposureDose",
                            mdoc_name, a.z_value
                        ))
                    })
                })
                .collect::<StageResult<Vec<f64>>>()?;
            cumulative(doses.into_iter())
        }
    };

    let target_defocus = acquisitions
        .first()
        .and_then(|a| a.target_defocus)
        .unwrap_or(0.0);
    if acquisitions.iter().any(|a| {
        (a.target_defocus.unwrap_or(0.0) - target_defocus).abs() > VALUE_TOLERANCE
    }) {
        warn!(
            "{} has varying target defocus, keeping {:.2}",
            mdoc_name, target_defocus
        );
    }

    let counts: Vec<u32> = acquisitions
        .iter()
        .map(|a| a.num_sub_frames.unwrap_or(1))
        .collect();
    let n_frames = if counts.windows(2).all(|w| w[0] == w[1]) {
        FrameCount::Uniform(counts[0])
    } else {
        FrameCount::PerTilt(counts)
    };

    let frame_names = acquisitions
        .iter()
        .map(|a| {
            a.sub_frame_path
                .as_deref()
                .map(frame_basename)
                .unwrap_or_default()
        })
        .collect();

    let stack_dir = root_dir.join(format!("{}{}", stack.prefix, num_str));
    let mut record = TomogramRecord {
        tomo_num,
        root_dir: root_dir.to_path_buf(),
        frame_dir: stack_dir.join("frames"),
        stack_dir,
        mdoc_name,
        frame_names,
        raw_stack_name: format!("{}{}{}", stack.prefix, num_str, ext),
        collected_tilts,
        tilt_axis_angle,
        pixelsize,
        cumulative_exposure_time,
        dose,
        target_defocus,
        n_frames,
        gainref: ingest.gainref.clone(),
        defects_file: ingest.defects_file.clone(),
        rotate_gain: ingest.rotate_gain,
        flip_gain: ingest.flip_gain,
        mirror_stack: MirrorAxis::parse_selector(&ingest.mirror_stack)?,
        ..Default::default()
    };
    record.refresh_rawtlt(stack.tilt_order);
    Ok(record)
}

fn consistent_pixelsize(
    acquisitions: &[Acquisition],
    fallback: Option<f64>,
    mdoc_name: &str,
) -> StageResult<f64> {
    let sizes: Vec<f64> = acquisitions
        .iter()
        .filter_map(|a| a.pixel_spacing.or(fallback))
        .collect();
    let first = sizes.first().copied().ok_or_else(|| {
        StageError::Metadata(format!("{} reports no PixelSpacing", mdoc_name))
    })?;
    if sizes.iter().any(|size| (size - first).abs() > VALUE_TOLERANCE) {
        return Err(StageError::Config(format!(
            "{} has varying pixel sizes; set overrides.pixelsize",
            mdoc_name
        )));
    }
    Ok(first)
}

fn cumulative<I: Iterator<Item = f64>>(values: I) -> Vec<f64> {
    values
        .scan(0.0, |total, value| {
            *total += value;
            Some(*total)
        })
        .collect()
}

/// File name of a frame path recorded on either Windows or Linux.
fn frame_basename(path: &str) -> String {
    path.replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Moves the metadata document, raw stack and frames of a freshly ingested
/// record into its stack directory.
///
/// A missing raw stack clears `raw_stack_name`; missing frames are reported.
/// When a move fails the files already moved are put back, so the series is
/// left in the raw folders as it was found.
pub fn relocate_inputs(record: &mut TomogramRecord, ingest: &IngestConfig) -> StageResult<()> {
    let raw_dir = record.root_dir.join(&ingest.raw_stack_dir);
    let frame_src = record.root_dir.join(&ingest.raw_frame_dir);
    fs::create_dir_all(&record.frame_dir).map_err(|err| StageError::io(&record.frame_dir, err))?;

    let mut moves = Vec::new();
    let raw_stack = raw_dir.join(&record.raw_stack_name);
    let has_raw_stack = !record.raw_stack_name.is_empty() && raw_stack.is_file();
    if has_raw_stack {
        moves.push((raw_stack, record.stack_dir.join(&record.raw_stack_name)));
    } else {
        warn!("{} not moved as it does not exist", raw_stack.display());
    }
    for name in record.frame_names.iter().filter(|n| !n.is_empty()) {
        let source = frame_src.join(name);
        if source.is_file() {
            moves.push((source, record.frame_dir.join(name)));
        } else {
            warn!("frame {} missing for tomogram {}", name, record.tomo_num);
        }
    }
    // Moved last: the document marks the series as pending.
    moves.push((raw_dir.join(&record.mdoc_name), record.stack_dir.join(&record.mdoc_name)));

    let mut moved: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(moves.len());
    for (from, to) in moves {
        if let Err(err) = move_file(&from, &to) {
            for (back_to, back_from) in moved.iter().rev() {
                if let Err(undo) = fs::rename(back_from, back_to) {
                    warn!("could not restore {}: {}", back_to.display(), undo);
                }
            }
            return Err(err);
        }
        moved.push((from, to));
    }

    if !has_raw_stack {
        record.raw_stack_name.clear();
    }
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> StageResult<()> {
    fs::rename(from, to).map_err(|err| StageError::io(from, err))
}

/// Ingests every new `.mdoc` file of the raw stack folder into `store`.
///
/// Returns the tomogram numbers added. Series already in the store are left
/// alone; series with missing inputs are skipped unless the configuration
/// says to ignore them. A document that fails to parse or whose inputs cannot
/// be moved is logged and left in place. The store is persisted after every
/// series it gains, so a later failure never loses relocated data.
pub fn ingest_new_stacks(
    root_dir: &Path,
    ingest: &IngestConfig,
    stack: &StackConfig,
    store: &mut RecordStore,
) -> StageResult<Vec<u32>> {
    let raw_dir = root_dir.join(&ingest.raw_stack_dir);
    let mut mdocs: Vec<PathBuf> = fs::read_dir(&raw_dir)
        .map_err(|err| StageError::io(&raw_dir, err))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "mdoc"))
        .collect();
    mdocs.sort();
    info!("{} metadata documents found in {}", mdocs.len(), raw_dir.display());

    let frame_src = root_dir.join(&ingest.raw_frame_dir);
    let mut added = Vec::new();
    for mdoc in mdocs {
        let mut record = match ingest_mdoc(&mdoc, root_dir, ingest, stack) {
            Ok(record) => record,
            Err(err) => {
                warn!("skipping {}: {}", mdoc.display(), err);
                continue;
            }
        };
        if store.position(record.tomo_num).is_some() {
            warn!("tomogram {} already registered, leaving {}", record.tomo_num, mdoc.display());
            continue;
        }
        if !ingest.ignore_raw_stacks && !raw_dir.join(&record.raw_stack_name).is_file() {
            warn!("raw stack for tomogram {} missing, skipping", record.tomo_num);
            continue;
        }
        let missing_frame = record
            .frame_names
            .iter()
            .filter(|name| !name.is_empty())
            .find(|name| !frame_src.join(name.as_str()).is_file());
        if let Some(name) = missing_frame {
            warn!("frame `{}` missing from tomogram {}", name, record.tomo_num);
            if !ingest.ignore_missing_frames {
                continue;
            }
        }
        if let Err(err) = relocate_inputs(&mut record, ingest) {
            warn!("inputs of tomogram {} not moved: {}", record.tomo_num, err);
            continue;
        }
        let tomo_num = record.tomo_num;
        store.push(record)?;
        store.persist()?;
        added.push(tomo_num);
    }
    Ok(added)
}
