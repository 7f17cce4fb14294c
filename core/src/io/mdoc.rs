//! Parser for acquisition metadata documents (`.mdoc`).
//!
//! Only the fields the pipeline consumes are kept. Unknown keys are ignored.

use crate::prelude::{StageError, StageResult};
use chrono::NaiveDateTime;
use std::fs;
use std::path::Path;

const DATE_FORMATS: [&str; 2] = ["%d-%b-%y %H:%M:%S", "%d-%b-%Y %H:%M:%S"];

/// One exposure, i.e. one `[ZValue = n]` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acquisition {
    pub z_value: usize,
    pub tilt_angle: Option<f64>,
    pub exposure_dose: Option<f64>,
    pub exposure_time: Option<f64>,
    pub target_defocus: Option<f64>,
    pub sub_frame_path: Option<String>,
    pub num_sub_frames: Option<u32>,
    pub pixel_spacing: Option<f64>,
    pub date_time: Option<NaiveDateTime>,
    pub tilt_axis_angle: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MdocDocument {
    /// Tilt-axis angle from the document title line, if present.
    pub tilt_axis_angle: Option<f64>,
    pub pixel_spacing: Option<f64>,
    pub acquisitions: Vec<Acquisition>,
}

pub fn read_mdoc<P: AsRef<Path>>(path: P) -> StageResult<MdocDocument> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| StageError::io(path, err))?;
    parse_mdoc(&contents)
        .map_err(|err| StageError::Metadata(format!("{}: {}", path.display(), err)))
}

pub fn parse_mdoc(contents: &str) -> Result<MdocDocument, String> {
    let mut document = MdocDocument::default();
    let mut current: Option<Acquisition> = None;

    for (number, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(angle) = title_tilt_axis(section) {
                let angle = angle.map_err(|e| format!("line {}: {}", number + 1, e))?;
                document.tilt_axis_angle.get_or_insert(angle);
                continue;
            }
            if let Some((key, value)) = section.split_once('=') {
                if key.trim() == "ZValue" {
                    if let Some(done) = current.take() {
                        document.acquisitions.push(done);
                    }
                    let z_value = value
                        .trim()
                        .parse()
                        .map_err(|_| format!("line {}: bad ZValue `{}`", number + 1, value.trim()))?;
                    current = Some(Acquisition {
                        z_value,
                        ..Default::default()
                    });
                    continue;
                }
            }
            // Any other section ends the current block.
            if let Some(done) = current.take() {
                document.acquisitions.push(done);
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        let at = |e: String| format!("line {}: {}", number + 1, e);
        match current.as_mut() {
            Some(acq) => match key {
                "TiltAngle" => acq.tilt_angle = Some(number_field(key, value).map_err(at)?),
                "ExposureDose" => acq.exposure_dose = Some(number_field(key, value).map_err(at)?),
                "ExposureTime" => acq.exposure_time = Some(number_field(key, value).map_err(at)?),
                "TargetDefocus" => {
                    acq.target_defocus = Some(number_field(key, value).map_err(at)?)
                }
                "NumSubFrames" => {
                    acq.num_sub_frames = Some(
                        value
                            .parse()
                            .map_err(|_| at(format!("bad {} `{}`", key, value)))?,
                    )
                }
                "PixelSpacing" => acq.pixel_spacing = Some(number_field(key, value).map_err(at)?),
                "TiltAxisAngle" => {
                    acq.tilt_axis_angle = Some(number_field(key, value).map_err(at)?)
                }
                "SubFramePath" => acq.sub_frame_path = Some(value.to_string()),
                "DateTime" => acq.date_time = Some(parse_date_time(value).map_err(at)?),
                _ => {}
            },
            None => match key {
                "PixelSpacing" => {
                    document.pixel_spacing = Some(number_field(key, value).map_err(at)?)
                }
                "TiltAxisAngle" => {
                    document.tilt_axis_angle = Some(number_field(key, value).map_err(at)?)
                }
                _ => {}
            },
        }
    }
    if let Some(done) = current {
        document.acquisitions.push(done);
    }
    Ok(document)
}

/// Extracts the angle from a title such as
/// `T = SerialEM: ...  Tilt axis angle = 85.3, binning = 1`.
fn title_tilt_axis(section: &str) -> Option<Result<f64, String>> {
    const MARKER: &str = "Tilt axis angle =";
    let start = section.find(MARKER)? + MARKER.len();
    let rest = &section[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    let value = rest[..end].trim();
    Some(
        value
            .parse()
            .map_err(|_| format!("bad tilt axis angle `{}`", value)),
    )
}

fn number_field(key: &str, value: &str) -> Result<f64, String> {
    // Multi-valued keys keep their first entry.
    let first = value.split_whitespace().next().unwrap_or("");
    first
        .parse()
        .map_err(|_| format!("bad {} `{}`", key, value))
}

fn parse_date_time(value: &str) -> Result<NaiveDateTime, String> {
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&normalized, format).ok())
        .ok_or_else(|| format!("bad DateTime `{}`", value))
}
