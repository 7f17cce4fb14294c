//! Volume mirroring about the slice axis or one of the in-plane axes.

use crate::prelude::{StageError, StageResult};
use ndarray::{s, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorAxis {
    /// Columns within each image.
    X,
    /// Rows within each image.
    Y,
    /// Image order along the slice axis.
    Z,
}

impl MirrorAxis {
    /// Parses an optional selector where `none`, `n` and the empty string
    /// disable mirroring.
    pub fn parse_selector(value: &str) -> StageResult<Option<Self>> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "n" | "none" => Ok(None),
            other => other.parse().map(Some),
        }
    }

    fn lane_axis(self) -> Axis {
        match self {
            MirrorAxis::Z => Axis(0),
            MirrorAxis::Y => Axis(1),
            MirrorAxis::X => Axis(2),
        }
    }
}

impl FromStr for MirrorAxis {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(MirrorAxis::X),
            "y" => Ok(MirrorAxis::Y),
            "z" => Ok(MirrorAxis::Z),
            other => Err(StageError::Config(format!(
                "unknown mirror axis `{}`, expected x, y or z",
                other
            ))),
        }
    }
}

impl fmt::Display for MirrorAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MirrorAxis::X => "x",
            MirrorAxis::Y => "y",
            MirrorAxis::Z => "z",
        };
        f.write_str(name)
    }
}

/// Index into the symmetric extension of a sequence of length `len`.
///
/// The extension repeats with period `2 * len`: `a b c c b a a b c ...`.
fn symmetric_index(position: usize, len: usize) -> usize {
    let r = position % (2 * len);
    if r < len {
        r
    } else {
        2 * len - 1 - r
    }
}

/// Folds one lane about `split`.
///
/// The head `[0, split)` is extended symmetrically to the right and fills
/// the last `len - split` slots; the tail `[split, len)` is extended
/// symmetrically to the left and its last `split` values fill the first
/// slots. At the midpoint of an even lane this swaps the two halves.
fn fold_lane(values: &[f32], split: usize, out: &mut Vec<f32>) {
    let len = values.len();
    let (head, tail) = values.split_at(split);
    out.clear();
    if head.is_empty() || tail.is_empty() {
        out.extend_from_slice(values);
        return;
    }
    let t = tail.len();
    for j in 0..split {
        // Position in tail coordinates; negative positions lie in the
        // left extension and reflect back into the tail.
        let q = t as isize - split as isize + j as isize;
        let idx = if q >= 0 {
            q as usize
        } else {
            symmetric_index((-q - 1) as usize, t)
        };
        out.push(tail[idx]);
    }
    out.extend((0..len - split).map(|j| head[symmetric_index(j, split)]));
}

/// Mirrors a `(slices, rows, cols)` volume.
///
/// The slice axis is reversed directly. In-plane axes are folded: every lane
/// is split at `split` (default: half its length), each part is reflected by
/// symmetric extension and the two parts swap places. A split at either end
/// leaves the lane unchanged.
pub fn mirror(volume: ArrayView3<f32>, axis: MirrorAxis, split: Option<usize>) -> StageResult<Array3<f32>> {
    if volume.is_empty() {
        return Ok(volume.to_owned());
    }
    if axis == MirrorAxis::Z {
        return Ok(volume.slice(s![..;-1, .., ..]).to_owned());
    }

    let lane_axis = axis.lane_axis();
    let len = volume.len_of(lane_axis);
    let split = split.unwrap_or(len / 2);
    if split > len {
        return Err(StageError::Config(format!(
            "mirror split point {} exceeds axis length {}",
            split, len
        )));
    }

    let mut mirrored = volume.to_owned();
    let mut folded = Vec::with_capacity(len);
    for mut lane in mirrored.lanes_mut(lane_axis) {
        let values = lane.to_vec();
        fold_lane(&values, split, &mut folded);
        for (dst, src) in lane.iter_mut().zip(folded.iter()) {
            *dst = *src;
        }
    }
    Ok(mirrored)
}
