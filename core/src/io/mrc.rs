//! Reader and writer for MRC image containers.
//!
//! Volumes are exposed slice-first as `(nz, ny, nx)` with x varying fastest,
//! matching the on-disk pixel order.

use crate::math::stats::StatsHelper;
use crate::prelude::{StageError, StageResult};
use log::debug;
use ndarray::{Array3, ArrayView3};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub const HEADER_LEN: usize = 1024;
pub const LABEL_LEN: usize = 80;
pub const MAX_LABELS: usize = 10;

const MAP_TAG: &[u8; 4] = b"MAP ";
const LITTLE_ENDIAN_STAMP: [u8; 4] = [0x44, 0x41, 0x00, 0x00];
const BIG_ENDIAN_MARKER: u8 = 0x11;

/// Pixel encodings this codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelMode {
    Int8 = 0,
    Int16 = 1,
    Float32 = 2,
}

impl PixelMode {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PixelMode::Int8),
            1 => Some(PixelMode::Int16),
            2 => Some(PixelMode::Float32),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelMode::Int8 => 1,
            PixelMode::Int16 => 2,
            PixelMode::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MrcHeader {
    pub nx: i32,
    pub ny: i32,
    pub nz: i32,
    pub mode: PixelMode,
    pub start: [i32; 3],
    pub grid: [i32; 3],
    /// Cell edge lengths in Å.
    pub cell: [f32; 3],
    pub cell_angles: [f32; 3],
    pub axis_map: [i32; 3],
    pub amin: f32,
    pub amax: f32,
    pub amean: f32,
    pub ispg: i16,
    pub nsymbt: i16,
    pub creatid: i16,
    pub nint: i16,
    pub nreal: i16,
    /// idtype, lens, nd1, nd2, vd1, vd2.
    pub data_type: [i16; 6],
    pub tilt_angles: [f32; 6],
    pub origin: [f32; 3],
    pub rms: f32,
    pub labels: Vec<String>,
    /// Raw extended header; its length is written as `next`.
    pub extended: Vec<u8>,
}

impl Default for MrcHeader {
    fn default() -> Self {
        Self {
            nx: 1,
            ny: 1,
            nz: 1,
            mode: PixelMode::Float32,
            start: [0; 3],
            grid: [1; 3],
            cell: [1.0; 3],
            cell_angles: [90.0; 3],
            axis_map: [1, 2, 3],
            amin: 0.0,
            amax: 0.0,
            amean: 0.0,
            ispg: 0,
            nsymbt: 0,
            creatid: 0,
            nint: 0,
            nreal: 0,
            data_type: [0; 6],
            tilt_angles: [0.0; 6],
            origin: [0.0; 3],
            rms: 0.0,
            labels: Vec::new(),
            extended: Vec::new(),
        }
    }
}

impl MrcHeader {
    /// Pixel size along x in Å, when the sampling grid is set.
    pub fn pixelsize(&self) -> Option<f64> {
        if self.grid[0] > 0 && self.cell[0] > 0.0 {
            Some(f64::from(self.cell[0]) / f64::from(self.grid[0]))
        } else {
            None
        }
    }

    /// Appends one label per non-empty line, trimmed to 80 characters.
    /// Only the newest ten labels are kept.
    pub fn push_label(&mut self, label: &str) {
        for line in label.lines() {
            let clean: String = line.trim().chars().take(LABEL_LEN).collect();
            if !clean.is_empty() {
                self.labels.push(clean);
            }
        }
        if self.labels.len() > MAX_LABELS {
            let excess = self.labels.len() - MAX_LABELS;
            self.labels.drain(..excess);
        }
    }

    fn dims(&self, path: &Path) -> StageResult<(usize, usize, usize)> {
        let dim = |value: i32, name: &str| {
            usize::try_from(value).map_err(|_| StageError::Format {
                path: path.to_path_buf(),
                reason: format!("negative {} ({})", name, value),
            })
        };
        Ok((dim(self.nz, "nz")?, dim(self.ny, "ny")?, dim(self.nx, "nx")?))
    }

    fn parse(bytes: &[u8], path: &Path) -> StageResult<(Self, usize)> {
        if bytes.len() < HEADER_LEN {
            return Err(StageError::Format {
                path: path.to_path_buf(),
                reason: format!("{} bytes is shorter than the header", bytes.len()),
            });
        }
        let order = if bytes[212] == BIG_ENDIAN_MARKER {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        };
        let field = FieldReader { bytes, order };

        let mode_code = field.i32(12);
        let mode = PixelMode::from_code(mode_code).ok_or_else(|| {
            StageError::Config(format!(
                "unsupported MRC pixel mode {} in {}",
                mode_code,
                path.display()
            ))
        })?;
        let next = field.i32(92);
        let next = usize::try_from(next).map_err(|_| StageError::Format {
            path: path.to_path_buf(),
            reason: format!("negative extended header size {}", next),
        })?;

        let label_count = usize::try_from(field.i32(220)).unwrap_or(0).min(MAX_LABELS);
        let labels = (0..label_count)
            .map(|i| {
                let start = 224 + i * LABEL_LEN;
                let raw = &bytes[start..start + LABEL_LEN];
                String::from_utf8_lossy(raw)
                    .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
                    .to_string()
            })
            .collect();

        let header = MrcHeader {
            nx: field.i32(0),
            ny: field.i32(4),
            nz: field.i32(8),
            mode,
            start: [field.i32(16), field.i32(20), field.i32(24)],
            grid: [field.i32(28), field.i32(32), field.i32(36)],
            cell: [field.f32(40), field.f32(44), field.f32(48)],
            cell_angles: [field.f32(52), field.f32(56), field.f32(60)],
            axis_map: [field.i32(64), field.i32(68), field.i32(72)],
            amin: field.f32(76),
            amax: field.f32(80),
            amean: field.f32(84),
            ispg: field.i16(88),
            nsymbt: field.i16(90),
            creatid: field.i16(96),
            nint: field.i16(128),
            nreal: field.i16(130),
            data_type: [
                field.i16(160),
                field.i16(162),
                field.i16(164),
                field.i16(166),
                field.i16(168),
                field.i16(170),
            ],
            tilt_angles: [
                field.f32(172),
                field.f32(176),
                field.f32(180),
                field.f32(184),
                field.f32(188),
                field.f32(192),
            ],
            origin: [field.f32(196), field.f32(200), field.f32(204)],
            rms: field.f32(216),
            labels,
            extended: Vec::new(),
        };
        Ok((header, next))
    }

    /// Serializes the fixed 1024-byte header in little-endian order.
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = FieldWriter {
            bytes: [0u8; HEADER_LEN],
        };
        out.i32(0, self.nx);
        out.i32(4, self.ny);
        out.i32(8, self.nz);
        out.i32(12, self.mode as i32);
        for i in 0..3 {
            out.i32(16 + 4 * i, self.start[i]);
            out.i32(28 + 4 * i, self.grid[i]);
            out.f32(40 + 4 * i, self.cell[i]);
            out.f32(52 + 4 * i, self.cell_angles[i]);
            out.i32(64 + 4 * i, self.axis_map[i]);
            out.f32(196 + 4 * i, self.origin[i]);
        }
        out.f32(76, self.amin);
        out.f32(80, self.amax);
        out.f32(84, self.amean);
        out.i16(88, self.ispg);
        out.i16(90, self.nsymbt);
        out.i32(92, self.extended.len() as i32);
        out.i16(96, self.creatid);
        out.i16(128, self.nint);
        out.i16(130, self.nreal);
        for (i, value) in self.data_type.iter().enumerate() {
            out.i16(160 + 2 * i, *value);
        }
        for (i, value) in self.tilt_angles.iter().enumerate() {
            out.f32(172 + 4 * i, *value);
        }
        out.bytes[208..212].copy_from_slice(MAP_TAG);
        out.bytes[212..216].copy_from_slice(&LITTLE_ENDIAN_STAMP);
        out.f32(216, self.rms);

        let labels = &self.labels[self.labels.len().saturating_sub(MAX_LABELS)..];
        out.i32(220, labels.len() as i32);
        for (i, label) in labels.iter().enumerate() {
            let start = 224 + i * LABEL_LEN;
            let raw = label.as_bytes();
            let len = raw.len().min(LABEL_LEN);
            out.bytes[start..start + len].copy_from_slice(&raw[..len]);
        }
        out.bytes
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl FieldReader<'_> {
    fn word<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.bytes[offset..offset + N]);
        raw
    }

    fn i32(&self, offset: usize) -> i32 {
        let raw = self.word::<4>(offset);
        match self.order {
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Big => i32::from_be_bytes(raw),
        }
    }

    fn i16(&self, offset: usize) -> i16 {
        let raw = self.word::<2>(offset);
        match self.order {
            ByteOrder::Little => i16::from_le_bytes(raw),
            ByteOrder::Big => i16::from_be_bytes(raw),
        }
    }

    fn f32(&self, offset: usize) -> f32 {
        f32::from_bits(self.i32(offset) as u32)
    }
}

struct FieldWriter {
    bytes: [u8; HEADER_LEN],
}

impl FieldWriter {
    fn i32(&mut self, offset: usize, value: i32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn i16(&mut self, offset: usize, value: i16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, offset: usize, value: f32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// A decoded container: header plus pixels as `(nz, ny, nx)`.
#[derive(Debug, Clone)]
pub struct MrcVolume {
    pub header: MrcHeader,
    pub data: Array3<f32>,
}

/// Reads only the fixed header of `path`.
pub fn read_header<P: AsRef<Path>>(path: P) -> StageResult<MrcHeader> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|err| StageError::io(path, err))?;
    let mut bytes = vec![0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let read = file
            .read(&mut bytes[filled..])
            .map_err(|err| StageError::io(path, err))?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    bytes.truncate(filled);
    MrcHeader::parse(&bytes, path).map(|(header, _)| header)
}

pub fn read_mrc<P: AsRef<Path>>(path: P) -> StageResult<MrcVolume> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|err| StageError::io(path, err))?;
    let (mut header, next) = MrcHeader::parse(&bytes, path)?;
    let order = if bytes[212] == BIG_ENDIAN_MARKER {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };

    let (nz, ny, nx) = header.dims(path)?;
    let oversized = || StageError::Format {
        path: path.to_path_buf(),
        reason: format!("dimensions {} x {} x {} overflow the address space", nx, ny, nz),
    };
    let count = nz
        .checked_mul(ny)
        .and_then(|n| n.checked_mul(nx))
        .ok_or_else(oversized)?;
    let data_len = count
        .checked_mul(header.mode.bytes_per_pixel())
        .ok_or_else(oversized)?;
    let data_start = HEADER_LEN.checked_add(next).ok_or_else(oversized)?;
    let data_end = data_start.checked_add(data_len).ok_or_else(oversized)?;
    if bytes.len() < data_end {
        return Err(StageError::Format {
            path: path.to_path_buf(),
            reason: format!(
                "expected {} data bytes after offset {}, found {}",
                data_len,
                data_start,
                bytes.len().saturating_sub(data_start)
            ),
        });
    }
    header.extended = bytes[HEADER_LEN..data_start].to_vec();

    let raw = &bytes[data_start..data_end];
    let pixels: Vec<f32> = match header.mode {
        PixelMode::Int8 => raw.iter().map(|&b| f32::from(b as i8)).collect(),
        PixelMode::Int16 => raw
            .chunks_exact(2)
            .map(|c| {
                let word = [c[0], c[1]];
                f32::from(match order {
                    ByteOrder::Little => i16::from_le_bytes(word),
                    ByteOrder::Big => i16::from_be_bytes(word),
                })
            })
            .collect(),
        PixelMode::Float32 => raw
            .chunks_exact(4)
            .map(|c| {
                let word = [c[0], c[1], c[2], c[3]];
                match order {
                    ByteOrder::Little => f32::from_le_bytes(word),
                    ByteOrder::Big => f32::from_be_bytes(word),
                }
            })
            .collect(),
    };
    let data = Array3::from_shape_vec((nz, ny, nx), pixels).map_err(|err| StageError::Format {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    debug!("read {} ({} x {} x {})", path.display(), nx, ny, nz);
    Ok(MrcVolume { header, data })
}

/// Writes `data` as 32-bit floats.
///
/// Dimensions, sampling grid and density statistics are taken from `data`;
/// everything else comes from `template`. The cell is scaled to `pixelsize`
/// when given, otherwise to the template's pixel size.
pub fn write_mrc<P: AsRef<Path>>(
    path: P,
    data: ArrayView3<f32>,
    template: &MrcHeader,
    pixelsize: Option<f64>,
) -> StageResult<()> {
    let path = path.as_ref();
    let (nz, ny, nx) = data.dim();
    let mut header = template.clone();
    header.nx = nx as i32;
    header.ny = ny as i32;
    header.nz = nz as i32;
    header.mode = PixelMode::Float32;
    header.grid = [nx as i32, ny as i32, nz as i32];
    let pixelsize = pixelsize.or_else(|| template.pixelsize()).unwrap_or(1.0) as f32;
    header.cell = [
        nx as f32 * pixelsize,
        ny as f32 * pixelsize,
        nz as f32 * pixelsize,
    ];

    let (amin, amax, amean) = StatsHelper::summary(data.iter());
    let deviations: Vec<f32> = data.iter().map(|v| v - amean).collect();
    header.amin = amin;
    header.amax = amax;
    header.amean = amean;
    header.rms = StatsHelper::rms(&deviations);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| StageError::io(parent, err))?;
        }
    }
    let file = File::create(path).map_err(|err| StageError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&header.to_bytes())
        .and_then(|_| writer.write_all(&header.extended))
        .map_err(|err| StageError::io(path, err))?;
    for value in data.iter() {
        writer
            .write_all(&value.to_le_bytes())
            .map_err(|err| StageError::io(path, err))?;
    }
    writer.flush().map_err(|err| StageError::io(path, err))?;
    debug!("wrote {} ({} x {} x {})", path.display(), nx, ny, nz);
    Ok(())
}
