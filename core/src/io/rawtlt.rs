//! `.rawtlt` sidecars: one tilt angle per line, six decimals.

use crate::prelude::{StageError, StageResult};
use std::fs;
use std::path::Path;

pub fn write_rawtlt<P: AsRef<Path>>(path: P, tilts: &[f64]) -> StageResult<()> {
    let path = path.as_ref();
    let contents: String = tilts.iter().map(|tilt| format!("{:.6}\n", tilt)).collect();
    fs::write(path, contents).map_err(|err| StageError::io(path, err))
}

pub fn read_rawtlt<P: AsRef<Path>>(path: P) -> StageResult<Vec<f64>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| StageError::io(path, err))?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<f64>().map_err(|_| {
                StageError::Metadata(format!("{}: bad tilt angle `{}`", path.display(), line))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn angles_are_written_with_six_decimals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tomo_001.rawtlt");
        write_rawtlt(&path, &[-60.0, 0.5, 2.1234567]).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "-60.000000\n0.500000\n2.123457\n"
        );
        assert_eq!(read_rawtlt(&path).unwrap(), vec![-60.0, 0.5, 2.123457]);
    }

    #[test]
    fn garbage_line_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.rawtlt");
        fs::write(&path, "1.0\nabc\n").unwrap();
        assert!(matches!(read_rawtlt(&path), Err(StageError::Metadata(_))));
    }
}
