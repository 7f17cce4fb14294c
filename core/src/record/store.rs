use crate::prelude::{StageError, StageResult};
use crate::record::TomogramRecord;
use log::debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Durable, ordered collection of tomogram records.
///
/// The whole collection is rewritten on every [`RecordStore::persist`]; the
/// write goes through a temporary file in the same directory and is renamed
/// into place, so readers never observe a partially written store.
pub struct RecordStore {
    path: PathBuf,
    records: Vec<TomogramRecord>,
}

impl RecordStore {
    /// Loads the store at `path`, or starts an empty one if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> StageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|err| StageError::io(&path, err))?;
            serde_json::from_str(&contents).map_err(|err| StageError::Format {
                path: path.clone(),
                reason: err.to_string(),
            })?
        } else {
            Vec::new()
        };
        debug!("record store {} holds {} records", path.display(), records.len());
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[TomogramRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TomogramRecord> {
        self.records.get(index)
    }

    /// Value copy of one record, handed to stages.
    pub fn snapshot(&self, index: usize) -> Option<TomogramRecord> {
        self.records.get(index).cloned()
    }

    pub fn position(&self, tomo_num: u32) -> Option<usize> {
        self.records.iter().position(|r| r.tomo_num == tomo_num)
    }

    /// Writes `record` back at `index`. Returns whether anything changed.
    pub fn replace(&mut self, index: usize, record: TomogramRecord) -> StageResult<bool> {
        let slot = self.records.get_mut(index).ok_or_else(|| {
            StageError::Internal(format!("no record at index {}", index))
        })?;
        if slot.tomo_num != record.tomo_num {
            return Err(StageError::Internal(format!(
                "record {} cannot replace record {}",
                record.tomo_num, slot.tomo_num
            )));
        }
        if *slot == record {
            return Ok(false);
        }
        *slot = record;
        Ok(true)
    }

    /// Appends a new record; tomogram numbers must stay unique.
    pub fn push(&mut self, record: TomogramRecord) -> StageResult<()> {
        if self.position(record.tomo_num).is_some() {
            return Err(StageError::Config(format!(
                "tomogram {} is already registered",
                record.tomo_num
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn next_tomo_num(&self) -> u32 {
        self.records
            .iter()
            .map(|r| r.tomo_num)
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Rewrites the full collection to disk.
    pub fn persist(&self) -> StageResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|err| StageError::io(&dir, err))?;

        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|err| StageError::Internal(format!("serializing records: {}", err)))?;
        let mut temp = NamedTempFile::new_in(&dir).map_err(|err| StageError::io(&dir, err))?;
        temp.write_all(json.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| StageError::io(temp.path(), err))?;
        temp.persist(&self.path)
            .map_err(|err| StageError::io(&self.path, err.error))?;
        debug!("persisted {} records to {}", self.records.len(), self.path.display());
        Ok(())
    }
}
