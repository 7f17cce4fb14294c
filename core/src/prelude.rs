use crate::record::TomogramRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Pipeline stages, listed in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    FrameAlignment,
    Cleaning,
    DoseFilter,
    Preprocess,
    Defocus,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::FrameAlignment,
        StageId::Cleaning,
        StageId::DoseFilter,
        StageId::Preprocess,
        StageId::Defocus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageId::FrameAlignment => "frame alignment",
            StageId::Cleaning => "cleaning",
            StageId::DoseFilter => "dose filtering",
            StageId::Preprocess => "preprocessing",
            StageId::Defocus => "defocus determination",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Common error type for stage execution.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("missing resource: {}", .0.display())]
    MissingResource(PathBuf),
    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed image container {}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },
    #[error("malformed metadata: {0}")]
    Metadata(String),
    #[error("external tool `{tool}` failed: {detail}")]
    Tool { tool: String, detail: String },
    #[error("internal failure: {0}")]
    Internal(String),
}

impl StageError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == std::io::ErrorKind::NotFound {
            StageError::MissingResource(path)
        } else {
            StageError::Io { path, source }
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Result of a successful stage invocation.
///
/// `Completed` tells the orchestrator to mark the stage done with the given
/// algorithm and output artifact. `Deferred` carries a modified record whose
/// stage must stay pending, such as a series the operator flagged as skipped.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Completed {
        record: TomogramRecord,
        algorithm: String,
        output: Option<String>,
    },
    Deferred {
        record: TomogramRecord,
    },
}

/// Trait implemented by every pipeline stage.
///
/// Stages receive a value snapshot of one record and hand back the updated
/// snapshot; they never touch the record store.
pub trait ProcessingStage {
    fn id(&self) -> StageId;
    fn force(&self) -> bool;
    fn execute(&mut self, record: TomogramRecord) -> StageResult<StageOutcome>;
}

/// Resumability predicate shared by all stages.
///
/// A skipped record never runs; a finished stage reruns only when forced.
pub fn should_run(record: &TomogramRecord, stage: StageId, force: bool) -> bool {
    !record.skip && (!record.stages.get(stage).done || force)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(skip: bool, done: bool) -> TomogramRecord {
        let mut record = TomogramRecord {
            skip,
            ..Default::default()
        };
        if done {
            record
                .stages
                .mark_done(StageId::FrameAlignment, "MotionCor3".into(), None);
        }
        record
    }

    #[test]
    fn predicate_truth_table() {
        for skip in [false, true] {
            for done in [false, true] {
                for force in [false, true] {
                    let record = record_with(skip, done);
                    let expected = !skip && (!done || force);
                    assert_eq!(
                        should_run(&record, StageId::FrameAlignment, force),
                        expected,
                        "skip={} done={} force={}",
                        skip,
                        done,
                        force
                    );
                }
            }
        }
    }

    #[test]
    fn frame_alignment_runs_once_then_rests() {
        let mut record = record_with(false, false);
        assert!(should_run(&record, StageId::FrameAlignment, false));

        record
            .stages
            .mark_done(StageId::FrameAlignment, "MotionCor3".into(), None);
        assert!(!should_run(&record, StageId::FrameAlignment, false));
    }

    #[test]
    fn skip_dominates_force() {
        let record = record_with(true, true);
        assert!(!should_run(&record, StageId::DoseFilter, true));
    }

    #[test]
    fn predicate_is_per_stage() {
        let record = record_with(false, true);
        assert!(!should_run(&record, StageId::FrameAlignment, false));
        assert!(should_run(&record, StageId::Cleaning, false));
    }

    #[test]
    fn missing_file_maps_to_missing_resource() {
        let err = StageError::io(
            "/nowhere/stack.st",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, StageError::MissingResource(_)));
    }
}
