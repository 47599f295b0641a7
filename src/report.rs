//! Per-stage and per-run outcome reports.

use crate::error::FileError;
use serde::{Deserialize, Serialize};

/// Outcome of one stage.
///
/// A stage that returns a report succeeded as a whole; individual files that
/// failed are listed in [`StageReport::failed`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stable stage name, e.g. `opensource-extract`.
    pub stage: String,
    /// Items handled successfully (objects staged, files normalized, PDFs
    /// extracted, records built).
    pub processed: usize,
    /// Items deliberately left alone (non-matching names, empty records,
    /// duplicates).
    pub skipped: usize,
    /// PDFs discarded by validation and records dropped by data-quality
    /// filters.
    pub rejected: usize,
    /// Non-fatal per-file failures.
    pub failed: Vec<FileError>,
    /// Rows written by a warehouse load, when the stage loads a table.
    pub rows_loaded: Option<u64>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn record_failure(&mut self, error: FileError) {
        self.failed.push(error);
    }

    /// `true` when no file failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a whole run: one report per stage that completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Total per-file failures across all stages.
    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tracks_failures() {
        let mut r = StageReport::new("cloud-extract");
        assert!(r.is_clean());
        r.record_failure(FileError::Archive {
            name: "a.pdf".into(),
            detail: "bad zip".into(),
        });
        assert!(!r.is_clean());

        let run = PipelineReport {
            stages: vec![r, StageReport::new("load-cloud")],
            duration_ms: 10,
        };
        assert_eq!(run.total_failed(), 1);
        assert!(run.stage("load-cloud").is_some());
        assert!(run.stage("stage-dataset").is_none());
    }

    #[test]
    fn reports_compare_by_failures() {
        let mut a = StageReport::new("opensource-extract");
        let b = a.clone();
        assert_eq!(a, b);
        a.record_failure(FileError::Extraction {
            name: "a.pdf".into(),
            detail: "no pages".into(),
        });
        assert_ne!(a, b);

        let json = serde_json::to_string(&a).unwrap();
        let back: StageReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
