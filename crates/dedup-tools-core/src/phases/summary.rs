//! Read-only views of a job's state for the end-of-run report.

use crate::error::Error;
use crate::storage::models::{ProblemFile, VerifyStage};
use crate::storage::Database;
use serde::Serialize;

/// Status counts plus every file that did not reach a success state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub tool: String,
    pub status_counts: Vec<(String, i64)>,
    pub shallow_verification: Vec<(String, i64)>,
    pub deep_verification: Vec<(String, i64)>,
    pub problems: Vec<ProblemFile>,
}

impl RunSummary {
    pub fn total(&self) -> i64 {
        self.status_counts.iter().map(|(_, n)| n).sum()
    }

    pub fn count(&self, status: &str) -> i64 {
        self.status_counts
            .iter()
            .find(|(s, _)| s == status)
            .map_or(0, |(_, n)| *n)
    }

    pub fn has_errors(&self) -> bool {
        self.count("error") > 0
    }
}

pub fn copy_summary(db: &Database) -> Result<RunSummary, Error> {
    Ok(RunSummary {
        tool: "copy".to_string(),
        status_counts: db.status_counts("copy_status")?,
        shallow_verification: db.verification_counts(VerifyStage::Shallow)?,
        deep_verification: db.verification_counts(VerifyStage::Deep)?,
        problems: db.problem_files("copy_status", &["done"])?,
    })
}

pub fn dupes_move_summary(db: &Database) -> Result<RunSummary, Error> {
    Ok(RunSummary {
        tool: "dupes-move".to_string(),
        status_counts: db.status_counts("dedup_move_plan")?,
        problems: db.problem_files("dedup_move_plan", &["verified", "keeper"])?,
        ..RunSummary::default()
    })
}

/// Row counts of the stored comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompareCounts {
    pub left_missing: usize,
    pub right_missing: usize,
    pub identical: usize,
    pub different: usize,
}

pub fn compare_counts(db: &Database) -> Result<CompareCounts, Error> {
    use crate::storage::models::CompareSide;
    Ok(CompareCounts {
        left_missing: db.list_missing_files(CompareSide::Left)?.len(),
        right_missing: db.list_missing_files(CompareSide::Right)?.len(),
        identical: db.list_identical_pairs()?.len(),
        different: db.list_different_pairs()?.len(),
    })
}
