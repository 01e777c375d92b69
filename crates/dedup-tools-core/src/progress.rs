use std::fmt;

/// Long-running stages that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Scan,
    Checksum,
    Copy,
    Verify,
    Analyze,
    Move,
    Compare,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Scan => "scan",
            Phase::Checksum => "checksum",
            Phase::Copy => "copy",
            Phase::Verify => "verify",
            Phase::Analyze => "analyze",
            Phase::Move => "move",
            Phase::Compare => "compare",
        };
        f.write_str(name)
    }
}

/// Trait for reporting phase progress.
///
/// Called from worker threads, so implementations must be `Sync`. `total` is
/// `None` when the amount of work is not known up front (directory walks).
/// All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_phase_start(&self, _phase: Phase, _total: Option<u64>) {}
    fn on_phase_progress(&self, _phase: Phase, _completed: u64) {}
    fn on_phase_complete(&self, _phase: Phase, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
