use dedup_tools_core::{Phase, ProgressReporter};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Scan phase: spinner (unknown total files upfront)
/// - Every other phase: progress bar over the files it works on
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.guard();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.guard().take() {
            pb.finish_and_clear();
        }
    }
}

fn spinner(phase: Phase) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS);
    pb.set_style(style);
    pb.set_message(format!("{}...", capitalize(phase)));
    pb
}

fn bar(phase: Phase, total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let template = format!(
        "  {{spinner:.cyan}} {:<8} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} files ({{eta}} remaining)",
        capitalize(phase)
    );
    let style = ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS);
    pb.set_style(style);
    pb
}

fn capitalize(phase: Phase) -> String {
    let name = phase.to_string();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => name,
    }
}

impl ProgressReporter for CliReporter {
    fn on_phase_start(&self, phase: Phase, total: Option<u64>) {
        let pb = match total {
            Some(total) => bar(phase, total),
            None => spinner(phase),
        };
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_phase_progress(&self, phase: Phase, completed: u64) {
        let guard = self.guard();
        if let Some(pb) = guard.as_ref() {
            if pb.length().is_some_and(|len| len > 0) {
                pb.set_position(completed);
            } else {
                pb.set_message(format!("{}... {} files", capitalize(phase), completed));
            }
        }
    }

    fn on_phase_complete(&self, phase: Phase, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m {} complete in {:.2}s",
            capitalize(phase),
            duration_secs
        );
    }
}
