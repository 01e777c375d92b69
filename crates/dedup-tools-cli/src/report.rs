use anyhow::{Context, Result};
use colored::*;
use dedup_tools_core::phases::summary::{CompareCounts, RunSummary};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

fn colored_status(status: &str) -> ColoredString {
    match status {
        "done" | "verified" | "keeper" | "ok" => status.green(),
        "error" | "failed" | "mismatch" | "missing" => status.red(),
        _ => status.yellow(),
    }
}

fn print_counts(title: &str, counts: &[(String, i64)]) {
    if counts.is_empty() {
        return;
    }
    println!("{}", title.bold());
    for (status, count) in counts {
        println!("  {:<12} {}", colored_status(status), count);
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{} {} ({} files)",
        "Summary:".bold(),
        summary.tool.cyan(),
        summary.total()
    );
    print_counts("Status", &summary.status_counts);
    print_counts("Shallow verification", &summary.shallow_verification);
    print_counts("Deep verification", &summary.deep_verification);

    if summary.problems.is_empty() {
        println!("{}", "All files finished successfully.".green());
        return;
    }
    println!(
        "{}",
        format!("{} files not finished:", summary.problems.len()).red().bold()
    );
    for problem in &summary.problems {
        println!(
            "  [{}] {}:{} {}",
            colored_status(&problem.status),
            problem.uid,
            problem.relative_path,
            problem.error_message.as_deref().unwrap_or("").dimmed()
        );
    }
}

pub fn print_compare(counts: &CompareCounts) {
    println!();
    println!("{}", "Comparison:".bold());
    println!("  {:<16} {}", "identical", counts.identical.to_string().green());
    println!("  {:<16} {}", "missing left", counts.left_missing.to_string().yellow());
    println!("  {:<16} {}", "missing right", counts.right_missing.to_string().yellow());
    println!("  {:<16} {}", "different", counts.different.to_string().red());
}

/// One row per unfinished file.
pub fn write_csv(summary: &RunSummary, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for problem in &summary.problems {
        writer.serialize(problem)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_json(summary: &RunSummary, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)?;
    Ok(())
}
