mod commands;
mod logging;
mod progress;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{AnalyzeArgs, Cli, Commands, DupesMoveAction, LayoutArg, StageArg, ToolArg};
use dedup_tools_core::config::load_configuration;
use dedup_tools_core::job::build_volumes;
use dedup_tools_core::phases::checksum::{ensure_checksums, index_pool};
use dedup_tools_core::phases::compare::{run_compare, CompareOptions};
use dedup_tools_core::phases::copy::{run_copy, CopyOptions};
use dedup_tools_core::phases::dupes_move::{self, Layout, MoveOptions};
use dedup_tools_core::phases::summary::{compare_counts, copy_summary, dupes_move_summary};
use dedup_tools_core::phases::verify::{run_verify, VerifyOptions};
use dedup_tools_core::scanner;
use dedup_tools_core::storage::models::{FileRole, VerifyStage};
use dedup_tools_core::{AppConfig, ChecksumCache, Database, JobPaths, VolumeIdentity};
use dotenv::dotenv;
use progress::CliReporter;
use tracing::{error, info};

/// How a successful invocation ended.
enum Outcome {
    Clean,
    /// Files are left in `error` after a verification.
    FilesInError,
}

fn main() -> ExitCode {
    dotenv().ok();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        let _ = Cli::command().print_long_help();
        return ExitCode::SUCCESS;
    };

    let job = command.job();
    let default_log = JobPaths::new(&job.job_dir, &job.job_name, None).log_file;
    let _guard = logging::init_logger(cli.log_level.as_deref(), &default_log);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            return ExitCode::from(2);
        }
    };

    match run(&command, &config) {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::FilesInError) => {
            eprintln!("{}", "Some files are in error; see the summary above.".red());
            ExitCode::from(1)
        }
        Err(err) => {
            error!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

/// Open (or for `init`, create) the job and execute `command` as one
/// recorded job run.
fn run(command: &Commands, config: &AppConfig) -> Result<Outcome> {
    let job = command.job();
    let paths = JobPaths::from_config(&job.job_dir, &job.job_name, config);
    let db = match command {
        Commands::Init { .. } => paths.init(config)?,
        _ => paths
            .open(config)
            .with_context(|| format!("run `init` for job '{}' first", job.job_name))?,
    };
    let volumes = build_volumes(config)?;

    let (tool, name) = command.run_name();
    let options_json = serde_json::to_string(command)?;
    let run_id = db.start_job_run(tool, name, &options_json)?;
    info!("Job '{}': {} {} (run {})", job.job_name, tool, name, run_id);

    let ctx = JobContext {
        db: &db,
        volumes: &volumes,
        config,
        threads: job.threads.unwrap_or_else(|| config.worker_threads()),
        reporter: CliReporter::new(),
    };
    let result = ctx.execute(command);

    let status = match &result {
        Ok(Outcome::Clean) => "completed",
        Ok(Outcome::FilesInError) => "completed_with_errors",
        Err(_) => "failed",
    };
    db.complete_job_run(run_id, status)?;
    result
}

struct JobContext<'a> {
    db: &'a Database,
    volumes: &'a VolumeIdentity,
    config: &'a AppConfig,
    threads: usize,
    reporter: CliReporter,
}

impl JobContext<'_> {
    fn cache(&self) -> ChecksumCache<'_> {
        ChecksumCache::new(self.db, self.volumes).with_slow_hash_warning(self.config.slow_hash_warning())
    }

    fn execute(&self, command: &Commands) -> Result<Outcome> {
        match command {
            Commands::Init { .. } => {
                println!("{}", "Job initialized.".green());
                Ok(Outcome::Clean)
            }
            Commands::ImportChecksums { from, .. } => {
                let imported = self.cache().import_from(from)?;
                println!("Imported {} checksum entries from {}", imported.to_string().green(), from.display());
                Ok(Outcome::Clean)
            }
            Commands::ExportChecksums { to, .. } => {
                self.cache().export_to(to)?;
                println!("Checksum cache written to {}", to.display());
                Ok(Outcome::Clean)
            }
            Commands::AddSource { sources, .. } => {
                self.add_sources(sources)?;
                Ok(Outcome::Clean)
            }
            Commands::AddToDestinationIndexPool { pools, .. } => {
                let (scanned, checksummed) = index_pool(
                    self.db,
                    &self.cache(),
                    FileRole::DestinationPool,
                    pools,
                    &self.config.ignore_patterns,
                    self.threads,
                    &self.reporter,
                )?;
                info!(
                    "Destination pool: {} files indexed, {} checksummed ({} hashed)",
                    scanned.files, checksummed.checksummed, checksummed.hashed
                );
                Ok(Outcome::Clean)
            }
            Commands::Checksum { .. } => {
                self.checksum_sources()?;
                Ok(Outcome::Clean)
            }
            Commands::Copy { destinations, .. } => {
                self.copy(destinations)?;
                Ok(Outcome::Clean)
            }
            Commands::Verify { stage, reverify, .. } => {
                self.verify(*stage, *reverify)?;
                self.copy_report()
            }
            Commands::OneShot {
                sources,
                destinations,
                deep,
                ..
            } => {
                self.add_sources(sources)?;
                self.checksum_sources()?;
                self.copy(destinations)?;
                self.verify(StageArg::Shallow, true)?;
                if *deep {
                    self.verify(StageArg::Deep, true)?;
                }
                self.copy_report()
            }
            Commands::DupesMove { action, .. } => self.dupes_move(action),
            Commands::Compare { left, right, .. } => {
                let options = CompareOptions {
                    left_roots: left.clone(),
                    right_roots: right.clone(),
                    ignore_patterns: self.config.ignore_patterns.clone(),
                    threads: self.threads,
                };
                let summary = run_compare(self.db, &self.cache(), &options, &self.reporter)?;
                report::print_compare(&compare_counts(self.db)?);
                if summary.errors > 0 {
                    println!("{}", format!("{} files could not be read", summary.errors).red());
                }
                Ok(Outcome::Clean)
            }
            Commands::Summary { tool, csv, json, .. } => {
                let summary = match tool {
                    ToolArg::Copy => copy_summary(self.db)?,
                    ToolArg::DupesMove => dupes_move_summary(self.db)?,
                    ToolArg::Compare => {
                        report::print_compare(&compare_counts(self.db)?);
                        return Ok(Outcome::Clean);
                    }
                };
                report::print_summary(&summary);
                if let Some(path) = csv {
                    report::write_csv(&summary, path)?;
                    println!("Wrote {}", path.display());
                }
                if let Some(path) = json {
                    report::write_json(&summary, path)?;
                    println!("Wrote {}", path.display());
                }
                Ok(Outcome::Clean)
            }
        }
    }

    fn add_sources(&self, sources: &[PathBuf]) -> Result<()> {
        let scanned = scanner::scan_roots(
            self.db,
            self.volumes,
            FileRole::Source,
            sources,
            &self.config.ignore_patterns,
            &self.reporter,
        )?;
        info!(
            "{} source files ({} bytes), {} queued for copy",
            scanned.files, scanned.bytes, scanned.queued
        );
        Ok(())
    }

    fn checksum_sources(&self) -> Result<()> {
        let summary = ensure_checksums(self.db, &self.cache(), FileRole::Source, self.threads, &self.reporter)?;
        if summary.errors > 0 {
            println!("{}", format!("{} files could not be checksummed", summary.errors).red());
        }
        Ok(())
    }

    fn copy(&self, destinations: &[PathBuf]) -> Result<()> {
        let options = CopyOptions {
            dest_roots: destinations.to_vec(),
            threads: self.threads,
        };
        let summary = run_copy(self.db, &self.cache(), &options, &self.reporter)?;
        println!(
            "Copied {} files ({} bytes), {} already present, {} unavailable, {} errors",
            summary.copied.to_string().green(),
            summary.bytes_copied,
            summary.deduplicated.to_string().cyan(),
            summary.unavailable,
            summary.errors.to_string().red()
        );
        Ok(())
    }

    fn verify(&self, stage: StageArg, reverify: bool) -> Result<()> {
        let options = VerifyOptions {
            stage: match stage {
                StageArg::Shallow => VerifyStage::Shallow,
                StageArg::Deep => VerifyStage::Deep,
            },
            reverify,
            threads: self.threads,
        };
        run_verify(self.db, &self.cache(), &options, &self.reporter)?;
        Ok(())
    }

    fn copy_report(&self) -> Result<Outcome> {
        let summary = copy_summary(self.db)?;
        report::print_summary(&summary);
        Ok(if summary.has_errors() {
            Outcome::FilesInError
        } else {
            Outcome::Clean
        })
    }

    fn dupes_move(&self, action: &DupesMoveAction) -> Result<Outcome> {
        let cache = self.cache();
        match action {
            DupesMoveAction::Analyze(args) => {
                self.analyze(&cache, args)?;
                Ok(Outcome::Clean)
            }
            DupesMoveAction::Move => {
                dupes_move::execute_moves(self.db, &cache, self.threads, &self.reporter)?;
                report::print_summary(&dupes_move_summary(self.db)?);
                Ok(Outcome::Clean)
            }
            DupesMoveAction::Verify => self.verify_moves(&cache),
            DupesMoveAction::OneShot(args) => {
                self.analyze(&cache, args)?;
                dupes_move::execute_moves(self.db, &cache, self.threads, &self.reporter)?;
                self.verify_moves(&cache)
            }
        }
    }

    fn analyze(&self, cache: &ChecksumCache<'_>, args: &AnalyzeArgs) -> Result<()> {
        scanner::scan_roots(
            self.db,
            self.volumes,
            FileRole::DedupPool,
            &args.pools,
            &self.config.ignore_patterns,
            &self.reporter,
        )?;
        let options = MoveOptions {
            dupes_dir: args.dupes_dir.clone(),
            layout: match args.layout {
                LayoutArg::Preserve => Layout::Preserve,
                LayoutArg::Flatten => Layout::Flatten,
            },
            threads: self.threads,
        };
        let summary = dupes_move::analyze(self.db, cache, &options, &self.reporter)?;
        println!(
            "{} duplicate groups, {} moves planned",
            summary.groups.to_string().cyan(),
            summary.planned.to_string().cyan()
        );
        Ok(())
    }

    fn verify_moves(&self, cache: &ChecksumCache<'_>) -> Result<Outcome> {
        dupes_move::verify_moves(self.db, cache, self.threads, &self.reporter)?;
        let summary = dupes_move_summary(self.db)?;
        report::print_summary(&summary);
        Ok(if summary.has_errors() {
            Outcome::FilesInError
        } else {
            Outcome::Clean
        })
    }
}
