use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dedup-tools")]
#[command(about = "Copy, consolidate and compare file trees once per content", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directive, e.g. `debug` or `dedup_tools_core=trace`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Args, Serialize)]
pub struct JobArgs {
    /// Directory holding the job database, checksum cache and logs
    #[arg(long)]
    pub job_dir: PathBuf,

    /// Name of the job; the database is `<job_dir>/<job_name>.db`
    #[arg(long)]
    pub job_name: String,

    /// Worker threads (overrides the configuration)
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageArg {
    Shallow,
    Deep,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutArg {
    /// Keep the path below the pool root
    #[default]
    Preserve,
    /// File name only, prefixed with the checksum on collision
    Flatten,
}

#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolArg {
    Copy,
    DupesMove,
    Compare,
}

#[derive(Debug, Clone, Args, Serialize)]
pub struct AnalyzeArgs {
    /// Pool directories to search for duplicates
    #[arg(long = "pool", required = true)]
    pub pools: Vec<PathBuf>,

    /// Folder duplicates are moved into
    #[arg(long)]
    pub dupes_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = LayoutArg::Preserve)]
    pub layout: LayoutArg,
}

#[derive(Debug, Clone, Subcommand, Serialize)]
pub enum DupesMoveAction {
    /// Scan the pool and plan one keeper per duplicate group
    Analyze(AnalyzeArgs),
    /// Move planned duplicates
    Move,
    /// Check moved files and keepers
    Verify,
    /// Analyze, move and verify
    OneShot(AnalyzeArgs),
}

#[derive(Debug, Clone, Subcommand, Serialize)]
pub enum Commands {
    /// Create the job directory and its stores
    Init {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Seed the checksum cache from another job's cache file
    ImportChecksums {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        from: PathBuf,
    },
    /// Write the checksum cache to a standalone file
    ExportChecksums {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        to: PathBuf,
    },
    /// Scan source directories and queue their files for copying
    AddSource {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long = "src", required = true)]
        sources: Vec<PathBuf>,
    },
    /// Index directories whose content counts as already copied
    AddToDestinationIndexPool {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long = "pool", required = true)]
        pools: Vec<PathBuf>,
    },
    /// Checksum every source file
    Checksum {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Copy pending source files to the destination
    Copy {
        #[command(flatten)]
        job: JobArgs,
        /// Destination roots; new copies go under the first one
        #[arg(long = "dst", required = true)]
        destinations: Vec<PathBuf>,
    },
    /// Verify copied files against the destination
    Verify {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long, value_enum, default_value_t = StageArg::Shallow)]
        stage: StageArg,
        /// Discard earlier results of this stage first
        #[arg(long)]
        reverify: bool,
    },
    /// Scan, checksum, copy, verify and summarize in one go
    OneShot {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long = "src", required = true)]
        sources: Vec<PathBuf>,
        #[arg(long = "dst", required = true)]
        destinations: Vec<PathBuf>,
        /// Also run checksum verification
        #[arg(long)]
        deep: bool,
    },
    /// Move duplicates out of a pool, keeping one copy of each content
    DupesMove {
        #[command(flatten)]
        job: JobArgs,
        #[command(subcommand)]
        action: DupesMoveAction,
    },
    /// Compare two directory pools by content
    Compare {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long = "left", required = true)]
        left: Vec<PathBuf>,
        #[arg(long = "right", required = true)]
        right: Vec<PathBuf>,
    },
    /// Report status counts and unfinished files
    Summary {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long, value_enum, default_value_t = ToolArg::Copy)]
        tool: ToolArg,
        /// Also write the unfinished files to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Also write the whole summary to a JSON file
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

impl Commands {
    pub fn job(&self) -> &JobArgs {
        match self {
            Commands::Init { job }
            | Commands::ImportChecksums { job, .. }
            | Commands::ExportChecksums { job, .. }
            | Commands::AddSource { job, .. }
            | Commands::AddToDestinationIndexPool { job, .. }
            | Commands::Checksum { job }
            | Commands::Copy { job, .. }
            | Commands::Verify { job, .. }
            | Commands::OneShot { job, .. }
            | Commands::DupesMove { job, .. }
            | Commands::Compare { job, .. }
            | Commands::Summary { job, .. } => job,
        }
    }

    /// Tool and command name recorded in the job's run history.
    pub fn run_name(&self) -> (&'static str, &'static str) {
        match self {
            Commands::Init { .. } => ("job", "init"),
            Commands::ImportChecksums { .. } => ("job", "import-checksums"),
            Commands::ExportChecksums { .. } => ("job", "export-checksums"),
            Commands::AddSource { .. } => ("copy", "add-source"),
            Commands::AddToDestinationIndexPool { .. } => ("copy", "add-to-destination-index-pool"),
            Commands::Checksum { .. } => ("copy", "checksum"),
            Commands::Copy { .. } => ("copy", "copy"),
            Commands::Verify { .. } => ("copy", "verify"),
            Commands::OneShot { .. } => ("copy", "one-shot"),
            Commands::DupesMove { action, .. } => match action {
                DupesMoveAction::Analyze(_) => ("dupes-move", "analyze"),
                DupesMoveAction::Move => ("dupes-move", "move"),
                DupesMoveAction::Verify => ("dupes-move", "verify"),
                DupesMoveAction::OneShot(_) => ("dupes-move", "one-shot"),
            },
            Commands::Compare { .. } => ("compare", "compare"),
            Commands::Summary { .. } => ("report", "summary"),
        }
    }
}
