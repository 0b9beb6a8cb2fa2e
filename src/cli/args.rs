use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::plan::Step;

/// Dependency resolution and build planning for EPICS IOC module trees.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct CliArgs {
    #[command(subcommand)]
    pub cmd: Command,
    /// Module specification files. Later files override earlier ones.
    #[arg(
        short,
        long = "spec",
        env = "PIB_SPEC_FILES",
        value_delimiter = ':',
        global = true
    )]
    pub spec_files: Vec<PathBuf>,
    /// TOML file with site conventions, state and build settings
    #[arg(long, global = true)]
    pub site: Option<PathBuf>,
    /// Directory holding the completion state. Defaults to $HOME/.pib/state
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
    /// Number of steps to run at the same time
    #[arg(short, long, global = true)]
    pub jobs: Option<usize>,
    /// Only act on these modules
    #[arg(long, value_delimiter = ',', global = true)]
    pub only: Vec<String>,
    /// Leave these modules out
    #[arg(long, value_delimiter = ',', global = true)]
    pub exclude: Vec<String>,
    /// Stop handing out new steps after the first failure
    #[arg(long, global = true)]
    pub stop_on_failure: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolves the build order and prints the plan without running anything
    Plan {
        /// Last step to include
        #[arg(long)]
        through: Option<Step>,
        #[arg(long, value_enum, default_value_t = PlanFormat::Text)]
        format: PlanFormat,
    },
    /// Fetches module sources
    Download,
    /// Writes RELEASE_SITE into each module tree
    ReleaseSite,
    /// Applies the patches declared for each module
    Patch,
    /// Points configure/RELEASE.local at the resolved dependency versions
    Sync,
    /// Runs make in each module tree
    Build,
    /// Runs every step of every module
    All,
    /// Lists the modules an IOC tree depends on as a specification document
    Inspect {
        /// IOC (or module) tree to inspect
        path: PathBuf,
        /// File to write the specification to instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Do not fetch missing module trees to inspect their dependencies
        #[arg(long)]
        no_download: bool,
    },
    /// Shows which steps are complete for the current module versions
    Status { module: Option<String> },
    /// Forgets every recorded step completion
    CleanState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanFormat {
    Text,
    Toml,
}

impl Command {
    /// The single step a step command runs.
    pub fn step(&self) -> Option<Step> {
        match self {
            Command::Download => Some(Step::Download),
            Command::ReleaseSite => Some(Step::ReleaseSite),
            Command::Patch => Some(Step::Patch),
            Command::Sync => Some(Step::Sync),
            Command::Build => Some(Step::Build),
            _ => None,
        }
    }
}
