use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shared application context for global flags
#[derive(Clone, Debug)]
pub struct AppContext {
    pub quiet: bool,    // global --quiet
    pub no_color: bool, // global --no-color
}

#[derive(Parser)]
#[command(name = "svault")]
#[command(about = "Generation-limited snapshots of save-data folders, with watch and restore")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory (archive, settings, lock); defaults to SVAULT_DATA_DIR
    /// or the platform data directory
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Only print errors
    #[arg(long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the save folder and back up changes until interrupted
    Watch(WatchArgs),

    /// Back up one category now
    Backup(BackupArgs),

    /// Replace a category's live folder with a snapshot
    Restore(RestoreArgs),

    /// Delete one snapshot, or every snapshot of a category with --all
    Delete(DeleteArgs),

    /// Set the free-text memo of a category
    Memo(MemoArgs),

    /// List categories and their snapshots
    List(ListArgs),

    /// Show or change settings
    Settings(SettingsArgs),

    /// Initialize a savevault.toml config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct WatchArgs {
    /// Print broadcasts as JSON lines instead of log lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct BackupArgs {
    /// Category (subfolder name under the save folder)
    pub category: String,
}

#[derive(Debug, Parser)]
pub struct RestoreArgs {
    pub category: String,

    /// Snapshot identifier (YYYYMMDD_HHmmss)
    pub timestamp: String,
}

#[derive(Debug, Parser)]
pub struct DeleteArgs {
    pub category: String,

    /// Snapshot identifier to delete
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub timestamp: Option<String>,

    /// Delete every snapshot and the memo
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, Parser)]
pub struct MemoArgs {
    pub category: String,

    /// Memo text; empty clears it
    #[arg(default_value = "")]
    pub text: String,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Emit the category document as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SettingsArgs {
    /// Save folder to watch (empty string disables watching)
    #[arg(long, value_name = "PATH")]
    pub path: Option<String>,

    /// Snapshots kept per category (clamped to 1..=100)
    #[arg(long, allow_negative_numbers = true)]
    pub max_generations: Option<i64>,

    /// UI theme name, stored as-is
    #[arg(long)]
    pub theme: Option<String>,
}

impl SettingsArgs {
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.max_generations.is_none() && self.theme.is_none()
    }
}

#[derive(Debug, Parser)]
pub struct InitArgs {
    /// Directory to initialize config in (defaults to the data directory)
    pub path: Option<PathBuf>,

    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Parser)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Output directory; if omitted and --stdout not set, prints error
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Print completion script to stdout instead of a file
    #[arg(long)]
    pub stdout: bool,
}
