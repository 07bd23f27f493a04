//! Engine tuning (`savevault.toml` + `SVAULT_*` environment) and data
//! directory layout.
//!
//! User-facing settings (save path, retention, theme) live in
//! `core::settings`; this file only holds knobs an operator might tune.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, InitArgs};
use crate::infra::walk::PathFilter;

pub const CONFIG_FILE: &str = "savevault.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "SVAULT_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig
{
    /// Quiet period after the last change in a category before it is backed up
    pub debounce_ms: u64,

    /// Extra time auto backups stay muted after a restore
    pub restore_quiet_ms: u64,

    /// First retry delay when the watched root cannot be subscribed
    pub backoff_initial_ms: u64,

    /// Retry delay ceiling
    pub backoff_max_ms: u64,

    /// Capacity of the watcher's raw event queue
    pub event_queue_capacity: usize,

    /// Paths inside categories whose changes never trigger a backup
    pub ignore_patterns: Vec<String>,

    /// Copy files on the rayon pool
    pub parallel_copy: bool,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            debounce_ms: 1500,
            restore_quiet_ms: 2000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            event_queue_capacity: 1024,
            ignore_patterns: vec![
                "**/*.tmp".to_string(),
                "**/*.lock".to_string(),
                "**/~*".to_string(),
            ],
            parallel_copy: true,
        }
    }
}

impl EngineConfig
{
    pub fn debounce(&self) -> Duration
    {
        Duration::from_millis(self.debounce_ms)
    }

    /// How long auto intents stay muted after a restore completes.
    pub fn restore_mute(&self) -> Duration
    {
        Duration::from_millis(self.debounce_ms + self.restore_quiet_ms)
    }

    pub fn backoff_initial(&self) -> Duration
    {
        Duration::from_millis(self.backoff_initial_ms.max(1))
    }

    pub fn backoff_max(&self) -> Duration
    {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms).max(1))
    }

    pub fn path_filter(&self) -> Result<PathFilter>
    {
        PathFilter::new(&self.ignore_patterns).context("Invalid ignore_patterns")
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> Result<()>
    {
        if self.event_queue_capacity == 0
        {
            anyhow::bail!("event_queue_capacity must be at least 1");
        }
        self.path_filter()?;
        Ok(())
    }
}

pub fn load_config(data_dir: &Path) -> Result<EngineConfig>
{
    let mut builder = config::Config::builder();

    // First file found wins
    let config_paths = [CONFIG_FILE, ".savevault.toml"];

    for name in &config_paths
    {
        let path = data_dir.join(name);
        if path.exists()
        {
            builder = builder.add_source(config::File::from(path));
            break;
        }
    }

    // SVAULT_DEBOUNCE_MS=500 etc.; lists are comma separated
    builder = builder.add_source(
        config::Environment::with_prefix("SVAULT")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("ignore_patterns"),
    );

    let cfg = builder
        .build()
        .context("Failed to load configuration")?;
    let parsed: EngineConfig = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;

    parsed.validate()?;
    Ok(parsed)
}

/// Where the engine keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths
{
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub settings_file: PathBuf,
    pub lock_file: PathBuf,
}

impl EnginePaths
{
    pub fn new(data_dir: impl Into<PathBuf>) -> Self
    {
        let data_dir = data_dir.into();
        Self {
            archive_dir: data_dir.join("archive"),
            settings_file: data_dir.join("settings.toml"),
            lock_file: data_dir.join("svault.lock"),
            data_dir,
        }
    }

    /// `--data-dir`, else `SVAULT_DATA_DIR`, else the platform data dir.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self>
    {
        if let Some(dir) = explicit
        {
            return Ok(Self::new(dir));
        }
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty())
        {
            return Ok(Self::new(PathBuf::from(dir)));
        }
        let dirs = directories::ProjectDirs::from("", "", "savevault")
            .context("Could not determine data directory")?;
        Ok(Self::new(dirs.data_dir()))
    }
}

pub fn init(
    args: InitArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let dir = args
        .path
        .as_deref()
        .unwrap_or(&paths.data_dir);
    let config_path = dir.join(CONFIG_FILE);

    if config_path.exists() && !args.force
    {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config = EngineConfig::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet
    {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}
