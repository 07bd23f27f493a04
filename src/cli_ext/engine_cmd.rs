//! CLI command handlers driving the engine.
//!
//! One-shot commands (`backup`, `restore`, ...) open the engine, submit one
//! request, wait for it and exit. They share the single-instance lock with
//! `watch`, so they fail while a watcher runs on the same data directory.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use tabled::{Table, Tabled};
use tracing::{debug, instrument};

use crate::cli::{
    AppContext, BackupArgs, DeleteArgs, ListArgs, MemoArgs, RestoreArgs, SettingsArgs, WatchArgs,
};
use crate::core::engine::Engine;
use crate::core::publisher::{CategoryState, JsonLinesNotifier, Notifier, Severity, UserEvent};
use crate::core::scheduler::{OpResult, Outcome, Ticket};
use crate::core::settings::Settings;
use crate::infra::config::{EnginePaths, load_config};

/// Prints user events to the terminal.
#[derive(Debug, Clone)]
pub struct ConsoleNotifier
{
    ctx: AppContext,
    /// Print error events too (one-shot commands report errors via their
    /// exit status instead)
    show_errors: bool,
}

impl ConsoleNotifier
{
    pub fn new(
        ctx: &AppContext,
        show_errors: bool,
    ) -> Self
    {
        Self {
            ctx: ctx.clone(),
            show_errors,
        }
    }

    fn render(
        &self,
        event: &UserEvent,
    ) -> String
    {
        let (mark, title) = match (event.severity, self.ctx.no_color)
        {
            (Severity::Success, false) =>
            {
                ("✓".green().to_string(), event.title.green().bold().to_string())
            }
            (Severity::Error, false) => ("✗".red().to_string(), event.title.red().bold().to_string()),
            (Severity::Info, false) => ("•".cyan().to_string(), event.title.cyan().to_string()),
            (Severity::Success, true) => ("✓".to_string(), event.title.clone()),
            (Severity::Error, true) => ("✗".to_string(), event.title.clone()),
            (Severity::Info, true) => ("•".to_string(), event.title.clone()),
        };
        format!("{mark} {title}: {}", event.message)
    }
}

impl Notifier for ConsoleNotifier
{
    fn settings_changed(
        &self,
        settings: &Settings,
    )
    {
        debug!(?settings, "settings broadcast");
    }

    fn categories_changed(
        &self,
        categories: &[CategoryState],
    )
    {
        debug!(count = categories.len(), "categories broadcast");
    }

    fn user_event(
        &self,
        event: &UserEvent,
    )
    {
        match event.severity
        {
            Severity::Error if self.show_errors => eprintln!("{}", self.render(event)),
            Severity::Error => {}
            _ if self.ctx.quiet => {}
            _ => println!("{}", self.render(event)),
        }
    }
}

fn open_engine(
    paths: &EnginePaths,
    notifier: Arc<dyn Notifier>,
) -> Result<Engine>
{
    let config = load_config(&paths.data_dir)?;
    Engine::builder(paths.clone())
        .with_config(config)
        .with_notifier(notifier)
        .open()
        .with_context(|| format!("Failed to open engine in {}", paths.data_dir.display()))
}

fn one_shot(
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<Engine>
{
    open_engine(paths, Arc::new(ConsoleNotifier::new(ctx, false)))
}

/// Wait for a ticket and turn an engine failure into an `anyhow` error.
fn finish(ticket: Ticket) -> Result<Outcome>
{
    let result: OpResult = ticket.wait();
    result.map_err(|e| anyhow::anyhow!("{e}"))
}

/// Run the watcher until the process is terminated.
#[instrument(skip_all)]
pub fn watch(
    args: WatchArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let notifier: Arc<dyn Notifier> = if args.json
    {
        Arc::new(JsonLinesNotifier::new(io::stdout()))
    }
    else
    {
        Arc::new(ConsoleNotifier::new(ctx, true))
    };
    let engine = open_engine(paths, notifier)?;
    engine.initialize()?;

    match engine.watching()
    {
        Some(root) if !ctx.quiet && !args.json =>
        {
            println!("Watching {} (Ctrl+C to stop)", root.display())
        }
        None =>
        {
            anyhow::bail!("No save folder configured. Run `svault settings --path <DIR>` first.")
        }
        _ => {}
    }

    // Interrupting the process leaves a stale lock, reclaimed on next start.
    loop
    {
        std::thread::park();
    }
}

pub fn backup(
    args: BackupArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = one_shot(paths, ctx)?;
    let outcome = finish(engine.request_backup(&args.category))?;
    debug!(?outcome, "backup finished");
    Ok(())
}

pub fn restore(
    args: RestoreArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = one_shot(paths, ctx)?;
    finish(engine.request_restore(&args.category, &args.timestamp))?;
    Ok(())
}

pub fn delete(
    args: DeleteArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = one_shot(paths, ctx)?;
    let ticket = match (&args.timestamp, args.all)
    {
        (_, true) => engine.delete_category(&args.category),
        (Some(ts), false) => engine.delete_snapshot(&args.category, ts),
        (None, false) => anyhow::bail!("Give a snapshot timestamp or --all"),
    };
    finish(ticket)?;
    Ok(())
}

pub fn memo(
    args: MemoArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = one_shot(paths, ctx)?;
    finish(engine.set_memo(&args.category, &args.text))?;
    if !ctx.quiet
    {
        println!("Memo saved for {}", args.category);
    }
    Ok(())
}

#[derive(Tabled)]
struct CategoryRow
{
    category: String,
    snapshots: usize,
    latest: String,
    source: String,
    memo: String,
}

pub fn list(
    args: ListArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = one_shot(paths, ctx)?;
    let categories = engine.categories();

    if args.json
    {
        println!(
            "{}",
            serde_json::to_string_pretty(&categories).context("Failed to encode categories")?
        );
        return Ok(());
    }

    if categories.is_empty()
    {
        if !ctx.quiet
        {
            println!("No categories yet.");
        }
        return Ok(());
    }

    let rows: Vec<CategoryRow> = categories
        .iter()
        .map(|c| CategoryRow {
            category: c.name.clone(),
            snapshots: c.snapshots.len(),
            latest: c.latest.clone().unwrap_or_else(|| "-".into()),
            source: match (c.source_exists, ctx.no_color)
            {
                (true, _) => "present".to_string(),
                (false, true) => "missing".to_string(),
                (false, false) => "missing".yellow().to_string(),
            },
            memo: c.memo.clone(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

pub fn settings(
    args: SettingsArgs,
    paths: &EnginePaths,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = one_shot(paths, ctx)?;
    let current = engine.settings();
    let show_only = args.is_empty();

    let shown = if show_only
    {
        current
    }
    else
    {
        let path = args
            .path
            .unwrap_or(current.repo_save_path);
        let max = args
            .max_generations
            .unwrap_or(current.max_generations as i64);
        let theme = args
            .theme
            .unwrap_or(current.theme);
        engine.update_settings(&path, max, &theme)?
    };

    if !ctx.quiet || show_only
    {
        print!(
            "{}",
            toml::to_string_pretty(&shown).context("Failed to encode settings")?
        );
    }
    Ok(())
}
