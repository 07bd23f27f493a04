use anyhow::Result;
use clap::Parser;
use savevault::cli::{AppContext, Cli, Commands};
use savevault::cli_ext::engine_cmd;
use savevault::infra::EnginePaths;
use tracing_subscriber::EnvFilter;

/// Log filter override, e.g. `SVAULT_LOG=savevault=debug`
const LOG_ENV: &str = "SVAULT_LOG";

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build a context once, pass everywhere
    let ctx = AppContext {
        quiet: cli.quiet,
        no_color: cli.no_color,
    };

    let default_level = if ctx.quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!ctx.no_color)
        .init();

    let paths = EnginePaths::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Watch(args) => engine_cmd::watch(args, &paths, &ctx),
        Commands::Backup(args) => engine_cmd::backup(args, &paths, &ctx),
        Commands::Restore(args) => engine_cmd::restore(args, &paths, &ctx),
        Commands::Delete(args) => engine_cmd::delete(args, &paths, &ctx),
        Commands::Memo(args) => engine_cmd::memo(args, &paths, &ctx),
        Commands::List(args) => engine_cmd::list(args, &paths, &ctx),
        Commands::Settings(args) => engine_cmd::settings(args, &paths, &ctx),
        Commands::Init(args) => savevault::infra::config::init(args, &paths, &ctx),
        Commands::Completions(args) => savevault::completion::run(args, &ctx),
    }
}
