//! Vigil — persistent autonomous agent runtime.
//!
//! Usage:
//!   vigil run       Boot protocol + agent loop + dashboard API
//!   vigil status    Show current agent status
//!   vigil init      Write a default config file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil::config;
use vigil::runtime::Runtime;
use vigil::state::Database;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version)]
#[command(about = "Persistent autonomous agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: <home>/vigil.toml).
    #[arg(long)]
    config: Option<String>,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agent: boot protocol, loop, listeners, API.
    Run,

    /// Show the agent's current status.
    Status,

    /// Write a default config file.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = match &cli.config {
        Some(path) => PathBuf::from(shellexpand::tilde(path).into_owned()),
        None => config::default_home_dir().join("vigil.toml"),
    };

    match cli.command {
        Commands::Run => cmd_run(&config_path).await,
        Commands::Status => cmd_status(&config_path).await,
        Commands::Init => cmd_init(&config_path),
    }
}

async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;

    let cancel = CancellationToken::new();
    let runtime = Runtime::build(config, cancel.clone())
        .await
        .context("Failed to build runtime")?;

    // Boot protocol: seed/merge the code backup, honor the revert flag,
    // validate, and arm the flag for this run.
    match runtime.updater.boot() {
        Ok(report) => {
            if report.reverted || report.validation_failed {
                warn!(
                    "Boot recovered from a bad version (reverted={}, validation_failed={})",
                    report.reverted, report.validation_failed
                );
            }
        }
        Err(err) => {
            // Self-update bookkeeping must not keep the agent down.
            warn!("Boot protocol failed (continuing): {err:#}");
        }
    }

    println!(
        "{} Starting agent '{}' on {}",
        ">>>".green().bold(),
        runtime.state.config.name,
        runtime.state.config.listen_addr,
    );

    let handles = runtime.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    println!("\n{} Shutting down gracefully...", "<<<".red().bold());

    cancel.cancel();
    let shutdown_timeout = tokio::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("Task join error: {err}");
            }
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn cmd_status(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    let db = Database::open(&config.state_db_path())
        .context("Failed to open state store (has the agent run yet?)")?;
    let snapshot = db.load_or_init_state(&config.initial_directive)?;

    println!();
    println!("{}", "=== Vigil Status ===".bold());
    println!();
    println!("  {}:   {}", "Name".bold(), config.name);
    println!("  {}:  {}", "State".bold(), colorize_state(snapshot.paused));
    println!("  {}:  {}", "Iters".bold(), snapshot.iteration);
    println!(
        "  {}:   {}",
        "Task".bold(),
        snapshot.active_task.as_deref().unwrap_or("none")
    );
    println!();
    println!("  {}:", "Directive".bold());
    for line in snapshot.directive.lines().take(4) {
        println!("    {line}");
    }
    println!();
    println!("  {}:", "Goals".bold());
    for goal in snapshot.goals.short_term.iter().take(3) {
        println!("    [short] {goal}");
    }
    for goal in snapshot.goals.mid_term.iter().take(3) {
        println!("    [mid]   {goal}");
    }
    for goal in snapshot.goals.long_term.iter().take(3) {
        println!("    [long]  {goal}");
    }

    if let Some(last) = db.recent_iterations(1)?.into_iter().next() {
        println!();
        println!("  {}:", "Last iteration".bold());
        println!("    #{} via {}/{}", last.n, last.provider, last.model);
        println!("    {}", last.status_message);
        println!(
            "    {} action(s), {} tokens, next sleep {:.0}s",
            last.actions.len(),
            last.tokens_in + last.tokens_out,
            last.next_sleep_s
        );
    }
    println!();

    Ok(())
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!(
            "{} Config already exists at {}",
            "!".yellow().bold(),
            config_path.display()
        );
        return Ok(());
    }
    let config = config::VigilConfig::default();
    config::save_config(&config, config_path)?;
    println!(
        "{} Wrote default config to {}",
        ">>>".green().bold(),
        config_path.display()
    );
    Ok(())
}

fn colorize_state(paused: bool) -> String {
    if paused {
        "paused".yellow().to_string()
    } else {
        "running".green().to_string()
    }
}
