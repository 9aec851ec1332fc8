//! pixmill command line
//!
//! `pixmill run <dir>` converts a directory in place; `status`, `tools` and
//! `clear` inspect or reset the state left behind by earlier runs.

use clap::{Parser, Subcommand};
use pixmill::{AppMode, Config, Engine, EngineError, StateManager, ToolRouter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// pixmill - in-place batch conversion to JPEG XL, AVIF and MOV
#[derive(Parser, Debug)]
#[command(name = "pixmill")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "pixmill.toml", global = true)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every media file under a directory
    Run {
        dir: PathBuf,

        /// auto+, quality or sticker
        #[arg(short, long)]
        mode: Option<AppMode>,

        /// Ask what to do with corrupted and low-quality files
        #[arg(short, long)]
        interactive: bool,

        /// Initial worker count
        #[arg(short, long)]
        workers: Option<usize>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show what the state store holds
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List discovered encoder binaries
    Tools,
    /// Forget the stored session so the next run starts with a fresh scan
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Run {
            dir,
            mode,
            interactive,
            workers,
            json,
        } => {
            if let Some(mode) = mode {
                config.engine.mode = mode;
            }
            if interactive {
                config.batch.interactive = true;
            }
            if let Some(workers) = workers {
                config.optimizer.initial_workers = workers;
            }
            run(config, &dir, json).await
        }
        Command::Status { json } => status(&config, json),
        Command::Tools => tools(&config).await,
        Command::Clear => clear(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pixmill failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "pixmill=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config, dir: &Path, json: bool) -> Result<(), EngineError> {
    let engine = Engine::new(config, dir).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight files");
            on_signal.cancel();
        }
    });

    let summary = engine.execute(cancel).await?;
    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => warn!(error = %e, "failed to encode summary"),
        }
        return Ok(());
    }

    println!(
        "Session:   {}{}",
        summary.session_id,
        if summary.resumed { " (resumed)" } else { "" }
    );
    println!("Directory: {}", summary.root.display());
    println!("Mode:      {}", summary.mode);
    println!(
        "Files:     {} total, {} done, {} failed, {} skipped, {} pending",
        summary.total_files, summary.done, summary.failed, summary.skipped, summary.pending
    );
    println!("Routing:   {} quick, {} deep", summary.fast_routed, summary.deep_analyzed);
    println!("Saved:     {} bytes", summary.bytes_saved);
    println!(
        "Workers:   {} at finish, {} adjustments",
        summary.final_workers, summary.optimizer.total_adjustments
    );
    if let Some(decision) = &summary.batch_decision {
        println!(
            "Decision:  {}{}",
            decision.outcome,
            if decision.defaulted { " (default)" } else { "" }
        );
    }
    println!("Elapsed:   {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    if summary.pending > 0 {
        info!(pending = summary.pending, "run again to resume the remaining files");
    }
    Ok(())
}

fn status(config: &Config, json: bool) -> Result<(), EngineError> {
    if !config.state.path.exists() {
        println!("No state at {}", config.state.path.display());
        return Ok(());
    }
    let store = StateManager::open(&config.state.path, true)?;
    let info = store.db_info()?;
    if json {
        match serde_json::to_string_pretty(&info) {
            Ok(text) => println!("{}", text),
            Err(e) => warn!(error = %e, "failed to encode status"),
        }
        return Ok(());
    }

    println!("State file:    {}", config.state.path.display());
    match &info.session {
        Some(session) => {
            println!("Session:       {}", session.session_id);
            println!("Directory:     {}", session.processing_dir.display());
            if let Some(updated) = session.last_update {
                println!("Last update:   {}", updated.to_rfc3339());
            }
        }
        None => println!("Session:       none"),
    }
    println!("Media files:   {}", info.media_files);
    println!("Pending files: {}", info.pending_files);
    println!("Open tasks:    {}", info.pending_tasks);
    println!("Results:       {}", info.results);
    Ok(())
}

async fn tools(config: &Config) -> Result<(), EngineError> {
    let router = ToolRouter::discover(config.router.clone()).await;
    let versions = router.versions();
    if versions.is_empty() {
        println!("No encoders found");
        return Ok(());
    }
    for v in versions {
        println!(
            "{:<9} {:<12} {:<11} {:>3}  {}  {}",
            v.tool.to_string(),
            v.kind.to_string(),
            v.status.to_string(),
            v.health_score,
            v.version_string,
            v.path.display()
        );
    }
    Ok(())
}

fn clear(config: &Config) -> Result<(), EngineError> {
    if !config.state.path.exists() {
        return Ok(());
    }
    let store = StateManager::open(&config.state.path, false)?;
    store.clear_session()?;
    println!("Cleared session state in {}", config.state.path.display());
    Ok(())
}
