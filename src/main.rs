use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::warn;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use tracemirror::cli::{backfill, health, list, read, stats};
use tracemirror::config::{Config, LogFormat};
use tracemirror::store::MirrorStore;
use tracemirror::Orchestrator;

#[derive(Parser)]
#[command(name = "tracemirror")]
#[command(about = "Keeps a queryable SQLite mirror of agent session logs in sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "tracemirror.yaml")]
    config: String,

    /// Log at debug level (overrides the configured level)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the log tree and keep the store in sync until interrupted
    Run,

    /// Sync every existing log file once and exit
    Backfill,

    /// Report the health of a running engine
    Health,

    /// Show store statistics
    Stats,

    /// List sessions
    List {
        /// Filter by project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Read a session
    Read {
        /// Session ID (or unique prefix)
        session_id: String,

        /// Show tool invocations and their results
        #[arg(long)]
        tools: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config)?;

    match cli.command {
        Commands::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            let shutdown_timeout = config.engine.shutdown_timeout();
            let orchestrator = Orchestrator::new(config);
            let result = runtime.block_on(orchestrator.run(shutdown_signal()));
            // Blocking work abandoned at shutdown must not keep the process alive
            runtime.shutdown_timeout(shutdown_timeout);
            result?;
        }
        Commands::Backfill => {
            backfill::run(&config)?;
        }
        Commands::Health => {
            health::run(&config)?;
        }
        Commands::Stats => {
            let store = MirrorStore::open_read_only(&config.database_path())?;
            stats::run(&store)?;
        }
        Commands::List { project } => {
            let store = MirrorStore::open_read_only(&config.database_path())?;
            list::run(&store, project)?;
        }
        Commands::Read { session_id, tools } => {
            let store = MirrorStore::open_read_only(&config.database_path())?;
            read::run(&store, &session_id, tools)?;
        }
    }

    Ok(())
}

/// `RUST_LOG` overrides the configured level
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .with_context(|| format!("Invalid log level '{}'", config.logging.level))?;

    let (writer, ansi) = match config.log_file() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);

    match config.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
