mod connect_command;
mod session_commands;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    tether_config::TetherConfig,
    tether_sessions::{HttpSessionApi, SessionResolver},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "tether", about = "tether, a terminal client for agent chat sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the discovered one.
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a session and chat from stdin.
    Connect {
        /// Session to join. Resolved from the server when omitted.
        #[arg(long)]
        session: Option<String>,
    },
    /// Session management.
    Session {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
    /// Print the stored transcript of a session.
    History {
        /// Defaults to the persisted session.
        #[arg(long)]
        session: Option<String>,
        /// Number of most recent records to print.
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Logs go to stderr; stdout carries the conversation.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<TetherConfig> {
    match &cli.config {
        Some(path) => {
            let mut config = tether_config::load_config(path)
                .with_context(|| format!("loading {}", path.display()))?;
            tether_config::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
            Ok(config)
        },
        None => Ok(tether_config::discover_and_load()),
    }
}

/// Session resolver backed by the configured server and data directory.
pub(crate) fn resolver(config: &TetherConfig) -> Result<Arc<SessionResolver>> {
    let api = HttpSessionApi::from_config(&config.server).context("building session API client")?;
    let data_dir = tether_config::data_dir(config);
    let resolver = SessionResolver::open(Arc::new(api), &data_dir, config.session.default_name.clone())
        .with_context(|| format!("opening session state in {}", data_dir.display()))?;
    Ok(Arc::new(resolver))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "tether starting");
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Connect { session } => connect_command::run(&config, session).await,
        Commands::Session { action } => session_commands::handle_session(&config, action).await,
        Commands::History { session, limit } => {
            session_commands::history(&config, session, limit)
        },
    }
}
