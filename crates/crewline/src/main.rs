use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info};
use tokio::net::TcpListener;

use crewline::config::Settings;
use crewline::server::{AppState, create_router};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let settings = Settings::load(cli.common.config.as_deref())?;

    match cli.command {
        Command::Serve(cmd) => serve(settings, cmd),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Crewline - multi-bot Feishu bridge for an agent gateway.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the webhook server
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the bind address from the configuration
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.quiet {
        LevelFilter::Error
    } else if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.parse_default_env();
    builder.try_init().ok();
}

#[tokio::main]
async fn serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    let bind = cmd.bind.unwrap_or_else(|| settings.server.bind.clone());

    let state = AppState::new(settings)?;
    let app = create_router(state);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding to {bind}"))?;
    info!("listening on {bind}");

    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
