use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kubedeck::config::ManagerConfig;
use kubedeck::events::OutputEvent;
use kubedeck::{ProcessRequest, SessionError, SessionManager, SessionStatus};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Drive kubedeck sessions from the command line
#[derive(Parser)]
#[command(name = "kubedeck")]
#[command(about = "Run and observe kubedeck sessions", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command as a process session, streaming its output
    Run {
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Command to execute
        command: String,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Exit code used when the session was cancelled by the user
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    kubedeck::logging::init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => ManagerConfig::load(path).await?,
        None => {
            let mut config = ManagerConfig::default();
            config.merge_env_vars();
            config.validate()?;
            config
        }
    };

    match cli.command {
        Commands::Run { cwd, command, args } => run_command(config, command, args, cwd).await,
    }
}

async fn run_command(
    config: ManagerConfig,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
) -> Result<i32> {
    let manager = SessionManager::with_local_backend(config);

    let mut request = ProcessRequest::new(command).args(args);
    if let Some(dir) = cwd {
        request = request.current_dir(dir);
    }
    let (id, mut output) = manager
        .start_process_streaming(request)
        .context("Failed to start process")?;

    loop {
        tokio::select! {
            event = output.recv() => match event {
                Ok(OutputEvent::Line(line)) => println!("{line}"),
                Ok(OutputEvent::Finished { .. }) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} output lines", skipped),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling {}", id);
                manager.cancel_process(&id).await;
            }
        }
    }

    let session = manager
        .wait_for_terminal(&id)
        .await
        .ok_or_else(|| SessionError::NotFound(id.clone()))?;
    let process = session
        .as_process()
        .context("Session is not a process session")?;

    if let Some(message) = &process.error_message {
        eprintln!("{message}");
    }

    Ok(match session.status {
        SessionStatus::Success => process.exit_code.unwrap_or(0),
        SessionStatus::Cancelled => EXIT_CANCELLED,
        _ => process.exit_code.filter(|code| *code != 0).unwrap_or(1),
    })
}
