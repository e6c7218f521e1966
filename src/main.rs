use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{fmt, prelude::*};

use rswarm::{Config, Coordinator, HttpTracker, Progress, SessionInfo};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Download a single-file torrent and seed it back to the swarm.
#[derive(Parser, Debug)]
#[command(name = "rswarm", version, about)]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Where to write the payload (defaults to <download_dir>/<name>)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Continue from the saved progress of an earlier run
    #[arg(long)]
    resume: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen on exactly this port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Also write daily-rotated log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Stop once the download completes instead of seeding
    #[arg(long)]
    exit_on_complete: bool,
}

/// Commands read from stdin while the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Status,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p" | "pause" => Ok(Command::Pause),
            "r" | "resume" => Ok(Command::Resume),
            "s" | "status" => Ok(Command::Status),
            "q" | "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command {other:?} (pause, resume, status, quit)")),
        }
    }
}

fn init_logging(config: &Config) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let level = LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::INFO);
    let filter = Targets::new()
        .with_default(LevelFilter::WARN)
        .with_target("rswarm", level);

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(config.max_log_files)
                .filename_prefix("rswarm")
                .filename_suffix("log")
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter.clone());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .with(file_layer)
        .try_init();
    Ok(guard)
}

fn log_progress(progress: &Progress) {
    info!(
        percent = format_args!("{:.1}", progress.fraction() * 100.0),
        pieces = format_args!("{}/{}", progress.completed_pieces, progress.piece_count),
        peers = progress.connected_peers,
        downloaded = progress.downloaded,
        uploaded = progress.uploaded,
        paused = progress.paused,
        "progress"
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.listen_port_start = port;
        config.listen_port_end = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(dir) = cli.log_dir {
        config.log_dir = Some(dir);
    }
    config.validate()?;
    let _log_guard = init_logging(&config)?;

    let session = SessionInfo::from_torrent_file(&cli.torrent).await?;
    info!(
        name = %session.name,
        size = session.file_length,
        pieces = session.piece_count(),
        "loaded torrent"
    );

    let output = cli
        .output
        .unwrap_or_else(|| config.download_dir.join(&session.name));
    let tracker = HttpTracker::new(&session.announce, config.tracker_timeout())?;
    let coordinator = Coordinator::new(config, Arc::new(session), output, tracker);

    if let Err(e) = coordinator.start(cli.resume).await {
        error!(error = %e, "failed to start");
        coordinator.shutdown().await?;
        return Err(e.into());
    }

    info!("commands on stdin: pause, resume, status, quit");
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                info!("interrupted");
                break;
            }
            line = commands.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        stdin_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Pause) => coordinator.pause(),
                    Ok(Command::Resume) => coordinator.unpause(),
                    Ok(Command::Status) => log_progress(&coordinator.progress()),
                    Ok(Command::Quit) => break,
                    Err(e) => warn!("{e}"),
                }
            }
            _ = ticker.tick() => {
                let progress = coordinator.progress();
                log_progress(&progress);
                if cli.exit_on_complete && progress.complete {
                    info!("download complete, exiting");
                    break;
                }
            }
        }
    }

    coordinator.shutdown().await?;
    Ok(())
}
