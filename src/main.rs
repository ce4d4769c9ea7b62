//! cam-arbiter binary: drive a camera through an arbitrated session.

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cam_arbiter::{CameraSession, Frame, SessionConfig, StreamWorker, V4L2Opener};

/// Frames streamed when neither `--frames` nor `--seconds` is given.
const DEFAULT_STREAM_FRAMES: u64 = 30;

#[derive(Debug, Parser)]
#[command(name = "cam-arbiter", version, about = "Arbitrated access to a V4L2 camera")]
struct Cli {
    /// TOML configuration file layered under `CAM_ARBITER_*` variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device index, overriding the configuration (0 for /dev/video0).
    #[arg(long, global = true)]
    device: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture one frame and write its raw bytes to a file.
    Capture {
        /// Destination file.
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Stream frames in continuous mode and print their metadata.
    Stream {
        /// Stop after this many frames.
        #[arg(long)]
        frames: Option<u64>,
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Print the session status as JSON.
    Status,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cam_arbiter=info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::load().context("loading configuration")?,
    };
    if let Some(index) = cli.device {
        config.device_index = index;
    }

    let session = CameraSession::new(V4L2Opener, config);
    let outcome = execute(&session, cli.command);
    session.cleanup();
    outcome
}

fn execute(session: &CameraSession<V4L2Opener>, command: Command) -> Result<()> {
    match command {
        Command::Capture { output } => capture(session, &output),
        Command::Stream { frames, seconds } => stream(session, frames, seconds),
        Command::Status => {
            let status = serde_json::to_string_pretty(&session.status())?;
            println!("{status}");
            Ok(())
        }
    }
}

fn capture(session: &CameraSession<V4L2Opener>, output: &Path) -> Result<()> {
    let frame = session
        .capture_one_frame()
        .map_err(|err| anyhow::anyhow!("capture failed ({}): {err}", err.reason()))?;

    fs::write(output, &frame.data).with_context(|| format!("writing {}", output.display()))?;
    info!(
        sequence = frame.metadata.sequence,
        bytes = frame.data.len(),
        output = %output.display(),
        "frame captured"
    );
    Ok(())
}

fn stream(
    session: &CameraSession<V4L2Opener>,
    frames: Option<u64>,
    seconds: Option<u64>,
) -> Result<()> {
    let limit = match (frames, seconds) {
        (None, None) => Some(DEFAULT_STREAM_FRAMES),
        (limit, _) => limit,
    };

    let mut seen = 0u64;
    let sink = move |frame: &Frame, analyze: bool| {
        seen += 1;
        println!(
            "Frame {}: {} bytes, timestamp: {:?}{}",
            frame.metadata.sequence,
            frame.data.len(),
            frame.metadata.timestamp,
            if analyze { " [analyze]" } else { "" }
        );
        if limit.is_some_and(|limit| seen >= limit) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };

    let worker = StreamWorker::spawn(session, sink).context("spawning stream worker")?;
    let report = match seconds {
        Some(seconds) => {
            let deadline = Instant::now() + Duration::from_secs(seconds);
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            worker.stop()
        }
        None => worker.join(),
    }
    .map_err(|err| anyhow::anyhow!("stream failed ({}): {err}", err.reason()))?;

    info!(
        frames = report.frames,
        read_failures = report.read_failures,
        end = ?report.end,
        "stream finished"
    );
    Ok(())
}
