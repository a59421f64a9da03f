//! ingestd - driving-simulator dataset ingestion daemon
//!
//! This daemon:
//! 1. Prepares the image directory and control log (header written once)
//! 2. Listens for one simulator connection at a time
//! 3. Persists every complete frame as three images plus one log row
//! 4. Stops cleanly on Ctrl-C or after `--max-sessions` sessions

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use drive_ingest::{IngestServer, IngestdConfig, PreviewFrame, PreviewTap};

const PREVIEW_CAPACITY: usize = 4;
const PREVIEW_LOG_INTERVAL: Duration = Duration::from_secs(5);
const SIGNAL_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    name = "ingestd",
    about = "Record simulator camera frames and controls into a training dataset"
)]
struct Args {
    /// JSON or TOML config file
    #[arg(long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(long)]
    addr: Option<String>,

    /// Directory that receives the camera images
    #[arg(long, value_name = "DIR")]
    image_dir: Option<PathBuf>,

    /// Control log (CSV)
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,

    /// Fail a session whose sender stalls this long mid-frame (0 disables)
    #[arg(long, value_name = "SECS")]
    read_timeout_secs: Option<u64>,

    /// Exit after this many sessions
    #[arg(long)]
    max_sessions: Option<u64>,

    /// What to do with a second client while one is active (reject|queue)
    #[arg(long, value_name = "POLICY")]
    busy_policy: Option<String>,

    /// Store each session's images in its own subdirectory
    #[arg(long)]
    session_subdirs: bool,

    /// Log the live frame rate from the preview tap
    #[arg(long)]
    preview_fps_log: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = IngestdConfig::load_from(args.config.as_deref())?;
    apply_args(&mut cfg, &args)?;
    cfg.validate()?;

    log::info!(
        "ingestd {} writing images to {} and controls to {}",
        env!("CARGO_PKG_VERSION"),
        cfg.image_dir.display(),
        cfg.log_path.display()
    );

    let mut server = IngestServer::new(cfg);
    if args.preview_fps_log {
        let (tap, rx) = PreviewTap::channel(PREVIEW_CAPACITY);
        server = server.with_preview(tap);
        std::thread::Builder::new()
            .name("preview-fps".to_string())
            .spawn(move || log_preview_rate(rx))
            .context("spawn preview consumer")?;
    }
    let handle = server.spawn()?;
    log::info!("ingestd listening on {}", handle.local_addr());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("ingestd waiting for simulator connections (Ctrl-C to stop)...");
    loop {
        while let Some(report) = handle.next_report(Duration::ZERO) {
            log::info!("{}", report);
        }
        if handle.is_finished() {
            log::info!("acceptor finished on its own");
            break;
        }
        match rx.recv_timeout(SIGNAL_POLL) {
            Ok(()) => {
                log::info!("shutdown signal received, stopping ingest server...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let summary = handle.stop()?;
    log::info!(
        "ingestd done: {} session(s), {} failed, {} rejected connection(s), {} frame(s) committed",
        summary.sessions,
        summary.failed_sessions,
        summary.rejected_connections,
        summary.frames_committed
    );
    Ok(())
}

fn apply_args(cfg: &mut IngestdConfig, args: &Args) -> Result<()> {
    if let Some(addr) = &args.addr {
        cfg.listen_addr = addr.clone();
    }
    if let Some(dir) = &args.image_dir {
        cfg.image_dir = dir.clone();
    }
    if let Some(path) = &args.log_path {
        cfg.log_path = path.clone();
    }
    if let Some(secs) = args.read_timeout_secs {
        cfg.read_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(max) = args.max_sessions {
        cfg.max_sessions = Some(max);
    }
    if let Some(policy) = &args.busy_policy {
        cfg.busy_policy = policy.parse()?;
    }
    if args.session_subdirs {
        cfg.session_subdirs = true;
    }
    Ok(())
}

fn log_preview_rate(rx: Receiver<PreviewFrame>) {
    let mut last_log = Instant::now();
    for frame in rx {
        if last_log.elapsed() < PREVIEW_LOG_INTERVAL {
            continue;
        }
        log::info!(
            "preview: session {} frame {} at {:.1} fps ({}x{})",
            frame.session,
            frame.frame_id,
            frame.fps,
            frame.image.width(),
            frame.image.height()
        );
        last_log = Instant::now();
    }
}
