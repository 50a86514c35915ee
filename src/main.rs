//! `webcam`: capture from a V4L2 device and stream JPEG frames

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use webcam_streamer::capture::{self, CaptureSource};
use webcam_streamer::config::{Config, OutputKind};
use webcam_streamer::{filter, output, RunFlag, Session, SessionReport};

/// Time the driver thread gets to wind down after a stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "webcam")]
#[command(about = "Capture from a V4L2 webcam and stream JPEG frames")]
#[command(version, disable_help_flag = true)]
struct Cli {
    /// Verbose device and format diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Device node (default: scan /dev/video0 to /dev/video15)
    #[arg(short, long)]
    device: Option<String>,

    /// Frame width
    #[arg(short, long)]
    width: Option<u32>,

    /// Frame height
    #[arg(short = 'h', long)]
    height: Option<u32>,

    /// Frame rate
    #[arg(short = 'r', long)]
    frame_rate: Option<u32>,

    /// Capture buffer memory in MiB
    #[arg(short = 'm', long)]
    max_memory_mb: Option<u32>,

    /// Output mode
    #[arg(short, long, value_enum)]
    output: Option<OutputKind>,

    /// HTTP port for the http output
    #[arg(short, long)]
    port: Option<u16>,

    /// JPEG quality (0-100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Directory for the files output
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// TOML configuration file, overridden by the flags above
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(device) = self.device {
            config.device = Some(device);
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(rate) = self.frame_rate {
            config.frame_rate = rate;
        }
        if let Some(mb) = self.max_memory_mb {
            config.max_memory_mb = mb;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(quality) = self.quality {
            config.quality = Some(quality);
        }
        if let Some(dir) = self.capture_dir {
            config.capture_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout may carry the image stream
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.into_config()?;
    info!(
        device = config.device.as_deref().unwrap_or("auto"),
        width = config.width,
        height = config.height,
        frame_rate = config.frame_rate,
        output = ?config.output,
        "Configuration loaded"
    );

    let flag = RunFlag::new();
    let mut task = {
        let flag = flag.clone();
        tokio::task::spawn_blocking(move || run_session(&config, &flag))
    };

    let report = tokio::select! {
        joined = &mut task => joined.context("driver thread panicked")??,
        () = shutdown_signal() => {
            info!("Stop requested");
            flag.stop();
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(joined) => joined.context("driver thread panicked")??,
                Err(_) => {
                    // blocked in a device read or waiting for a client
                    warn!("Driver did not stop in time, exiting anyway");
                    return Ok(());
                }
            }
        }
    };

    info!(
        reason = ?report.reason,
        frames = report.stats.frames,
        bytes_out = report.stats.bytes_out,
        "Done"
    );
    Ok(())
}

/// Output first, as an HTTP client is awaited before the camera is opened.
fn run_session(config: &Config, flag: &RunFlag) -> Result<SessionReport> {
    let sink = output::open(&config.output_target()).context("opening output")?;

    let source = capture::negotiate(&config.to_capture_request())
        .context("capture device negotiation failed")?;
    let filter = filter::for_format(&source.format(), config.quality())
        .context("no filter for the negotiated format")?;

    Ok(Session::new(source, filter, sink).run(flag))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
