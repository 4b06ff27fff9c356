use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use session_visuals_core::{
    list_input_devices, AppConfig, AudioFeatureProcessor, LinkState, SessionVizError,
};
use tracing_subscriber::EnvFilter;

/// Frame pacing for the analysis loop, standing in for the display's
/// animation callback.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

fn main() -> session_visuals_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live {
            device,
            sensitivity,
            config,
            seconds,
        } => run_live(device, sensitivity, config.as_deref(), seconds),
        Commands::Devices => run_devices(),
    }
}

fn run_live(
    device: Option<String>,
    sensitivity: Option<u8>,
    config: Option<&std::path::Path>,
    seconds: u64,
) -> session_visuals_core::Result<()> {
    let config = match config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::live_defaults(),
    };

    let mut processor = AudioFeatureProcessor::new(config);
    processor.set_device(device);
    if let Some(value) = sensitivity {
        processor.set_sensitivity(value);
    }

    let mut frame: u64 = 0;
    processor.add_observer(move |snapshot| {
        frame += 1;
        if snapshot.beat_detected {
            tracing::info!(
                volume = snapshot.volume,
                frequency = snapshot.dominant_frequency,
                note = ?snapshot.dominant_note,
                "beat"
            );
        } else if frame % 60 == 0 {
            tracing::debug!(
                volume = snapshot.volume,
                bass = snapshot.bands.bass,
                treble = snapshot.bands.treble,
                "frame"
            );
        }
    });

    processor.initialize()?;
    tracing::info!(sensitivity = processor.sensitivity(), "live analysis running");

    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    loop {
        processor.process_frame();

        if matches!(processor.link_state(), LinkState::Failed) {
            processor.stop();
            return Err(SessionVizError::msg(
                "microphone connection lost and automatic recovery exhausted",
            ));
        }
        if deadline.map(|end| Instant::now() >= end).unwrap_or(false) {
            processor.stop();
            return Ok(());
        }

        std::thread::sleep(FRAME_INTERVAL);
    }
}

fn run_devices() -> session_visuals_core::Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        println!("no capture devices found");
    }
    for name in devices {
        println!("{name}");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live audio visuals for folk sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture the microphone and log the analysed features.
    Live {
        /// Capture device name; the platform default when omitted.
        #[arg(short, long)]
        device: Option<String>,
        /// Gain multiplier 1-10, 5 being neutral.
        #[arg(short, long)]
        sensitivity: Option<u8>,
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Stop after this many seconds; 0 runs until interrupted.
        #[arg(long, default_value_t = 0)]
        seconds: u64,
    },
    /// List the available capture devices.
    Devices,
}
