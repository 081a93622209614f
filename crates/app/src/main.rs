use std::{
    fs,
    path::{Path, PathBuf},
    thread,
};

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use drop_detector_core::{
    scan_folder, AnalysisConfig, AnalysisSession, AppConfig, AudioOutputDevice, CancellationToken,
    ChannelObserver, PlaybackState, PlaybackSynchronizer, PlaybackUpdate, SilentOutput,
    SymphoniaLoader, SystemClock,
};
use tracing_subscriber::EnvFilter;

fn main() -> drop_detector_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::List { folder } => {
            let folder = folder.unwrap_or_else(|| PathBuf::from(&config.songs_folder));
            run_list(&folder)
        }
        Commands::Analyze {
            input,
            tuning,
            output,
        } => {
            tuning.apply(&mut config.analysis);
            run_analyze(&input, &config.analysis, output.as_deref())
        }
        Commands::Play {
            input,
            tuning,
            start,
            silent,
        } => {
            tuning.apply(&mut config.analysis);
            run_play(&input, &config, start, silent)
        }
    }
}

fn run_list(folder: &Path) -> drop_detector_core::Result<()> {
    if !folder.exists() {
        fs::create_dir_all(folder)?;
        println!("Created '{}'. Add .mp3 or .wav files to it.", folder.display());
        return Ok(());
    }

    let songs = scan_folder(folder)?;
    if songs.is_empty() {
        println!("No songs found in '{}'.", folder.display());
        return Ok(());
    }

    for (i, song) in songs.iter().enumerate() {
        let name = song
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!("{}. {name}", i + 1);
    }
    Ok(())
}

fn load_and_analyze(
    input: &Path,
    analysis: &AnalysisConfig,
) -> drop_detector_core::Result<AnalysisSession> {
    let mut session = AnalysisSession::new();
    session.load(&SymphoniaLoader, input)?;
    let timeline = session.analyze(analysis)?;
    println!("Drops (seconds): {}", format_times(timeline.drops()));
    Ok(session)
}

fn run_analyze(
    input: &Path,
    analysis: &AnalysisConfig,
    output: Option<&Path>,
) -> drop_detector_core::Result<()> {
    tracing::info!(?input, ?output, "analysing track");
    let session = load_and_analyze(input, analysis)?;

    if let Some(output) = output {
        let report = session
            .timeline()?
            .report(input.display().to_string(), analysis);
        report.write_json(output)?;
        println!("Report saved to {}", output.display());
    }
    Ok(())
}

fn run_play(
    input: &Path,
    config: &AppConfig,
    start: f32,
    silent: bool,
) -> drop_detector_core::Result<()> {
    let session = load_and_analyze(input, &config.analysis)?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(%err, "could not install Ctrl+C handler");
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let printer = thread::spawn(move || print_updates(rx));
    let mut observer = ChannelObserver::new(tx);

    println!("Playing... (Ctrl+C to stop)");
    let clock = SystemClock::new();
    let device = output_device(silent, clock);
    let mut synchronizer = PlaybackSynchronizer::new(device, clock, &config.playback)?;
    let result = session.play(&mut synchronizer, start, &cancel, &mut observer);

    drop(observer);
    if printer.join().is_err() {
        tracing::warn!("playback printer thread panicked");
    }
    result.map(|_| ())
}

#[cfg(feature = "device")]
fn output_device(silent: bool, clock: SystemClock) -> Box<dyn AudioOutputDevice> {
    if silent {
        Box::new(SilentOutput::new(clock))
    } else {
        Box::new(drop_detector_core::CpalOutput::new())
    }
}

#[cfg(not(feature = "device"))]
fn output_device(silent: bool, clock: SystemClock) -> Box<dyn AudioOutputDevice> {
    if !silent {
        tracing::warn!("built without the `device` feature; playing silently");
    }
    Box::new(SilentOutput::new(clock))
}

/// Rendering side of playback: prints drops as they are crossed.
fn print_updates(rx: Receiver<PlaybackUpdate>) {
    for update in rx {
        match update {
            PlaybackUpdate::Tick(_) => {}
            PlaybackUpdate::Drop(event) => {
                println!("DROP! time: {:.2}", event.time);
            }
            PlaybackUpdate::Finished(outcome) => match outcome.state {
                PlaybackState::Cancelled => {
                    println!("\nStopped at {:.2}s", outcome.cursor.current_time)
                }
                _ => println!("\nPlayback finished ({} drops)", outcome.drops_emitted),
            },
        }
    }
}

fn format_times(times: &[f32]) -> String {
    let formatted: Vec<String> = times.iter().map(|t| format!("{t:.2}")).collect();
    format!("[{}]", formatted.join(", "))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Find and replay the drops in a track", long_about = None)]
struct Cli {
    /// JSON configuration file. Command line flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the songs available for analysis.
    List {
        /// Folder to scan instead of the configured songs folder.
        #[arg(short, long)]
        folder: Option<PathBuf>,
    },
    /// Detect drops in a track and print their timestamps.
    Analyze {
        /// Path to the audio file that should be analysed.
        input: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
        /// Write the envelope and drops to this JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Detect drops, then play the track and announce each drop live.
    Play {
        /// Path to the audio file that should be played.
        input: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
        /// Position to start playback from, in seconds.
        #[arg(short, long, default_value_t = 0.0)]
        start: f32,
        /// Keep the timing loop but skip the audio device.
        #[arg(long)]
        silent: bool,
    },
}

#[derive(Args, Debug)]
struct Tuning {
    /// Minimum onset strength (dB of median rise) for a drop.
    #[arg(short, long)]
    threshold: Option<f32>,
    /// Minimum gap between drops, in seconds.
    #[arg(short = 'd', long)]
    min_distance: Option<f32>,
    /// Samples between analysis frames.
    #[arg(long)]
    hop_size: Option<usize>,
}

impl Tuning {
    fn apply(&self, analysis: &mut AnalysisConfig) {
        if let Some(threshold) = self.threshold {
            analysis.threshold = threshold;
        }
        if let Some(min_distance) = self.min_distance {
            analysis.min_distance_seconds = min_distance;
        }
        if let Some(hop_size) = self.hop_size {
            analysis.hop_size = hop_size;
        }
    }
}
