use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use reactive_audio_core::{
    AppConfig, AudioError, AudioSource, DeviceProvider, FrequencyPolicy, MemoryProvider,
    PlaybackEngine, Reaction, ReactionSet, ReactionTarget,
};
use tracing_subscriber::EnvFilter;

fn main() -> reactive_audio_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play(args) => run_play(args),
        Commands::Inspect { input } => run_inspect(&input),
    }
}

fn run_play(args: PlayArgs) -> reactive_audio_core::Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let deadline = match args.seconds {
        Some(seconds) => Some(
            Instant::now()
                + Duration::try_from_secs_f64(seconds).map_err(|err| {
                    AudioError::Config(format!("invalid --seconds value {seconds}: {err}"))
                })?,
        ),
        None => None,
    };

    let source = AudioSource::from_path(&args.input)?;
    let engine = PlaybackEngine::load(
        source,
        args.looping,
        device_provider(args.headless),
        config.engine.clone(),
    )?;

    engine.set_volume(args.volume);
    if args.muted {
        engine.mute();
    }
    if let Some(progression) = args.seek {
        engine.set_progression(progression);
    }

    let mut reactions = default_reactions(FrequencyPolicy::from(&config.reactions));
    tracing::info!(
        name = engine.name(),
        duration = ?engine.duration(),
        looping = engine.is_looping(),
        "starting playback"
    );
    engine.play();

    loop {
        thread::sleep(tick);

        let updates = reactions.evaluate(&engine);
        tracing::info!(
            progression = engine.progression(),
            position = ?engine.position(),
            amplitude = engine.instantaneous_amplitude(),
            ?updates,
            "tick"
        );

        if !engine.is_looping() && engine.progression() >= 1.0 {
            tracing::info!("reached end of stream");
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
    }

    engine.stop();
    tracing::info!(
        frames = engine.frames_processed(),
        transient_errors = engine.transient_errors(),
        "playback finished"
    );
    Ok(())
}

fn run_inspect(input: &Path) -> reactive_audio_core::Result<()> {
    let source = AudioSource::from_path(input)?;
    let format = source.format();
    tracing::info!(
        name = source.name(),
        channels = format.channels,
        sample_rate = format.sample_rate,
        bits_per_sample = format.bits_per_sample,
        endianness = ?format.endianness,
        data_bytes = source.data_len(),
        duration = ?source.duration(),
        "inspected source"
    );
    Ok(())
}

/// Shapes a renderer would typically animate: a pulsing size, a bass-driven
/// width and a treble-driven blue channel.
fn default_reactions(policy: FrequencyPolicy) -> ReactionSet {
    let mut reactions = ReactionSet::new(policy);
    reactions.push(Reaction::amplitude(ReactionTarget::Size, 1.0, 2.0));
    reactions.push(Reaction::frequency(
        20.0,
        250.0,
        ReactionTarget::Width,
        50.0,
        150.0,
    ));
    reactions.push(Reaction::frequency(
        2_000.0,
        8_000.0,
        ReactionTarget::ColorBlue,
        0.0,
        254.0,
    ));
    reactions
}

#[cfg(feature = "device")]
fn device_provider(headless: bool) -> Arc<dyn DeviceProvider> {
    if headless {
        Arc::new(MemoryProvider::real_time())
    } else {
        Arc::new(reactive_audio_core::output::cpal::CpalProvider::new())
    }
}

#[cfg(not(feature = "device"))]
fn device_provider(headless: bool) -> Arc<dyn DeviceProvider> {
    if !headless {
        tracing::warn!("built without the `device` feature, playing headless");
    }
    Arc::new(MemoryProvider::real_time())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive playback engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a WAV or AIFF file and log the analysis once per tick.
    Play(PlayArgs),
    /// Print the format and length of an audio file.
    Inspect {
        /// Path to the audio file.
        input: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PlayArgs {
    /// Path to a 16-bit PCM WAV or AIFF file.
    input: PathBuf,
    /// Restart from the beginning at the end of the stream.
    #[arg(short, long = "loop")]
    looping: bool,
    /// Output volume between 0 and 1.
    #[arg(long, default_value_t = 1.0)]
    volume: f32,
    /// Start muted.
    #[arg(long)]
    muted: bool,
    /// Start position as a fraction of the file, between 0 and 1.
    #[arg(long)]
    seek: Option<f64>,
    /// Stop after this many seconds.
    #[arg(long)]
    seconds: Option<f64>,
    /// Milliseconds between two analysis readings.
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,
    /// Consume audio without an output device.
    #[arg(long)]
    headless: bool,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}
