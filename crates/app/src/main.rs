use std::{path::PathBuf, sync::Arc};

use beat_overlay_core::{
    configure, AnalysisProvider, AppConfig, FetchOutcome, FileAnalysisProvider, SampleVoice,
    Sampler, SimulatedPlayer, SyncError, SyncSession,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const FALLBACK_DURATION_MS: u64 = 30_000;

fn main() -> beat_overlay_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Run {
            analysis,
            sample,
            start_ms,
        } => run(&config, &analysis, sample.as_ref(), start_ms),
        Commands::Inspect { analysis } => inspect(&config, &analysis),
    }
}

fn run(
    config: &AppConfig,
    analysis_path: &PathBuf,
    sample: Option<&PathBuf>,
    start_ms: u64,
) -> beat_overlay_core::Result<()> {
    let voice = match sample {
        Some(path) => Sampler::load_wav(path)?,
        None => Sampler::click(DEFAULT_SAMPLE_RATE),
    };
    tracing::info!(sample_rate = voice.sample_rate(), "sample ready");
    let voice: Box<dyn SampleVoice> = Box::new(voice);

    let session = SyncSession::new(config.sync.clone(), voice);
    let (provider, track) = FileAnalysisProvider::for_file(analysis_path)?;
    let outcome = session
        .fetch_with(Arc::new(provider), track)?
        .join()
        .map_err(|_| SyncError::msg("analysis fetch panicked"))??;

    if outcome == FetchOutcome::Failed {
        let snapshot = session.snapshot()?;
        return Err(SyncError::msg(
            snapshot
                .status
                .error
                .unwrap_or_else(|| "analysis unavailable".to_string()),
        ));
    }

    let snapshot = session.snapshot()?;
    tracing::info!(
        bpm = ?snapshot.bpm,
        key = ?snapshot.key,
        beats = snapshot.beat_count,
        do_not_play_until = snapshot.do_not_play_until,
        "overlay armed"
    );

    let duration_ms = snapshot
        .duration_seconds
        .map(|seconds| (seconds * 1000.0) as u64)
        .unwrap_or(FALLBACK_DURATION_MS);
    let poller = session.spawn_poller()?;
    let player = SimulatedPlayer::new(duration_ms, config.playback.update_interval())
        .starting_at(start_ms);
    let sink = session.clone();
    let playback = player.spawn(move |event| {
        if let Err(err) = sink.on_playback_event(event) {
            tracing::error!(%err, "failed to mirror playback state");
        }
    })?;

    playback
        .join()
        .map_err(|_| SyncError::msg("simulated player panicked"))?;
    poller.stop()?;

    let snapshot = session.snapshot()?;
    if let Some(error) = &snapshot.status.error {
        tracing::warn!(%error, "session finished with an error");
    }
    println!(
        "{} trigger(s) over {:.1}s of playback ({} position updates)",
        snapshot.triggers,
        duration_ms.saturating_sub(start_ms) as f64 / 1000.0,
        snapshot.playback_updates
    );
    Ok(())
}

fn inspect(config: &AppConfig, analysis_path: &PathBuf) -> beat_overlay_core::Result<()> {
    let (provider, track) = FileAnalysisProvider::for_file(analysis_path)?;
    let analysis = provider.fetch(&track)?;
    let effects = configure(&analysis, &config.sync);
    let summary = analysis.track();

    println!("track:      {track}");
    match summary.display_bpm() {
        Some(bpm) => println!("bpm:        {bpm}"),
        None => println!("bpm:        unknown"),
    }
    println!("key:        {}", summary.key.name());
    println!("beats:      {}", analysis.beats().len());
    println!("pitch:      {:+} semitones", effects.key_diff);
    match effects.cooldown_floor {
        Some(floor) => println!("first fire: {floor:.2}s"),
        None => println!("first fire: 0.00s"),
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
#[command(author, version, about = "Fire a sample on the beats of a streamed track", long_about = None)]
struct Cli {
    /// JSON configuration file overriding the default tuning.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a track through the simulated player and overlay the sample.
    Run {
        /// Audio analysis document, named after the track id.
        #[arg(short, long)]
        analysis: PathBuf,
        /// WAV file to overlay. A short synthesised tone is used otherwise.
        #[arg(short, long)]
        sample: Option<PathBuf>,
        /// Playback position to start from, in milliseconds.
        #[arg(long, default_value_t = 0)]
        start_ms: u64,
    },
    /// Print tempo, key and the effect settings derived from an analysis.
    Inspect {
        #[arg(short, long)]
        analysis: PathBuf,
    },
}
