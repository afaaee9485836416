use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use voice_capture::{
    AudioDevice, Config, DictationSession, FileRecordingSession, SessionArbiter, SessionSnapshot,
    SessionState, SimDevice, SimRecognizer, SpeechRecognizer, StorageKind,
};

#[derive(Parser)]
#[command(name = "voice-capture", about = "Voice capture session demo")]
struct Cli {
    /// Configuration file basename (e.g. config/voice-capture)
    #[arg(long, default_value = "config/voice-capture")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a simulated memo, transcribe it, and play it back
    Record,
    /// Run a short simulated live dictation
    Dictate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            info!("No config at {} ({}); using defaults", cli.config, error);
            Config::default()
        }
    };

    let arbiter = Arc::new(SessionArbiter::new());
    let device = Arc::new(SimDevice::new());
    let recognizer = Arc::new(SimRecognizer::new());
    let _ = arbiter.bind_authorization(Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>);

    match cli.command {
        Command::Record => run_record(arbiter, device, recognizer, &config).await,
        Command::Dictate => run_dictate(arbiter, device, recognizer, &config).await,
    }
}

async fn run_record(
    arbiter: Arc<SessionArbiter>,
    device: Arc<SimDevice>,
    recognizer: Arc<SimRecognizer>,
    config: &Config,
) -> Result<()> {
    recognizer.set_file_result("this is a simulated voice memo");

    let session = FileRecordingSession::new(
        arbiter,
        Arc::clone(&device) as Arc<dyn AudioDevice>,
        Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>,
        config,
        StorageKind::Transient,
        false,
    )?;
    let mut snapshots = session.subscribe();

    session.record()?;
    wait_for(&mut snapshots, "recording to start", |s| {
        s.state == SessionState::Recording
    })
    .await?;
    info!("Recording to {}", session.path().display());

    tokio::time::sleep(Duration::from_millis(500)).await;
    session.stop();
    wait_for(&mut snapshots, "the take to complete", |s| {
        s.state == SessionState::Completed && s.can_play
    })
    .await?;

    // Transcribe as soon as the take is playable, then listen back.
    let transcript = session.transcribe().await?;
    info!("Transcript: {}", transcript.full_text);

    if session.play() {
        wait_for(&mut snapshots, "playback to start", |s| s.is_playing).await?;
        wait_for(&mut snapshots, "playback to finish", |s| {
            s.state == SessionState::Completed && !s.is_playing
        })
        .await?;
    }

    print_snapshot(&session.snapshot())
}

async fn run_dictate(
    arbiter: Arc<SessionArbiter>,
    device: Arc<SimDevice>,
    recognizer: Arc<SimRecognizer>,
    config: &Config,
) -> Result<()> {
    for text in ["this", "this is", "this is live dictation"] {
        recognizer.push_hypothesis(text);
    }

    let session = DictationSession::new(
        arbiter,
        Arc::clone(&device) as Arc<dyn AudioDevice>,
        Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>,
        config,
        true,
    );
    let mut snapshots = session.subscribe();

    session.start()?;
    wait_for(&mut snapshots, "the final hypothesis", |s| {
        s.transcript.full_text == "this is live dictation"
    })
    .await?;

    session.stop();
    wait_for(&mut snapshots, "dictation to complete", |s| {
        s.state == SessionState::Completed
    })
    .await?;

    print_snapshot(&session.snapshot())
}

async fn wait_for(
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    what: &str,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> Result<SessionSnapshot> {
    let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(predicate))
        .await
        .with_context(|| format!("timed out waiting for {}", what))?
        .with_context(|| format!("session ended while waiting for {}", what))?;

    Ok(snapshot.clone())
}

fn print_snapshot(snapshot: &SessionSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}
