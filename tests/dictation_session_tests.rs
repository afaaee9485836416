// Integration tests for streaming dictation sessions
//
// These tests verify the live pipeline: hypotheses replace the transcript
// wholesale, stop() finishes gracefully through the recognition task's
// Completed state, and errors/interruptions always release the device claim.

use std::sync::Arc;
use std::time::Duration;

use voice_capture::{
    AudioConfig, AudioDevice, CaptureError, Config, DictationSession, FileRecordingSession,
    SessionArbiter, SessionSnapshot, SessionState, SimDevice, SimRecognizer, SpeechRecognizer,
    StorageConfig, StorageKind,
};

use tempfile::TempDir;
use tokio::sync::watch;

struct Fixture {
    arbiter: Arc<SessionArbiter>,
    device: Arc<SimDevice>,
    recognizer: Arc<SimRecognizer>,
    config: Config,
    _temp_dir: TempDir,
}

fn fixture() -> Fixture {
    let temp_dir = TempDir::new().expect("temp dir");

    let config = Config {
        audio: AudioConfig {
            sample_rate: 8000,
            channels: 1,
            frame_duration_ms: 5,
        },
        storage: StorageConfig {
            recordings_dir: temp_dir.path().join("recordings"),
            scratch_dir: Some(temp_dir.path().join("scratch")),
        },
    };

    Fixture {
        arbiter: Arc::new(SessionArbiter::new()),
        device: Arc::new(SimDevice::new()),
        recognizer: Arc::new(SimRecognizer::new()),
        config,
        _temp_dir: temp_dir,
    }
}

fn dictation(fx: &Fixture) -> DictationSession {
    DictationSession::new(
        Arc::clone(&fx.arbiter),
        Arc::clone(&fx.device) as Arc<dyn AudioDevice>,
        Arc::clone(&fx.recognizer) as Arc<dyn SpeechRecognizer>,
        &fx.config,
        false,
    )
}

async fn wait_for(
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(2), snapshots.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("session snapshot channel closed")
        .clone()
}

#[tokio::test]
async fn hypotheses_replace_the_transcript_wholesale() {
    let fx = fixture();
    for text in ["h", "he llo", "hello world"] {
        fx.recognizer.push_hypothesis(text);
    }
    let session = dictation(&fx);
    let mut snapshots = session.subscribe();

    session.start().expect("dictation starts");
    let snapshot = wait_for(&mut snapshots, |s| {
        s.transcript.full_text == "hello world"
    })
    .await;

    // The buffer equals the latest hypothesis, not a concatenation.
    assert_eq!(snapshot.transcript.segments, vec!["hello", "world"]);

    session.stop();
    let snapshot = wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;

    // The final result re-states the best hypothesis; the transcript
    // survives the stop.
    assert_eq!(snapshot.transcript.full_text, "hello world");
    assert!(!snapshot.is_recording);
    assert_eq!(fx.arbiter.current_claimant(), None);
}

#[tokio::test]
async fn stop_finishes_through_the_recognition_task() {
    let fx = fixture();
    fx.recognizer.push_hypothesis("quick note");
    let session = dictation(&fx);
    let mut snapshots = session.subscribe();

    session.start().expect("dictation starts");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    assert_eq!(fx.arbiter.current_claimant(), Some(session.id()));
    assert!(fx.device.is_capturing());

    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;

    // Teardown ran on Completed: capture stream removed, claim released.
    assert!(!fx.device.is_capturing());
    assert_eq!(fx.arbiter.current_claimant(), None);
}

#[tokio::test]
async fn start_while_recording_is_a_noop() {
    let fx = fixture();
    let session = dictation(&fx);
    let mut snapshots = session.subscribe();

    session.start().expect("dictation starts");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;

    session.start().expect("second start is a no-op");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fx.device.install_count(), 1);
    assert_eq!(fx.recognizer.stream_count(), 1);

    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;
}

#[tokio::test]
async fn recognition_error_fails_session_and_keeps_transcript() {
    let fx = fixture();
    fx.recognizer.fail_next_stream("engine crashed");
    let session = dictation(&fx);
    let mut snapshots = session.subscribe();

    session.start().expect("dictation starts");
    let snapshot = wait_for(&mut snapshots, |s| s.state.is_terminal()).await;

    // An error before any result is surfaced like a completion event; the
    // transcript stays untouched and the claim is released.
    assert!(matches!(snapshot.state, SessionState::Failed(_)));
    assert!(matches!(snapshot.error, Some(CaptureError::Recognition(_))));
    assert!(snapshot.transcript.is_empty());
    assert_eq!(fx.arbiter.current_claimant(), None);
}

#[tokio::test]
async fn dictation_is_refused_while_a_file_session_records() {
    let fx = fixture();
    let recorder = FileRecordingSession::new(
        Arc::clone(&fx.arbiter),
        Arc::clone(&fx.device) as Arc<dyn AudioDevice>,
        Arc::clone(&fx.recognizer) as Arc<dyn SpeechRecognizer>,
        &fx.config,
        StorageKind::Transient,
        false,
    )
    .expect("file session constructible");
    let mut recorder_snapshots = recorder.subscribe();

    recorder.record().expect("file recording starts");
    wait_for(&mut recorder_snapshots, |s| {
        s.state == SessionState::Recording
    })
    .await;

    // The dictation session never leaves Idle and never opens a stream.
    let session = dictation(&fx);
    assert!(matches!(session.start(), Err(CaptureError::Busy(_))));
    assert_eq!(session.snapshot().state, SessionState::Idle);
    assert_eq!(fx.recognizer.stream_count(), 0);
    assert_eq!(fx.device.install_count(), 1);
}

#[tokio::test]
async fn interruption_finishes_dictation_and_releases_claim() {
    let fx = fixture();
    fx.recognizer.push_hypothesis("cut short");
    let session = dictation(&fx);
    let mut snapshots = session.subscribe();

    session.start().expect("dictation starts");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(15)).await;

    fx.device.begin_interruption();

    let snapshot = wait_for(&mut snapshots, |s| s.state.is_terminal()).await;
    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(fx.arbiter.current_claimant(), None);
    assert!(!fx.device.is_capturing());
}

#[tokio::test]
async fn reset_returns_a_finished_dictation_to_idle() {
    let fx = fixture();
    fx.recognizer.push_hypothesis("scratch that");
    let session = dictation(&fx);
    let mut snapshots = session.subscribe();

    session.start().expect("dictation starts");
    wait_for(&mut snapshots, |s| !s.transcript.is_empty()).await;
    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;

    session.reset();
    let snapshot = wait_for(&mut snapshots, |s| s.state == SessionState::Idle).await;
    assert!(snapshot.transcript.is_empty());
    assert!(snapshot.error.is_none());
}
