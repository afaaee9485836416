// Integration tests for file recording sessions
//
// These tests drive the session state machine against the simulated device
// and recognizer: record/stop/play/transcribe lifecycles, claim release on
// every exit path, interruption handling, and transient storage teardown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use voice_capture::{
    AudioConfig, AudioDevice, CaptureError, Config, FileRecordingSession, SessionArbiter,
    SessionSnapshot, SessionState, SimDevice, SimRecognizer, SpeechRecognizer, StorageConfig,
    StorageKind,
};

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
            frame_duration_ms: 5, // Small frames so takes finish quickly
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

fn session(fixture: &Fixture, kind: StorageKind) -> FileRecordingSession {
    FileRecordingSession::new(
        Arc::clone(&fixture.arbiter),
        Arc::clone(&fixture.device) as Arc<dyn AudioDevice>,
        Arc::clone(&fixture.recognizer) as Arc<dyn SpeechRecognizer>,
        &fixture.config,
        kind,
        false,
    )
    .expect("session should be constructible")
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

async fn wait_for_release(arbiter: &SessionArbiter) {
    for _ in 0..200 {
        if arbiter.current_claimant().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("arbiter slot was never released");
}

#[tokio::test]
async fn record_stop_completes_and_releases_claim() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    assert_eq!(fx.arbiter.current_claimant(), Some(session.id()));

    // Let a few frames land before stopping.
    tokio::time::sleep(Duration::from_millis(40)).await;
    session.stop();

    let snapshot = wait_for(&mut snapshots, |s| {
        s.state == SessionState::Completed && s.can_play
    })
    .await;

    assert!(!snapshot.is_recording);
    assert!(snapshot.error.is_none());
    assert_eq!(fx.arbiter.current_claimant(), None);

    // The finalized WAV must exist and hold more than a bare header.
    let metadata = std::fs::metadata(session.path()).expect("recording file should exist");
    assert!(metadata.len() > 44, "recording should contain samples");
}

#[tokio::test]
async fn busy_claim_leaves_second_session_idle() {
    let fx = fixture();
    let first = session(&fx, StorageKind::Persistent);
    let second = session(&fx, StorageKind::Persistent);
    let mut first_snapshots = first.subscribe();

    first.record().expect("first record should start");
    wait_for(&mut first_snapshots, |s| s.state == SessionState::Recording).await;

    // The device is held: the second session is refused synchronously and
    // never touches the device.
    let denied = second.record();
    assert!(matches!(denied, Err(CaptureError::Busy(_))));
    assert_eq!(second.snapshot().state, SessionState::Idle);
    assert_eq!(fx.device.install_count(), 1);

    first.stop();
    wait_for(&mut first_snapshots, |s| s.state == SessionState::Completed).await;

    // Once the slot is free the second session can run.
    second.record().expect("second record should start");
    let mut second_snapshots = second.subscribe();
    wait_for(&mut second_snapshots, |s| s.state == SessionState::Recording).await;
    assert_eq!(fx.arbiter.current_claimant(), Some(second.id()));
}

#[tokio::test]
async fn play_without_playable_recording_returns_false() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Persistent);

    assert!(!session.play());

    // No state change, no resource allocation.
    assert_eq!(session.snapshot().state, SessionState::Idle);
    assert_eq!(fx.device.playback_count(), 0);
    assert_eq!(fx.arbiter.current_claimant(), None);
}

#[tokio::test]
async fn transcribe_replaces_transcript_without_touching_state() {
    let fx = fixture();
    fx.recognizer.set_file_result("hello from the memo");
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed && s.can_play).await;

    let transcript = session.transcribe().await.expect("transcription succeeds");
    assert_eq!(transcript.full_text, "hello from the memo");
    assert_eq!(transcript.segments, vec!["hello", "from", "the", "memo"]);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(snapshot.transcript.full_text, "hello from the memo");
}

#[tokio::test]
async fn transcribe_failure_reports_error_and_keeps_state() {
    let fx = fixture();
    fx.recognizer.fail_next_file("model offline");
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;

    let result = session.transcribe().await;
    assert!(matches!(result, Err(CaptureError::Recognition(_))));

    // The failure lands on the error field but the state machine is
    // untouched.
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Completed);
    assert!(matches!(snapshot.error, Some(CaptureError::Recognition(_))));
    assert!(snapshot.transcript.is_empty());
}

#[tokio::test]
async fn recording_preempts_playback() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed && s.can_play).await;

    assert!(session.play());
    let snapshot = wait_for(&mut snapshots, |s| s.is_playing).await;
    assert!(!snapshot.is_recording);

    // Recording while playing stops playback first; the two are never
    // concurrent within one session.
    session.record().expect("record during playback is queued");
    let snapshot = wait_for(&mut snapshots, |s| s.is_recording).await;
    assert!(!snapshot.is_playing);
    assert_eq!(snapshot.state, SessionState::Recording);

    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;
    assert_eq!(fx.arbiter.current_claimant(), None);
}

#[tokio::test]
async fn transient_file_is_removed_when_session_dropped_mid_recording() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Transient);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let path = session.path().to_path_buf();
    assert!(path.exists(), "recording file should exist while recording");

    // Dropping the session mid-recording must still remove the transient
    // file and give the claim back.
    drop(session);
    assert!(!path.exists(), "transient file must not outlive the session");
    wait_for_release(&fx.arbiter).await;
}

#[tokio::test]
async fn interruption_stops_recording_without_a_caller_stop() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    fx.device.begin_interruption();

    let snapshot = wait_for(&mut snapshots, |s| s.state.is_terminal()).await;
    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(fx.arbiter.current_claimant(), None);

    // Interruption end never auto-resumes.
    fx.device.end_interruption();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.snapshot().state, SessionState::Completed);
}

#[tokio::test]
async fn pause_suspends_and_resume_continues_the_take() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;

    session.pause();
    let snapshot = wait_for(&mut snapshots, |s| s.state == SessionState::Paused).await;
    assert!(snapshot.is_recording, "a paused take is still a recording");

    session.resume();
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed).await;
}

#[tokio::test]
async fn configuration_failure_fails_session_and_releases_claim() {
    let fx = fixture();
    fx.device.fail_next_capture("microphone unavailable");
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record is accepted");
    let snapshot = wait_for(&mut snapshots, |s| s.state.is_terminal()).await;

    assert!(matches!(snapshot.state, SessionState::Failed(_)));
    assert!(matches!(
        snapshot.error,
        Some(CaptureError::Configuration(_))
    ));
    assert_eq!(fx.arbiter.current_claimant(), None);

    // A failed session refuses to re-arm until it is reset.
    assert!(matches!(
        session.record(),
        Err(CaptureError::Configuration(_))
    ));
    session.reset();
    wait_for(&mut snapshots, |s| s.state == SessionState::Idle).await;
    session.record().expect("record after reset");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
}

#[tokio::test]
async fn delete_removes_the_backing_file() {
    let fx = fixture();
    let session = session(&fx, StorageKind::Persistent);
    let mut snapshots = session.subscribe();

    session.record().expect("record should start");
    wait_for(&mut snapshots, |s| s.state == SessionState::Recording).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.stop();
    wait_for(&mut snapshots, |s| s.state == SessionState::Completed && s.can_play).await;

    let path = session.path().to_path_buf();
    assert!(path.exists());

    session.delete().await.expect("delete succeeds");
    assert!(!Path::new(&path).exists());
    assert!(!session.snapshot().can_play);
    assert!(!session.play(), "a deleted recording is not playable");
}
