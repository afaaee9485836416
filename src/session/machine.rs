use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::arbiter::{SessionArbiter, SessionId};
use crate::capability::{Hypothesis, Interruption, RecognitionUpdate};
use crate::error::CaptureError;
use crate::session::transcript::TranscriptBuffer;

/// Lifecycle state of one capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Constructed, nothing claimed.
    Idle,
    /// Claim held, device/recognition being set up.
    Configuring,
    /// Capturing audio.
    Recording,
    /// Playing a recording back.
    Playing,
    /// Capture or playback suspended.
    Paused,
    /// Stop issued; waiting for the asynchronous completion event.
    Finishing,
    /// The take finished; claim released, sub-resources disposed.
    Completed,
    /// Unrecoverable error; claim released, sub-resources disposed.
    Failed(CaptureError),
}

impl SessionState {
    /// Whether the session is between claim and release.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Configuring
                | SessionState::Recording
                | SessionState::Playing
                | SessionState::Paused
                | SessionState::Finishing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }

    /// Whether `next` is a legal transition out of `self`.
    ///
    /// Any non-terminal state may fail; `Completed` is reachable from
    /// `Finishing` (stop path), from `Recording`/`Paused` (the recognizer
    /// completed on its own), and from `Playing` (playback ran to its
    /// natural end).
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;

        if matches!(next, Failed(_)) {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Idle, Configuring)
                | (Completed, Configuring)
                | (Configuring, Recording)
                | (Configuring, Playing)
                | (Recording, Paused)
                | (Playing, Paused)
                | (Paused, Recording)
                | (Paused, Playing)
                | (Recording, Finishing)
                | (Playing, Finishing)
                | (Paused, Finishing)
                | (Finishing, Completed)
                | (Recording, Completed)
                | (Paused, Completed)
                | (Playing, Completed)
                | (Completed, Idle)
                | (Failed(_), Idle)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Configuring => write!(f, "Configuring"),
            SessionState::Recording => write!(f, "Recording"),
            SessionState::Playing => write!(f, "Playing"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Finishing => write!(f, "Finishing"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Failed(error) => write!(f, "Failed({})", error),
        }
    }
}

/// Consistent view of one session, published atomically on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub transcript: TranscriptBuffer,
    pub can_play: bool,
    pub is_recording: bool,
    pub is_playing: bool,
    pub error: Option<CaptureError>,
    pub started_at: Option<DateTime<Utc>>,
    pub push_to_talk: bool,
}

/// Caller-issued commands, delivered to the session's event loop.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Begin a file recording take.
    Record,
    /// Begin a dictation take.
    Start,
    Stop,
    Pause,
    Resume,
    Play,
    Reset,
    Delete {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    Transcribe {
        reply: oneshot::Sender<Result<TranscriptBuffer, CaptureError>>,
    },
}

/// Asynchronous completions funneled into the session's event loop.
///
/// Device callbacks, recognizer callbacks, and interruption notifications all
/// become plain events here, so each one applies exactly one serialized state
/// transition.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// The record task finished (writer finalized or failed).
    CaptureFinished(Result<(), CaptureError>),
    /// Playback finished, was stopped, or failed.
    PlaybackFinished(Option<CaptureError>),
    /// A streaming recognition update arrived.
    Recognition(RecognitionUpdate),
    /// The streaming recognition channel closed without completing.
    RecognitionClosed,
    /// On-demand file transcription finished.
    FileTranscription {
        result: Result<Hypothesis, CaptureError>,
        reply: oneshot::Sender<Result<TranscriptBuffer, CaptureError>>,
    },
    /// A device interruption notification arrived.
    Interruption(Interruption),
}

/// State machine core shared by both session kinds.
///
/// Owns the state, the transcript buffer, the published snapshot, and the
/// arbiter claim lifecycle; the concrete session drivers decide *when* to
/// transition, the machine decides *whether* a transition is legal and what
/// it releases.
pub(crate) struct SessionMachine {
    id: SessionId,
    arbiter: Arc<SessionArbiter>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    state: SessionState,
    transcript: TranscriptBuffer,
    can_play: bool,
    is_recording: bool,
    is_playing: bool,
    error: Option<CaptureError>,
    resume_to: Option<SessionState>,
    started_at: Option<DateTime<Utc>>,
    push_to_talk: bool,
}

impl SessionMachine {
    pub(crate) fn new(
        id: SessionId,
        arbiter: Arc<SessionArbiter>,
        push_to_talk: bool,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let initial = SessionSnapshot {
            state: SessionState::Idle,
            transcript: TranscriptBuffer::default(),
            can_play: false,
            is_recording: false,
            is_playing: false,
            error: None,
            started_at: None,
            push_to_talk,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let machine = Self {
            id,
            arbiter,
            snapshot_tx,
            state: SessionState::Idle,
            transcript: TranscriptBuffer::default(),
            can_play: false,
            is_recording: false,
            is_playing: false,
            error: None,
            resume_to: None,
            started_at: None,
            push_to_talk,
        };

        (machine, snapshot_rx)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn transcript(&self) -> &TranscriptBuffer {
        &self.transcript
    }

    pub(crate) fn can_play(&self) -> bool {
        self.can_play
    }

    /// What `Paused` would resume into, if currently paused.
    pub(crate) fn resume_target(&self) -> Option<&SessionState> {
        self.resume_to.as_ref()
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.arbiter.claim(self.id)
    }

    pub(crate) fn release_claim(&self) {
        self.arbiter.release(self.id);
    }

    /// Apply a transition if it is legal from the current state.
    ///
    /// Illegal transitions are logged and ignored — a late completion event
    /// racing a reset must not corrupt the machine.
    pub(crate) fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(&next) {
            debug!(
                "Session {}: ignoring transition {} -> {}",
                self.id, self.state, next
            );
            return false;
        }

        debug!("Session {}: {} -> {}", self.id, self.state, next);

        match &next {
            SessionState::Configuring => {
                self.started_at = None;
            }
            SessionState::Recording => {
                self.is_recording = true;
                self.is_playing = false;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            SessionState::Playing => {
                self.is_playing = true;
                self.is_recording = false;
            }
            SessionState::Paused => {}
            SessionState::Finishing => {
                self.resume_to = None;
            }
            SessionState::Completed => {
                self.is_recording = false;
                self.is_playing = false;
                self.resume_to = None;
                self.release_claim();
            }
            SessionState::Failed(error) => {
                self.error = Some(error.clone());
                self.is_recording = false;
                self.is_playing = false;
                self.resume_to = None;
                self.release_claim();
            }
            SessionState::Idle => {
                self.transcript.clear();
                self.error = None;
                self.can_play = false;
                self.is_recording = false;
                self.is_playing = false;
                self.resume_to = None;
                self.started_at = None;
                self.release_claim();
            }
        }

        self.state = next;
        self.publish();
        true
    }

    /// Move to `Failed(error)`, releasing the claim and clearing activity
    /// flags. If the session is already terminal the error is recorded on
    /// the snapshot without a state change.
    pub(crate) fn fail(&mut self, error: CaptureError) {
        warn!("Session {} failed: {}", self.id, error);

        if self.state.is_terminal() {
            self.error = Some(error);
            self.publish();
            return;
        }

        self.transition(SessionState::Failed(error));
    }

    /// Record an error on the snapshot without touching the state machine
    /// (on-demand transcription failures, claim races).
    pub(crate) fn set_error_only(&mut self, error: CaptureError) {
        warn!("Session {}: {}", self.id, error);
        self.error = Some(error);
        self.publish();
    }

    pub(crate) fn set_can_play(&mut self, can_play: bool) {
        self.can_play = can_play;
        self.publish();
    }

    /// Replace the transcript with a newer hypothesis.
    pub(crate) fn replace_transcript(&mut self, hypothesis: &Hypothesis) {
        self.transcript.replace(hypothesis);
        self.publish();
    }

    /// Suspend an active `Recording` or `Playing` state.
    pub(crate) fn pause(&mut self) -> bool {
        if matches!(self.state, SessionState::Recording | SessionState::Playing) {
            self.resume_to = Some(self.state.clone());
            self.transition(SessionState::Paused)
        } else {
            debug!("Session {}: pause ignored in {}", self.id, self.state);
            false
        }
    }

    /// Return from `Paused` to whatever was active before.
    pub(crate) fn resume(&mut self) -> bool {
        if self.state == SessionState::Paused {
            if let Some(target) = self.resume_to.take() {
                return self.transition(target);
            }
        }
        debug!("Session {}: resume ignored in {}", self.id, self.state);
        false
    }

    /// Return from a terminal state to `Idle`, clearing transcript, error,
    /// and playback eligibility. Persistent storage is left alone.
    pub(crate) fn reset(&mut self) -> bool {
        if !self.state.is_terminal() {
            debug!("Session {}: reset ignored in {}", self.id, self.state);
            return false;
        }
        self.transition(SessionState::Idle)
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state.clone(),
            transcript: self.transcript.clone(),
            can_play: self.can_play,
            is_recording: self.is_recording,
            is_playing: self.is_playing,
            error: self.error.clone(),
            started_at: self.started_at,
            push_to_talk: self.push_to_talk,
        });
    }
}
