use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use hound::WavWriter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arbiter::{SessionArbiter, SessionId};
use crate::capability::{
    AudioDevice, AudioFrame, CaptureConfig, Hypothesis, Interruption, PlaybackEvent,
    SpeechRecognizer,
};
use crate::config::Config;
use crate::error::CaptureError;
use crate::session::interruption::InterruptionWatch;
use crate::session::machine::{
    SessionCommand, SessionEvent, SessionMachine, SessionSnapshot, SessionState,
};
use crate::session::transcript::TranscriptBuffer;
use crate::storage::{StorageHandle, StorageKind};

/// A session that captures voice to a uniquely named WAV file and can play
/// it back or transcribe it on demand.
///
/// Commands are non-blocking: they enqueue work for the session's event loop
/// and their effects are observed on the snapshot channel. The only
/// synchronous results are a denied claim (`Busy`) and `play()` returning
/// false when there is nothing to play.
pub struct FileRecordingSession {
    id: SessionId,
    arbiter: Arc<SessionArbiter>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    storage: Arc<Mutex<StorageHandle>>,
    path: PathBuf,
}

impl FileRecordingSession {
    /// Create a session recording to a fresh uniquely named file under the
    /// directory selected by `kind`.
    ///
    /// Spawns the session's event loop; must be called from within a Tokio
    /// runtime.
    pub fn new(
        arbiter: Arc<SessionArbiter>,
        device: Arc<dyn AudioDevice>,
        recognizer: Arc<dyn SpeechRecognizer>,
        config: &Config,
        kind: StorageKind,
        push_to_talk: bool,
    ) -> Result<Self, CaptureError> {
        let id = SessionId::new();
        let storage = StorageHandle::create(kind, &config.storage)?;
        let path = storage.path().to_path_buf();
        let storage = Arc::new(Mutex::new(storage));

        let (machine, snapshot_rx) = SessionMachine::new(id, Arc::clone(&arbiter), push_to_talk);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = RecorderDriver {
            machine,
            device,
            recognizer,
            storage: Arc::clone(&storage),
            capture: CaptureConfig::from(&config.audio),
            path: path.clone(),
            cmd_rx,
            event_tx,
            event_rx,
            record_task: None,
            playback_task: None,
            interruption_watch: None,
            pending: None,
        };
        tokio::spawn(driver.run());

        info!("File recording session {} -> {}", id, path.display());

        Ok(Self {
            id,
            arbiter,
            cmd_tx,
            snapshot_rx,
            storage,
            path,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Path of the backing WAV file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kind()
    }

    /// Change stream of the session's published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Begin a recording take.
    ///
    /// Returns `Busy` synchronously when another session holds the device;
    /// the session stays `Idle` and never touches the device in that case.
    pub fn record(&self) -> Result<(), CaptureError> {
        if let SessionState::Failed(_) = self.snapshot_rx.borrow().state {
            return Err(CaptureError::Configuration(
                "session has failed; call reset() before recording again".into(),
            ));
        }
        if !self.arbiter.claim(self.id) {
            return Err(CaptureError::Busy(
                "audio device claimed by another session".into(),
            ));
        }

        self.send(SessionCommand::Record);
        Ok(())
    }

    /// Request a graceful stop. Teardown happens when the completion event
    /// arrives, not here.
    pub fn stop(&self) {
        self.send(SessionCommand::Stop);
    }

    pub fn pause(&self) {
        self.send(SessionCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(SessionCommand::Resume);
    }

    /// Request playback of the completed recording.
    ///
    /// Returns false without any state change or resource allocation when
    /// there is no playable recording or the device is held elsewhere.
    pub fn play(&self) -> bool {
        {
            let snapshot = self.snapshot_rx.borrow();
            if !snapshot.can_play || matches!(snapshot.state, SessionState::Failed(_)) {
                return false;
            }
        }
        if !self.arbiter.claim(self.id) {
            return false;
        }

        self.send(SessionCommand::Play);
        true
    }

    /// Return a terminal session to `Idle`, clearing the transcript and
    /// error. Persistent storage is left on disk.
    pub fn reset(&self) {
        self.send(SessionCommand::Reset);
    }

    /// Remove the backing file.
    pub async fn delete(&self) -> Result<(), CaptureError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::Delete { reply: reply_tx });

        reply_rx
            .await
            .unwrap_or_else(|_| Err(CaptureError::Storage("session is gone".into())))
    }

    /// Transcribe the whole recording, replacing the transcript buffer with
    /// the completed result.
    ///
    /// Independent of the record/play state machine; failures are reported
    /// here (and on the snapshot error field) without affecting the session
    /// state.
    pub async fn transcribe(&self) -> Result<TranscriptBuffer, CaptureError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::Transcribe { reply: reply_tx });

        reply_rx
            .await
            .unwrap_or_else(|_| Err(CaptureError::Recognition("session is gone".into())))
    }

    fn send(&self, command: SessionCommand) {
        if self.cmd_tx.send(command).is_err() {
            debug!("Session {}: event loop is gone", self.id);
        }
    }
}

impl Drop for FileRecordingSession {
    fn drop(&mut self) {
        // Deterministic teardown: a transient backing file never outlives the
        // session object, whatever state it ended in.
        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        storage.discard_transient();
    }
}

/// Which queued request to run once the in-flight take completes. Recording
/// and playback are never concurrent within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Record,
    Play,
}

/// Event loop owning all state mutation for one file session.
struct RecorderDriver {
    machine: SessionMachine,
    device: Arc<dyn AudioDevice>,
    recognizer: Arc<dyn SpeechRecognizer>,
    storage: Arc<Mutex<StorageHandle>>,
    capture: CaptureConfig,
    path: PathBuf,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    record_task: Option<JoinHandle<()>>,
    playback_task: Option<JoinHandle<()>>,
    interruption_watch: Option<InterruptionWatch>,
    pending: Option<PendingAction>,
}

impl RecorderDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
            }

            self.sync_interruption_watch();
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Record | SessionCommand::Start => self.on_record().await,
            SessionCommand::Stop => self.begin_stop().await,
            SessionCommand::Pause => self.on_pause().await,
            SessionCommand::Resume => self.on_resume().await,
            SessionCommand::Play => self.on_play().await,
            SessionCommand::Reset => {
                self.machine.reset();
            }
            SessionCommand::Delete { reply } => self.on_delete(reply),
            SessionCommand::Transcribe { reply } => self.on_transcribe(reply),
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CaptureFinished(result) => self.on_capture_finished(result).await,
            SessionEvent::PlaybackFinished(error) => self.on_playback_finished(error).await,
            SessionEvent::FileTranscription { result, reply } => {
                self.on_file_transcription(result, reply);
            }
            SessionEvent::Interruption(Interruption::Began) => {
                info!(
                    "Interruption began; stopping session {}",
                    self.machine.id()
                );
                self.begin_stop().await;
            }
            SessionEvent::Interruption(Interruption::Ended) => {
                debug!("Interruption ended; not auto-resuming");
            }
            SessionEvent::Recognition(_) | SessionEvent::RecognitionClosed => {
                debug!("Ignoring streaming recognition event on a file session");
            }
        }
    }

    async fn on_record(&mut self) {
        match self.machine.state() {
            SessionState::Idle | SessionState::Completed => self.begin_recording().await,
            SessionState::Playing => {
                self.pending = Some(PendingAction::Record);
                self.begin_stop().await;
            }
            SessionState::Paused => {
                if matches!(self.machine.resume_target(), Some(SessionState::Playing)) {
                    self.pending = Some(PendingAction::Record);
                    self.begin_stop().await;
                } else {
                    debug!("Record ignored; a recording take is already paused");
                }
            }
            SessionState::Recording | SessionState::Configuring | SessionState::Finishing => {
                debug!("Record ignored in state {}", self.machine.state());
            }
            SessionState::Failed(_) => {
                // The caller claimed before the failure landed; give the
                // claim back so another session can run.
                self.machine.release_claim();
            }
        }
    }

    async fn on_play(&mut self) {
        if !self.machine.can_play() {
            debug!("Play ignored; no completed recording");
            if !self.machine.state().is_active() {
                self.machine.release_claim();
            }
            return;
        }

        match self.machine.state() {
            SessionState::Idle | SessionState::Completed => self.begin_playback().await,
            SessionState::Recording => {
                self.pending = Some(PendingAction::Play);
                self.begin_stop().await;
            }
            SessionState::Paused => {
                if matches!(self.machine.resume_target(), Some(SessionState::Recording)) {
                    self.pending = Some(PendingAction::Play);
                    self.begin_stop().await;
                } else {
                    debug!("Play ignored; playback is paused, resume instead");
                }
            }
            SessionState::Playing | SessionState::Configuring | SessionState::Finishing => {
                debug!("Play ignored in state {}", self.machine.state());
            }
            SessionState::Failed(_) => {
                self.machine.release_claim();
            }
        }
    }

    async fn on_pause(&mut self) {
        match self.machine.state() {
            SessionState::Recording => {
                if let Err(error) = self.device.pause_capture().await {
                    self.machine.fail(error);
                    return;
                }
                self.machine.pause();
            }
            SessionState::Playing => {
                if let Err(error) = self.device.pause_playback().await {
                    self.machine.fail(error);
                    return;
                }
                self.machine.pause();
            }
            state => debug!("Pause ignored in state {}", state),
        }
    }

    async fn on_resume(&mut self) {
        if *self.machine.state() != SessionState::Paused {
            debug!("Resume ignored in state {}", self.machine.state());
            return;
        }

        let result = match self.machine.resume_target() {
            Some(SessionState::Playing) => self.device.resume_playback().await,
            _ => self.device.resume_capture().await,
        };
        if let Err(error) = result {
            self.machine.fail(error);
            return;
        }

        self.machine.resume();
    }

    /// Issue the device stop for whatever is active. Teardown is driven by
    /// the completion event, not by this call.
    async fn begin_stop(&mut self) {
        let stopping_playback = match self.machine.state() {
            SessionState::Recording => false,
            SessionState::Playing => true,
            SessionState::Paused => {
                matches!(self.machine.resume_target(), Some(SessionState::Playing))
            }
            // Idempotent: already stopping, terminal, or idle.
            _ => return,
        };

        if !self.machine.transition(SessionState::Finishing) {
            return;
        }

        let result = if stopping_playback {
            self.device.stop_playback().await
        } else {
            self.device.stop_capture().await
        };
        if let Err(error) = result {
            self.machine.fail(error);
        }
    }

    async fn begin_recording(&mut self) {
        if !self.machine.try_claim() {
            self.machine.set_error_only(CaptureError::Busy(
                "audio device claimed by another session".into(),
            ));
            return;
        }
        if !self.machine.transition(SessionState::Configuring) {
            return;
        }
        // Subscribe before the device can be revoked out from under us.
        self.sync_interruption_watch();

        let spec = wav_spec(&self.capture);
        let writer = {
            let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
            match storage.open_writer(spec) {
                Ok(writer) => writer,
                Err(error) => {
                    self.machine.fail(error);
                    return;
                }
            }
        };

        let frames = match self.device.install_capture(self.capture.clone()).await {
            Ok(frames) => frames,
            Err(error) => {
                self.machine.fail(error);
                return;
            }
        };
        if let Err(error) = self.device.start_capture().await {
            if let Err(cleanup) = self.device.stop_capture().await {
                debug!("Cleanup after failed start also failed: {}", cleanup);
            }
            self.machine.fail(error);
            return;
        }

        let event_tx = self.event_tx.clone();
        self.record_task = Some(tokio::spawn(write_frames(writer, frames, event_tx)));
        self.machine.transition(SessionState::Recording);
    }

    async fn begin_playback(&mut self) {
        if !self.machine.try_claim() {
            self.machine.set_error_only(CaptureError::Busy(
                "audio device claimed by another session".into(),
            ));
            return;
        }
        if !self.machine.transition(SessionState::Configuring) {
            return;
        }
        self.sync_interruption_watch();

        let events = match self.device.start_playback(&self.path).await {
            Ok(events) => events,
            Err(error) => {
                self.machine.fail(error);
                return;
            }
        };

        let event_tx = self.event_tx.clone();
        self.playback_task = Some(tokio::spawn(watch_playback(events, event_tx)));
        self.machine.transition(SessionState::Playing);
    }

    async fn on_capture_finished(&mut self, result: Result<(), CaptureError>) {
        self.record_task = None;
        let stop_was_issued = matches!(self.machine.state(), SessionState::Finishing);

        match result {
            Ok(()) => {
                self.machine.set_can_play(true);
                self.machine.transition(SessionState::Completed);
            }
            Err(error) => {
                if !stop_was_issued {
                    // The writer died while the device kept capturing.
                    if let Err(cleanup) = self.device.stop_capture().await {
                        debug!("Failed to stop capture after a write error: {}", cleanup);
                    }
                }
                self.machine.set_can_play(false);
                self.machine.fail(error);
            }
        }

        self.apply_pending().await;
    }

    async fn on_playback_finished(&mut self, error: Option<CaptureError>) {
        self.playback_task = None;

        match error {
            None => {
                self.machine.transition(SessionState::Completed);
            }
            Some(error) => self.machine.fail(error),
        }

        self.apply_pending().await;
    }

    fn on_file_transcription(
        &mut self,
        result: Result<Hypothesis, CaptureError>,
        reply: oneshot::Sender<Result<TranscriptBuffer, CaptureError>>,
    ) {
        match result {
            Ok(hypothesis) => {
                self.machine.replace_transcript(&hypothesis);
                let _ = reply.send(Ok(self.machine.transcript().clone()));
            }
            Err(error) => {
                self.machine.set_error_only(error.clone());
                let _ = reply.send(Err(error));
            }
        }
    }

    fn on_delete(&mut self, reply: oneshot::Sender<Result<(), CaptureError>>) {
        let result = if self.machine.state().is_active() {
            Err(CaptureError::Storage(
                "cannot delete while the session is active".into(),
            ))
        } else {
            let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
            storage.delete()
        };

        match &result {
            Ok(()) => self.machine.set_can_play(false),
            Err(error) => self.machine.set_error_only(error.clone()),
        }
        let _ = reply.send(result);
    }

    fn on_transcribe(&self, reply: oneshot::Sender<Result<TranscriptBuffer, CaptureError>>) {
        let recognizer = Arc::clone(&self.recognizer);
        let path = self.path.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = transcribe_file(recognizer, path).await;
            let _ = event_tx.send(SessionEvent::FileTranscription { result, reply });
        });
    }

    async fn apply_pending(&mut self) {
        if *self.machine.state() != SessionState::Completed {
            self.pending = None;
            return;
        }

        match self.pending.take() {
            Some(PendingAction::Record) => self.begin_recording().await,
            Some(PendingAction::Play) => {
                if self.machine.can_play() {
                    self.begin_playback().await;
                } else {
                    warn!("Queued playback dropped; the recording did not complete cleanly");
                }
            }
            None => {}
        }
    }

    fn sync_interruption_watch(&mut self) {
        let active = self.machine.state().is_active();

        if active && self.interruption_watch.is_none() {
            self.interruption_watch = Some(InterruptionWatch::install(
                self.device.subscribe_interruptions(),
                self.event_tx.clone(),
            ));
        } else if !active {
            if let Some(watch) = self.interruption_watch.take() {
                watch.teardown();
            }
        }
    }

    /// The caller dropped the session. Stop the device, drop sub-resources,
    /// and give the claim back; the transient file is removed by the session
    /// handle's own drop.
    async fn teardown(&mut self) {
        if self.machine.state().is_active() {
            if let Err(error) = self.device.stop_capture().await {
                warn!("Failed to stop capture during teardown: {}", error);
            }
            if let Err(error) = self.device.stop_playback().await {
                warn!("Failed to stop playback during teardown: {}", error);
            }
        }
        if let Some(task) = self.record_task.take() {
            task.abort();
        }
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
        if let Some(watch) = self.interruption_watch.take() {
            watch.teardown();
        }
        self.machine.release_claim();
    }
}

/// Record sub-resource: drain the device frame channel into the WAV writer
/// and report completion once the stream closes.
async fn write_frames(
    writer: WavWriter<BufWriter<File>>,
    frames: mpsc::Receiver<AudioFrame>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let result = async move {
        let mut writer = writer;
        let mut frames = frames;
        let mut sample_count = 0usize;

        while let Some(frame) = frames.recv().await {
            for &sample in &frame.samples {
                writer.write_sample(sample).map_err(|e| {
                    CaptureError::Storage(format!("failed to write sample: {}", e))
                })?;
            }
            sample_count += frame.samples.len();
        }

        writer
            .finalize()
            .map_err(|e| CaptureError::Storage(format!("failed to finalize recording: {}", e)))?;

        info!("Recording finished ({} samples)", sample_count);
        Ok::<(), CaptureError>(())
    }
    .await;

    let _ = event_tx.send(SessionEvent::CaptureFinished(result));
}

/// Play sub-resource: wait for the playback stream to finish, stop, or fail.
async fn watch_playback(
    mut events: mpsc::Receiver<PlaybackEvent>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let error = match events.recv().await {
        // A closed channel means playback was stopped by command.
        Some(PlaybackEvent::Finished) | None => None,
        Some(PlaybackEvent::Errored(detail)) => Some(CaptureError::Device(detail)),
    };

    let _ = event_tx.send(SessionEvent::PlaybackFinished(error));
}

async fn transcribe_file(
    recognizer: Arc<dyn SpeechRecognizer>,
    path: PathBuf,
) -> Result<Hypothesis, CaptureError> {
    let mut updates = recognizer.recognize_file(&path).await?;
    let mut latest: Option<Hypothesis> = None;

    while let Some(update) = updates.recv().await {
        if let Some(error) = update.error {
            return Err(error);
        }
        if let Some(hypothesis) = update.hypothesis {
            latest = Some(hypothesis);
        }
        if update.task_state.is_terminal() {
            break;
        }
    }

    latest
        .filter(|hypothesis| hypothesis.is_final)
        .ok_or_else(|| CaptureError::Recognition("transcription produced no final result".into()))
}

fn wav_spec(capture: &CaptureConfig) -> hound::WavSpec {
    hound::WavSpec {
        channels: capture.channels,
        sample_rate: capture.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}
