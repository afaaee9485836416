use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arbiter::{SessionArbiter, SessionId};
use crate::capability::{
    AudioDevice, CaptureConfig, Interruption, RecognitionTaskHandle, RecognitionTaskState,
    RecognitionUpdate, SpeechRecognizer,
};
use crate::config::Config;
use crate::error::CaptureError;
use crate::session::interruption::InterruptionWatch;
use crate::session::machine::{
    SessionCommand, SessionEvent, SessionMachine, SessionSnapshot, SessionState,
};

/// A live streaming dictation session.
///
/// Audio frames flow from the device straight into an open recognition
/// request; every hypothesis replaces the transcript wholesale, so the
/// visible text is always the single best current guess. Teardown is driven
/// by the recognition task reaching `Completed` — `stop()` only asks the task
/// to finish.
pub struct DictationSession {
    id: SessionId,
    arbiter: Arc<SessionArbiter>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl DictationSession {
    /// Create a dictation session.
    ///
    /// Spawns the session's event loop; must be called from within a Tokio
    /// runtime.
    pub fn new(
        arbiter: Arc<SessionArbiter>,
        device: Arc<dyn AudioDevice>,
        recognizer: Arc<dyn SpeechRecognizer>,
        config: &Config,
        push_to_talk: bool,
    ) -> Self {
        let id = SessionId::new();
        let (machine, snapshot_rx) = SessionMachine::new(id, Arc::clone(&arbiter), push_to_talk);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = DictationDriver {
            machine,
            device,
            recognizer,
            capture: CaptureConfig::from(&config.audio),
            cmd_rx,
            event_tx,
            event_rx,
            recognition: None,
            forwarder: None,
            interruption_watch: None,
        };
        tokio::spawn(driver.run());

        info!("Dictation session {}", id);

        Self {
            id,
            arbiter,
            cmd_tx,
            snapshot_rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Change stream of the session's published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Begin streaming dictation.
    ///
    /// A no-op when already recording. Returns `Busy` synchronously when
    /// another session holds the device; the session stays `Idle` and never
    /// touches the device or the recognizer in that case.
    pub fn start(&self) -> Result<(), CaptureError> {
        {
            let snapshot = self.snapshot_rx.borrow();
            if snapshot.is_recording {
                debug!("Session {}: already recording", self.id);
                return Ok(());
            }
            if matches!(snapshot.state, SessionState::Failed(_)) {
                return Err(CaptureError::Configuration(
                    "session has failed; call reset() before starting again".into(),
                ));
            }
        }
        if !self.arbiter.claim(self.id) {
            return Err(CaptureError::Busy(
                "audio device claimed by another session".into(),
            ));
        }

        self.send(SessionCommand::Start);
        Ok(())
    }

    /// Ask the recognition task to finish (not cancel). The device is torn
    /// down only once the task reports `Completed`.
    pub fn stop(&self) {
        self.send(SessionCommand::Stop);
    }

    pub fn pause(&self) {
        self.send(SessionCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(SessionCommand::Resume);
    }

    /// Return a terminal session to `Idle`, clearing the transcript and
    /// error.
    pub fn reset(&self) {
        self.send(SessionCommand::Reset);
    }

    fn send(&self, command: SessionCommand) {
        if self.cmd_tx.send(command).is_err() {
            debug!("Session {}: event loop is gone", self.id);
        }
    }
}

/// Event loop owning all state mutation for one dictation session.
struct DictationDriver {
    machine: SessionMachine,
    device: Arc<dyn AudioDevice>,
    recognizer: Arc<dyn SpeechRecognizer>,
    capture: CaptureConfig,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    recognition: Option<RecognitionTaskHandle>,
    forwarder: Option<JoinHandle<()>>,
    interruption_watch: Option<InterruptionWatch>,
}

impl DictationDriver {
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
            SessionCommand::Start | SessionCommand::Record => self.on_start().await,
            SessionCommand::Stop => self.begin_stop(),
            SessionCommand::Pause => self.on_pause().await,
            SessionCommand::Resume => self.on_resume().await,
            SessionCommand::Reset => {
                self.machine.reset();
            }
            SessionCommand::Play => {
                debug!("Play ignored; dictation sessions have nothing to play");
            }
            SessionCommand::Delete { reply } => {
                let _ = reply.send(Err(CaptureError::Storage(
                    "dictation sessions have no backing file".into(),
                )));
            }
            SessionCommand::Transcribe { reply } => {
                let _ = reply.send(Err(CaptureError::Recognition(
                    "dictation transcribes live; there is no file to transcribe".into(),
                )));
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Recognition(update) => self.on_recognition(update).await,
            SessionEvent::RecognitionClosed => self.on_recognition_closed().await,
            SessionEvent::Interruption(Interruption::Began) => {
                info!(
                    "Interruption began; stopping session {}",
                    self.machine.id()
                );
                self.begin_stop();
            }
            SessionEvent::Interruption(Interruption::Ended) => {
                debug!("Interruption ended; not auto-resuming");
            }
            SessionEvent::CaptureFinished(_)
            | SessionEvent::PlaybackFinished(_)
            | SessionEvent::FileTranscription { .. } => {
                debug!("Ignoring file-session event on a dictation session");
            }
        }
    }

    async fn on_start(&mut self) {
        match self.machine.state() {
            SessionState::Idle | SessionState::Completed => self.begin_dictation().await,
            SessionState::Failed(_) => {
                // The caller claimed before the failure landed; give the
                // claim back so another session can run.
                self.machine.release_claim();
            }
            state => debug!("Start ignored in state {}", state),
        }
    }

    async fn begin_dictation(&mut self) {
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

        let frames = match self.device.install_capture(self.capture.clone()).await {
            Ok(frames) => frames,
            Err(error) => {
                self.machine.fail(error);
                return;
            }
        };

        // Partial results on: every interim hypothesis reaches the transcript.
        let stream = match self.recognizer.recognize_stream(frames, true).await {
            Ok(stream) => stream,
            Err(error) => {
                if let Err(cleanup) = self.device.stop_capture().await {
                    debug!("Cleanup after failed recognition open also failed: {}", cleanup);
                }
                self.machine.fail(error);
                return;
            }
        };

        if let Err(error) = self.device.start_capture().await {
            stream.handle.cancel();
            if let Err(cleanup) = self.device.stop_capture().await {
                debug!("Cleanup after failed start also failed: {}", cleanup);
            }
            self.machine.fail(error);
            return;
        }

        self.recognition = Some(stream.handle);
        let event_tx = self.event_tx.clone();
        self.forwarder = Some(tokio::spawn(forward_updates(stream.updates, event_tx)));

        self.machine.transition(SessionState::Recording);
    }

    async fn on_recognition(&mut self, update: RecognitionUpdate) {
        if let Some(error) = update.error {
            // Surfaced like a completion event: the device stops, the claim
            // is released, and the transcript is left as it was.
            self.finish_pipeline().await;
            self.machine.fail(error);
            return;
        }

        if let Some(hypothesis) = update.hypothesis {
            self.machine.replace_transcript(&hypothesis);
        }

        match update.task_state {
            RecognitionTaskState::Starting | RecognitionTaskState::Running => {}
            RecognitionTaskState::Finishing | RecognitionTaskState::Canceling => {
                // Recognition may still flush trailing audio; the device
                // keeps running until the task completes.
                debug!("Recognition task is {:?}", update.task_state);
            }
            RecognitionTaskState::Completed => {
                self.finish_pipeline().await;
                self.machine.transition(SessionState::Completed);
            }
        }
    }

    async fn on_recognition_closed(&mut self) {
        if self.machine.state().is_active() {
            self.finish_pipeline().await;
            self.machine.fail(CaptureError::Recognition(
                "recognition stream closed unexpectedly".into(),
            ));
        }
    }

    /// Ask the recognition task to finish. Idempotent; teardown stays driven
    /// by the `Completed` update.
    fn begin_stop(&mut self) {
        match self.machine.state() {
            SessionState::Recording | SessionState::Paused => {
                if self.machine.transition(SessionState::Finishing) {
                    if let Some(handle) = &self.recognition {
                        handle.finish();
                    }
                }
            }
            state => debug!("Stop ignored in state {}", state),
        }
    }

    async fn on_pause(&mut self) {
        if *self.machine.state() != SessionState::Recording {
            debug!("Pause ignored in state {}", self.machine.state());
            return;
        }
        if let Err(error) = self.device.pause_capture().await {
            self.machine.fail(error);
            return;
        }
        self.machine.pause();
    }

    async fn on_resume(&mut self) {
        if *self.machine.state() != SessionState::Paused {
            debug!("Resume ignored in state {}", self.machine.state());
            return;
        }
        if let Err(error) = self.device.resume_capture().await {
            self.machine.fail(error);
            return;
        }
        self.machine.resume();
    }

    /// Stop the device, remove the capture stream, and discard the
    /// recognition handles. Runs only once the task is done (or failed).
    async fn finish_pipeline(&mut self) {
        if let Err(error) = self.device.stop_capture().await {
            debug!("Failed to stop capture during teardown: {}", error);
        }
        self.recognition = None;
        if let Some(task) = self.forwarder.take() {
            task.abort();
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

    /// The caller dropped the session: discard in-flight recognition without
    /// waiting for a hypothesis and give the claim back.
    async fn teardown(&mut self) {
        if let Some(handle) = self.recognition.take() {
            handle.cancel();
        }
        if self.machine.state().is_active() {
            if let Err(error) = self.device.stop_capture().await {
                warn!("Failed to stop capture during teardown: {}", error);
            }
        }
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        if let Some(watch) = self.interruption_watch.take() {
            watch.teardown();
        }
        self.machine.release_claim();
    }
}

/// Pipe recognition updates into the session's event loop so they are
/// serialized with caller commands and interruptions.
async fn forward_updates(
    mut updates: mpsc::Receiver<RecognitionUpdate>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(update) = updates.recv().await {
        if event_tx.send(SessionEvent::Recognition(update)).is_err() {
            return;
        }
    }

    let _ = event_tx.send(SessionEvent::RecognitionClosed);
}
