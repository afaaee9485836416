//! Simulated capability backends.
//!
//! In-process stand-ins for the platform device and the recognition engine,
//! used by the integration tests and the demo binary. `SimDevice` produces
//! silence frames on a timer and replays interruptions on demand;
//! `SimRecognizer` replays a scripted sequence of hypotheses.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::capability::device::{
    AudioDevice, AudioFrame, CaptureConfig, Interruption, PlaybackEvent,
};
use crate::capability::recognition::{
    Hypothesis, RecognitionControl, RecognitionStream, RecognitionTaskHandle,
    RecognitionTaskState, RecognitionUpdate, SpeechRecognizer,
};
use crate::error::CaptureError;

/// Simulated audio device.
pub struct SimDevice {
    state: Mutex<DeviceState>,
    interrupt_tx: broadcast::Sender<Interruption>,
    install_count: AtomicUsize,
    playback_count: AtomicUsize,
}

#[derive(Default)]
struct DeviceState {
    capture: Option<CaptureRun>,
    playback: Option<JoinHandle<()>>,
    fail_capture: Option<String>,
    fail_playback: Option<String>,
}

struct CaptureRun {
    generator: JoinHandle<()>,
    start_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
}

impl SimDevice {
    pub fn new() -> Self {
        let (interrupt_tx, _) = broadcast::channel(16);

        Self {
            state: Mutex::new(DeviceState::default()),
            interrupt_tx,
            install_count: AtomicUsize::new(0),
            playback_count: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `install_capture` call fail with a configuration error.
    pub fn fail_next_capture(&self, detail: &str) {
        self.lock().fail_capture = Some(detail.to_string());
    }

    /// Make the next `start_playback` call fail with a device error.
    pub fn fail_next_playback(&self, detail: &str) {
        self.lock().fail_playback = Some(detail.to_string());
    }

    /// Deliver an interruption-began notification to all subscribers.
    pub fn begin_interruption(&self) {
        let _ = self.interrupt_tx.send(Interruption::Began);
    }

    /// Deliver an interruption-ended notification to all subscribers.
    pub fn end_interruption(&self) {
        let _ = self.interrupt_tx.send(Interruption::Ended);
    }

    /// How many capture streams have been installed over this device's life.
    pub fn install_count(&self) -> usize {
        self.install_count.load(Ordering::SeqCst)
    }

    /// How many playbacks have been started over this device's life.
    pub fn playback_count(&self) -> usize {
        self.playback_count.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.lock()
            .capture
            .as_ref()
            .is_some_and(|run| !run.generator.is_finished())
    }

    pub fn is_playing(&self) -> bool {
        self.lock()
            .playback
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AudioDevice for SimDevice {
    async fn install_capture(
        &self,
        config: CaptureConfig,
    ) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        let mut state = self.lock();

        if let Some(detail) = state.fail_capture.take() {
            return Err(CaptureError::Configuration(detail));
        }
        if let Some(run) = &state.capture {
            if !run.generator.is_finished() {
                return Err(CaptureError::Device("capture already installed".into()));
            }
        }

        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (start_tx, start_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);

        let generator = tokio::spawn(generate_frames(config, frame_tx, start_rx, pause_rx));
        state.capture = Some(CaptureRun {
            generator,
            start_tx,
            pause_tx,
        });
        self.install_count.fetch_add(1, Ordering::SeqCst);

        Ok(frame_rx)
    }

    async fn start_capture(&self) -> Result<(), CaptureError> {
        match &self.lock().capture {
            Some(run) => {
                run.start_tx.send_replace(true);
                Ok(())
            }
            None => Err(CaptureError::Device("no capture stream installed".into())),
        }
    }

    async fn stop_capture(&self) -> Result<(), CaptureError> {
        // Aborting the generator drops the frame sender, closing the stream.
        if let Some(run) = self.lock().capture.take() {
            run.generator.abort();
        }
        Ok(())
    }

    async fn pause_capture(&self) -> Result<(), CaptureError> {
        if let Some(run) = &self.lock().capture {
            run.pause_tx.send_replace(true);
        }
        Ok(())
    }

    async fn resume_capture(&self) -> Result<(), CaptureError> {
        if let Some(run) = &self.lock().capture {
            run.pause_tx.send_replace(false);
        }
        Ok(())
    }

    async fn start_playback(
        &self,
        path: &Path,
    ) -> Result<mpsc::Receiver<PlaybackEvent>, CaptureError> {
        let duration = {
            let mut state = self.lock();

            if let Some(detail) = state.fail_playback.take() {
                return Err(CaptureError::Device(detail));
            }
            if let Some(task) = &state.playback {
                if !task.is_finished() {
                    return Err(CaptureError::Device("playback already running".into()));
                }
            }

            wav_duration(path)?
        };

        let (event_tx, event_rx) = mpsc::channel(4);
        let playback = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = event_tx.send(PlaybackEvent::Finished).await;
        });

        self.lock().playback = Some(playback);
        self.playback_count.fetch_add(1, Ordering::SeqCst);

        Ok(event_rx)
    }

    async fn stop_playback(&self) -> Result<(), CaptureError> {
        // Aborting the playback task closes the event channel with no event.
        if let Some(task) = self.lock().playback.take() {
            task.abort();
        }
        Ok(())
    }

    async fn pause_playback(&self) -> Result<(), CaptureError> {
        debug!("SimDevice: pause_playback is a no-op");
        Ok(())
    }

    async fn resume_playback(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn subscribe_interruptions(&self) -> broadcast::Receiver<Interruption> {
        self.interrupt_tx.subscribe()
    }

    fn name(&self) -> &str {
        "sim-device"
    }
}

async fn generate_frames(
    config: CaptureConfig,
    frames: mpsc::Sender<AudioFrame>,
    mut start_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
) {
    if start_rx.wait_for(|started| *started).await.is_err() {
        return;
    }

    let samples_per_frame = (config.sample_rate as u64 * config.frame_duration_ms / 1000)
        as usize
        * config.channels as usize;
    let mut timestamp_ms = 0u64;

    loop {
        tokio::time::sleep(Duration::from_millis(config.frame_duration_ms)).await;

        if *pause_rx.borrow() {
            continue;
        }

        let frame = AudioFrame {
            samples: vec![0i16; samples_per_frame],
            sample_rate: config.sample_rate,
            channels: config.channels,
            timestamp_ms,
        };
        timestamp_ms += config.frame_duration_ms;

        if frames.send(frame).await.is_err() {
            break;
        }
    }
}

fn wav_duration(path: &Path) -> Result<Duration, CaptureError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| CaptureError::Device(format!("cannot play {}: {}", path.display(), e)))?;

    let spec = reader.spec();
    let millis = reader.duration() as u64 * 1000 / spec.sample_rate.max(1) as u64;

    Ok(Duration::from_millis(millis))
}

/// Simulated speech recognizer replaying a scripted hypothesis sequence.
///
/// Streaming requests emit one scripted hypothesis per received audio frame;
/// a `Finish` control re-emits the latest hypothesis as final and completes
/// the task. File requests emit the configured file hypothesis directly.
pub struct SimRecognizer {
    script: Mutex<Script>,
    auth_tx: watch::Sender<bool>,
    stream_count: AtomicUsize,
    file_count: AtomicUsize,
}

#[derive(Default)]
struct Script {
    stream_hypotheses: VecDeque<Hypothesis>,
    file_hypothesis: Option<Hypothesis>,
    fail_stream: Option<String>,
    fail_file: Option<String>,
}

impl SimRecognizer {
    pub fn new() -> Self {
        let (auth_tx, _) = watch::channel(true);

        Self {
            script: Mutex::new(Script::default()),
            auth_tx,
            stream_count: AtomicUsize::new(0),
            file_count: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an interim hypothesis for the next streaming request.
    pub fn push_hypothesis(&self, text: &str) {
        self.lock()
            .stream_hypotheses
            .push_back(hypothesis(text, false));
    }

    /// Set the result returned for whole-file transcription.
    pub fn set_file_result(&self, text: &str) {
        self.lock().file_hypothesis = Some(hypothesis(text, true));
    }

    /// Make the next streaming request fail before producing any result.
    pub fn fail_next_stream(&self, detail: &str) {
        self.lock().fail_stream = Some(detail.to_string());
    }

    /// Make the next file transcription fail.
    pub fn fail_next_file(&self, detail: &str) {
        self.lock().fail_file = Some(detail.to_string());
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.auth_tx.send_replace(authorized);
    }

    /// How many streaming requests have been opened.
    pub fn stream_count(&self) -> usize {
        self.stream_count.load(Ordering::SeqCst)
    }

    /// How many file transcriptions have been requested.
    pub fn file_count(&self) -> usize {
        self.file_count.load(Ordering::SeqCst)
    }
}

impl Default for SimRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for SimRecognizer {
    async fn recognize_stream(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
        partial_results: bool,
    ) -> Result<RecognitionStream, CaptureError> {
        self.stream_count.fetch_add(1, Ordering::SeqCst);

        let (update_tx, updates) = mpsc::channel(64);
        let (handle, control_rx) = RecognitionTaskHandle::new();

        let (script, failure) = {
            let mut script = self.lock();
            (
                std::mem::take(&mut script.stream_hypotheses),
                script.fail_stream.take(),
            )
        };

        tokio::spawn(run_stream_task(
            script,
            failure,
            partial_results,
            frames,
            control_rx,
            update_tx,
        ));

        Ok(RecognitionStream { updates, handle })
    }

    async fn recognize_file(
        &self,
        path: &Path,
    ) -> Result<mpsc::Receiver<RecognitionUpdate>, CaptureError> {
        self.file_count.fetch_add(1, Ordering::SeqCst);

        if !path.exists() {
            return Err(CaptureError::Recognition(format!(
                "no audio file at {}",
                path.display()
            )));
        }

        let (failure, result) = {
            let mut script = self.lock();
            (script.fail_file.take(), script.file_hypothesis.clone())
        };

        let (update_tx, updates) = mpsc::channel(4);
        tokio::spawn(async move {
            if let Some(detail) = failure {
                let _ = update_tx
                    .send(RecognitionUpdate {
                        task_state: RecognitionTaskState::Completed,
                        hypothesis: None,
                        error: Some(CaptureError::Recognition(detail)),
                    })
                    .await;
                return;
            }

            let _ = update_tx
                .send(RecognitionUpdate {
                    task_state: RecognitionTaskState::Running,
                    hypothesis: None,
                    error: None,
                })
                .await;

            let final_hypothesis =
                result.unwrap_or_else(|| hypothesis("simulated transcript", true));
            let _ = update_tx
                .send(RecognitionUpdate {
                    task_state: RecognitionTaskState::Completed,
                    hypothesis: Some(final_hypothesis),
                    error: None,
                })
                .await;
        });

        Ok(updates)
    }

    fn authorization(&self) -> watch::Receiver<bool> {
        self.auth_tx.subscribe()
    }
}

async fn run_stream_task(
    mut script: VecDeque<Hypothesis>,
    failure: Option<String>,
    partial_results: bool,
    mut frames: mpsc::Receiver<AudioFrame>,
    mut control_rx: mpsc::UnboundedReceiver<RecognitionControl>,
    update_tx: mpsc::Sender<RecognitionUpdate>,
) {
    if let Some(detail) = failure {
        let _ = update_tx
            .send(RecognitionUpdate {
                task_state: RecognitionTaskState::Completed,
                hypothesis: None,
                error: Some(CaptureError::Recognition(detail)),
            })
            .await;
        return;
    }

    let _ = update_tx
        .send(RecognitionUpdate {
            task_state: RecognitionTaskState::Starting,
            hypothesis: None,
            error: None,
        })
        .await;

    let mut latest: Option<Hypothesis> = None;
    let mut frames_done = false;

    loop {
        tokio::select! {
            maybe_frame = frames.recv(), if !frames_done => {
                match maybe_frame {
                    Some(_frame) => {
                        if let Some(next) = script.pop_front() {
                            latest = Some(next.clone());
                            if partial_results {
                                let _ = update_tx
                                    .send(RecognitionUpdate {
                                        task_state: RecognitionTaskState::Running,
                                        hypothesis: Some(next),
                                        error: None,
                                    })
                                    .await;
                            }
                        }
                    }
                    None => frames_done = true,
                }
            }

            maybe_control = control_rx.recv() => {
                match maybe_control {
                    Some(RecognitionControl::Finish) => {
                        let _ = update_tx
                            .send(RecognitionUpdate {
                                task_state: RecognitionTaskState::Finishing,
                                hypothesis: None,
                                error: None,
                            })
                            .await;

                        let final_hypothesis = latest.take().map(|mut h| {
                            h.is_final = true;
                            h
                        });
                        let _ = update_tx
                            .send(RecognitionUpdate {
                                task_state: RecognitionTaskState::Completed,
                                hypothesis: final_hypothesis,
                                error: None,
                            })
                            .await;
                        return;
                    }
                    Some(RecognitionControl::Cancel) => {
                        let _ = update_tx
                            .send(RecognitionUpdate {
                                task_state: RecognitionTaskState::Canceling,
                                hypothesis: None,
                                error: None,
                            })
                            .await;
                        let _ = update_tx
                            .send(RecognitionUpdate {
                                task_state: RecognitionTaskState::Completed,
                                hypothesis: None,
                                error: None,
                            })
                            .await;
                        return;
                    }
                    // Handle dropped without finish or cancel: nothing left
                    // to report to.
                    None => return,
                }
            }
        }
    }
}

fn hypothesis(text: &str, is_final: bool) -> Hypothesis {
    Hypothesis {
        text: text.to_string(),
        segments: text.split_whitespace().map(str::to_string).collect(),
        is_final,
    }
}
