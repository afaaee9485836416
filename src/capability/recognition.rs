use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::capability::device::AudioFrame;
use crate::error::CaptureError;

/// Lifecycle of one recognition task.
///
/// Progression is monotonic: `Starting → Running → (Canceling | Finishing)
/// → Completed`, where `Canceling` and `Finishing` are mutually exclusive
/// paths to `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecognitionTaskState {
    Starting,
    Running,
    Finishing,
    Canceling,
    Completed,
}

impl RecognitionTaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecognitionTaskState::Completed)
    }
}

/// One "best transcript so far" hypothesis.
///
/// A hypothesis supersedes every earlier one wholesale; consumers never merge
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Full transcript text of the hypothesis
    pub text: String,
    /// Ordered word/phrase segments making up the text
    pub segments: Vec<String>,
    /// False for interim results while the task is still running
    pub is_final: bool,
}

/// One update emitted by an in-flight recognition task.
#[derive(Debug, Clone)]
pub struct RecognitionUpdate {
    pub task_state: RecognitionTaskState,
    pub hypothesis: Option<Hypothesis>,
    pub error: Option<CaptureError>,
}

/// Control requests a session can send to an in-flight recognition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionControl {
    /// Flush buffered audio and emit a final result.
    Finish,
    /// Discard in-flight work without waiting for a hypothesis.
    Cancel,
}

/// Control half of a streaming recognition request.
///
/// Dropped (not signalled) once the task is observed `Completed`.
#[derive(Debug, Clone)]
pub struct RecognitionTaskHandle {
    control_tx: mpsc::UnboundedSender<RecognitionControl>,
}

impl RecognitionTaskHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecognitionControl>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (Self { control_tx }, control_rx)
    }

    /// Ask the task to finish gracefully. No-op once the task is done.
    pub fn finish(&self) {
        let _ = self.control_tx.send(RecognitionControl::Finish);
    }

    /// Discard the task without waiting for a result.
    pub fn cancel(&self) {
        let _ = self.control_tx.send(RecognitionControl::Cancel);
    }
}

/// A streaming recognition request: its update channel plus the handle used
/// to finish or cancel it.
pub struct RecognitionStream {
    pub updates: mpsc::Receiver<RecognitionUpdate>,
    pub handle: RecognitionTaskHandle,
}

/// Speech recognition engine.
#[async_trait::async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a streaming request fed by `frames`.
    ///
    /// With `partial_results` set, interim hypotheses are emitted while the
    /// task runs; otherwise only the final hypothesis is reported.
    async fn recognize_stream(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
        partial_results: bool,
    ) -> Result<RecognitionStream, CaptureError>;

    /// Transcribe a whole file.
    ///
    /// Emits updates ending in a `Completed` state carrying the final
    /// hypothesis; partial results are never reported.
    async fn recognize_file(
        &self,
        path: &Path,
    ) -> Result<mpsc::Receiver<RecognitionUpdate>, CaptureError>;

    /// Authorization state; seeded asynchronously at startup and
    /// re-broadcast on every change.
    fn authorization(&self) -> watch::Receiver<bool>;
}
