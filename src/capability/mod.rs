//! External collaborator seams.
//!
//! The physical audio device and the speech recognition engine are thin I/O
//! wrappers outside this crate's core; sessions consume them through the
//! traits here so that platform backends, test doubles, and the simulated
//! implementations are interchangeable.

pub mod device;
pub mod recognition;
pub mod sim;

pub use device::{AudioDevice, AudioFrame, CaptureConfig, Interruption, PlaybackEvent};
pub use recognition::{
    Hypothesis, RecognitionControl, RecognitionStream, RecognitionTaskHandle,
    RecognitionTaskState, RecognitionUpdate, SpeechRecognizer,
};
pub use sim::{SimDevice, SimRecognizer};
