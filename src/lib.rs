pub mod arbiter;
pub mod capability;
pub mod config;
pub mod error;
pub mod session;
pub mod storage;

pub use arbiter::{SessionArbiter, SessionId};
pub use capability::{
    AudioDevice, AudioFrame, CaptureConfig, Hypothesis, Interruption, PlaybackEvent,
    RecognitionStream, RecognitionTaskHandle, RecognitionTaskState, RecognitionUpdate, SimDevice,
    SimRecognizer, SpeechRecognizer,
};
pub use config::{AudioConfig, Config, StorageConfig};
pub use error::CaptureError;
pub use session::{
    DictationSession, FileRecordingSession, SessionSnapshot, SessionState, TranscriptBuffer,
};
pub use storage::{StorageHandle, StorageKind};
