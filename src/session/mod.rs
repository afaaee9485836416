//! Capture session state machines
//!
//! This module provides the two concrete session kinds over a shared state
//! machine core:
//! - `FileRecordingSession`: capture to a WAV file, playback, on-demand
//!   transcription
//! - `DictationSession`: live streaming dictation with an incremental
//!   transcript
//!
//! All state mutation for one session runs on its own event loop task;
//! device callbacks, recognition callbacks, interruption notifications, and
//! caller commands are serialized into one transition per event.

mod dictation;
mod interruption;
mod machine;
mod recorder;
mod transcript;

pub use dictation::DictationSession;
pub use machine::{SessionSnapshot, SessionState};
pub use recorder::FileRecordingSession;
pub use transcript::TranscriptBuffer;
