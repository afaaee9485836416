use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy for capture sessions.
///
/// The variant is the failure kind; the payload carries the detail reported
/// by the device, the recognizer, or the filesystem. Errors are cloneable so
/// they can ride inside published session snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CaptureError {
    /// The device slot is held by another session.
    #[error("audio device is busy: {0}")]
    Busy(String),

    /// Device or session configuration failed before capture started.
    #[error("configuration failed: {0}")]
    Configuration(String),

    /// The device reported a capture or playback failure.
    #[error("device failure: {0}")]
    Device(String),

    /// The recognizer failed or authorization was denied.
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// Creating or removing the backing file failed.
    #[error("storage failure: {0}")]
    Storage(String),
}
