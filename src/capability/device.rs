use std::path::Path;

use tokio::sync::{broadcast, mpsc};

use crate::error::CaptureError;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

/// Capture format requested from the device.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target sample rate in Hz
    pub sample_rate: u32,
    /// Target channel count (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Frame size in milliseconds (affects latency)
    pub frame_duration_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 100,
        }
    }
}

impl From<&crate::config::AudioConfig> for CaptureConfig {
    fn from(audio: &crate::config::AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            frame_duration_ms: audio.frame_duration_ms,
        }
    }
}

/// Terminal events reported by the playback half of the device.
///
/// A playback stream that closes without an event means playback was stopped
/// by command rather than running to its natural end.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Playback ran to the end of the file.
    Finished,
    /// Playback failed mid-stream.
    Errored(String),
}

/// Device-level interruption notifications, delivered out-of-band when the
/// OS revokes or restores audio hardware access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Began,
    Ended,
}

/// Audio capture/playback device.
///
/// Real implementations wrap platform audio backends; the crate's sessions
/// only ever talk to this trait, so tests and the demo binary drive them with
/// the simulated device instead.
#[async_trait::async_trait]
pub trait AudioDevice: Send + Sync {
    /// Install a capture stream.
    ///
    /// Frames arrive on the returned channel once `start_capture` is called;
    /// the channel closes after `stop_capture`.
    async fn install_capture(
        &self,
        config: CaptureConfig,
    ) -> Result<mpsc::Receiver<AudioFrame>, CaptureError>;

    /// Begin producing frames on the installed capture stream.
    async fn start_capture(&self) -> Result<(), CaptureError>;

    /// Stop capturing and close the capture stream.
    async fn stop_capture(&self) -> Result<(), CaptureError>;

    /// Suspend frame production without closing the capture stream.
    async fn pause_capture(&self) -> Result<(), CaptureError>;

    /// Resume frame production after `pause_capture`.
    async fn resume_capture(&self) -> Result<(), CaptureError>;

    /// Start playing the file at `path`.
    ///
    /// Completion or failure is reported on the returned channel.
    async fn start_playback(
        &self,
        path: &Path,
    ) -> Result<mpsc::Receiver<PlaybackEvent>, CaptureError>;

    /// Stop playback; the playback event channel closes without an event.
    async fn stop_playback(&self) -> Result<(), CaptureError>;

    /// Suspend playback without closing the playback event channel.
    async fn pause_playback(&self) -> Result<(), CaptureError>;

    /// Resume playback after `pause_playback`.
    async fn resume_playback(&self) -> Result<(), CaptureError>;

    /// Subscribe to device interruption notifications.
    fn subscribe_interruptions(&self) -> broadcast::Receiver<Interruption>;

    /// Device name for logging.
    fn name(&self) -> &str;
}
