use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use hound::{WavReader, WavSpec, WavWriter};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::CaptureError;

/// Where a session's backing file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Durable recordings directory; the file survives the process.
    Persistent,
    /// Scratch directory; the file is deleted at session teardown.
    Transient,
}

/// Exclusively owned reference to a session's backing WAV file.
///
/// At most one writer may be open at a time, and a reader may not be opened
/// while a writer is open (or vice versa); the owning session upholds this by
/// never recording and playing concurrently. Transient files are removed when
/// the handle is dropped, whatever state the session ended in.
#[derive(Debug)]
pub struct StorageHandle {
    path: PathBuf,
    kind: StorageKind,
    deleted: bool,
}

impl StorageHandle {
    /// Create a handle to a fresh uniquely named file under the directory
    /// matching `kind`. The file itself is created by the first
    /// `open_writer`.
    ///
    /// When the durable directory cannot be created the handle falls back to
    /// the scratch directory and becomes transient.
    pub fn create(kind: StorageKind, config: &StorageConfig) -> Result<Self, CaptureError> {
        let file_name = format!("memo-{}.wav", Uuid::new_v4());

        let (dir, kind) = match kind {
            StorageKind::Persistent => match fs::create_dir_all(&config.recordings_dir) {
                Ok(()) => (config.recordings_dir.clone(), StorageKind::Persistent),
                Err(error) => {
                    warn!(
                        "Recordings directory {} unavailable ({}); falling back to scratch",
                        config.recordings_dir.display(),
                        error
                    );
                    (scratch_dir(config)?, StorageKind::Transient)
                }
            },
            StorageKind::Transient => (scratch_dir(config)?, StorageKind::Transient),
        };

        Ok(Self {
            path: dir.join(file_name),
            kind,
            deleted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Open the exclusive writer, creating (or truncating) the backing file.
    pub fn open_writer(
        &mut self,
        spec: WavSpec,
    ) -> Result<WavWriter<BufWriter<File>>, CaptureError> {
        let writer = WavWriter::create(&self.path, spec).map_err(|e| {
            CaptureError::Storage(format!("failed to create {}: {}", self.path.display(), e))
        })?;
        self.deleted = false;

        Ok(writer)
    }

    /// Open a reader over the backing file.
    pub fn open_reader(&self) -> Result<WavReader<BufReader<File>>, CaptureError> {
        WavReader::open(&self.path).map_err(|e| {
            CaptureError::Storage(format!("failed to open {}: {}", self.path.display(), e))
        })
    }

    /// Remove the backing file. Idempotent; a missing file is not an error.
    pub fn delete(&mut self) -> Result<(), CaptureError> {
        if self.deleted || !self.path.exists() {
            self.deleted = true;
            return Ok(());
        }

        fs::remove_file(&self.path).map_err(|e| {
            CaptureError::Storage(format!("failed to remove {}: {}", self.path.display(), e))
        })?;
        self.deleted = true;
        info!("Deleted recording {}", self.path.display());

        Ok(())
    }

    /// Remove the backing file of a transient handle, best-effort.
    ///
    /// A failed remove must never wedge teardown, so the error is only
    /// logged.
    pub fn discard_transient(&mut self) {
        if self.kind == StorageKind::Transient && !self.deleted {
            if let Err(error) = self.delete() {
                warn!("Failed to remove transient recording: {}", error);
            }
        }
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        self.discard_transient();
    }
}

fn scratch_dir(config: &StorageConfig) -> Result<PathBuf, CaptureError> {
    let dir = config
        .scratch_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);

    fs::create_dir_all(&dir).map_err(|e| {
        CaptureError::Storage(format!(
            "failed to create scratch directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    Ok(dir)
}
