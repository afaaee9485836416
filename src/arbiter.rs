use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capability::SpeechRecognizer;

/// Opaque process-unique session identity.
///
/// The arbiter compares identity, never content: two sessions recording the
/// same file are still two distinct claimants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-claim registry over the shared audio device.
///
/// The physical device and the recognition engine are process-wide resources;
/// a per-session flag cannot stop two sessions from both believing they own
/// them. The arbiter holds at most one `SessionId` at a time and is safe to
/// call from any thread. It is explicitly constructed and injected into
/// sessions — there is no hidden global instance.
pub struct SessionArbiter {
    slot: Mutex<Option<SessionId>>,
    claimant_tx: watch::Sender<Option<SessionId>>,
    availability_tx: watch::Sender<bool>,
}

impl SessionArbiter {
    pub fn new() -> Self {
        let (claimant_tx, _) = watch::channel(None);
        let (availability_tx, _) = watch::channel(false);

        Self {
            slot: Mutex::new(None),
            claimant_tx,
            availability_tx,
        }
    }

    /// Claim the device slot for `id`.
    ///
    /// Succeeds only when the slot is empty or already held by `id`
    /// (re-claiming is idempotent). A failed claim has no side effects.
    pub fn claim(&self, id: SessionId) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        match *slot {
            Some(holder) if holder != id => {
                debug!("Claim denied for session {}: slot held by {}", id, holder);
                false
            }
            Some(_) => true,
            None => {
                *slot = Some(id);
                self.claimant_tx.send_replace(Some(id));
                debug!("Session {} claimed the audio device", id);
                true
            }
        }
    }

    /// Release the slot if it is held by `id`.
    ///
    /// Releasing a slot held by a different session is a no-op, so a stale
    /// session can never evict a newer claimant.
    pub fn release(&self, id: SessionId) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if *slot == Some(id) {
            *slot = None;
            self.claimant_tx.send_replace(None);
            debug!("Session {} released the audio device", id);
        }
    }

    /// The session currently holding the device, if any.
    pub fn current_claimant(&self) -> Option<SessionId> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change stream of the current claimant, for presentation layers that
    /// disable competing controls without polling.
    pub fn subscribe_claimant(&self) -> watch::Receiver<Option<SessionId>> {
        self.claimant_tx.subscribe()
    }

    /// Whether the recognition capability is currently usable.
    pub fn is_available(&self) -> bool {
        *self.availability_tx.borrow()
    }

    /// Change stream of the availability flag.
    pub fn subscribe_availability(&self) -> watch::Receiver<bool> {
        self.availability_tx.subscribe()
    }

    pub fn set_available(&self, available: bool) {
        self.availability_tx.send_replace(available);
    }

    /// Seed the availability flag from the recognizer's asynchronous
    /// authorization query, then keep following its change stream.
    pub fn bind_authorization(
        self: &Arc<Self>,
        recognizer: Arc<dyn SpeechRecognizer>,
    ) -> JoinHandle<()> {
        let arbiter = Arc::clone(self);
        let mut authorization = recognizer.authorization();

        tokio::spawn(async move {
            arbiter.set_available(*authorization.borrow_and_update());

            while authorization.changed().await.is_ok() {
                let available = *authorization.borrow_and_update();
                info!("Recognition availability changed: {}", available);
                arbiter.set_available(available);
            }
        })
    }
}

impl Default for SessionArbiter {
    fn default() -> Self {
        Self::new()
    }
}
