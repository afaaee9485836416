use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::capability::Interruption;
use crate::session::machine::SessionEvent;

/// Active-only subscription to the device interruption channel.
///
/// Installed when a session leaves `Idle` and torn down when it reaches
/// `Completed`/`Failed`/`Idle`, so no notification can land in a session that
/// is no longer driving the device. Forwarded events enter the session's
/// event loop like every other completion.
pub(crate) struct InterruptionWatch {
    task: JoinHandle<()>,
}

impl InterruptionWatch {
    pub(crate) fn install(
        mut notifications: broadcast::Receiver<Interruption>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(interruption) => {
                        if event_tx
                            .send(SessionEvent::Interruption(interruption))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Interruption watch lagged; skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { task }
    }

    pub(crate) fn teardown(self) {
        self.task.abort();
    }
}
