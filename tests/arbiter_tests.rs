// Integration tests for the session arbiter
//
// These tests verify single-claim exclusivity over the shared audio device:
// at most one identity holds the slot, re-claims are idempotent, and a
// non-holder can never release (or evict) the current claimant.

use std::sync::Arc;
use std::time::Duration;

use voice_capture::{SessionArbiter, SessionId, SimRecognizer, SpeechRecognizer};

#[test]
fn claim_is_exclusive_and_idempotent() {
    let arbiter = SessionArbiter::new();
    let a = SessionId::new();
    let b = SessionId::new();

    assert!(arbiter.claim(a), "empty slot should be claimable");
    assert!(arbiter.claim(a), "re-claiming the held slot is idempotent");
    assert!(!arbiter.claim(b), "a second identity must be refused");
    assert_eq!(arbiter.current_claimant(), Some(a));
}

#[test]
fn release_by_non_holder_is_ignored() {
    let arbiter = SessionArbiter::new();
    let holder = SessionId::new();
    let stale = SessionId::new();

    assert!(arbiter.claim(holder));

    // A stale session must not evict the current claimant.
    arbiter.release(stale);
    assert_eq!(arbiter.current_claimant(), Some(holder));

    arbiter.release(holder);
    assert_eq!(arbiter.current_claimant(), None);
}

#[test]
fn slot_becomes_claimable_after_release() {
    let arbiter = SessionArbiter::new();
    let a = SessionId::new();
    let b = SessionId::new();

    assert!(arbiter.claim(a));
    assert!(!arbiter.claim(b), "claim B must fail while A holds");

    arbiter.release(a);
    assert!(arbiter.claim(b), "claim B must succeed once A released");
    assert_eq!(arbiter.current_claimant(), Some(b));
}

#[test]
fn claimant_change_stream_reports_ownership() {
    let arbiter = SessionArbiter::new();
    let id = SessionId::new();
    let rx = arbiter.subscribe_claimant();

    assert_eq!(*rx.borrow(), None);

    arbiter.claim(id);
    assert_eq!(*rx.borrow(), Some(id));

    arbiter.release(id);
    assert_eq!(*rx.borrow(), None);
}

#[tokio::test]
async fn availability_follows_recognizer_authorization() {
    let arbiter = Arc::new(SessionArbiter::new());
    let recognizer = Arc::new(SimRecognizer::new());

    let _task = arbiter.bind_authorization(Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>);
    let mut availability = arbiter.subscribe_availability();

    // Seeded from the recognizer's initial authorization.
    tokio::time::timeout(
        Duration::from_secs(2),
        availability.wait_for(|available| *available),
    )
    .await
    .expect("timed out waiting for availability")
    .expect("availability channel closed");

    // Later authorization changes are re-broadcast.
    recognizer.set_authorized(false);
    tokio::time::timeout(
        Duration::from_secs(2),
        availability.wait_for(|available| !*available),
    )
    .await
    .expect("timed out waiting for availability to drop")
    .expect("availability channel closed");

    assert!(!arbiter.is_available());
}
