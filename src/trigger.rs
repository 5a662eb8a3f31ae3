use parking_lot::{Condvar, Mutex};

/// A coalescing request signal between callers and a single worker.
///
/// Callers [request](Self::request_update) an update; the worker
/// [claims](Self::await_and_claim) it, does the work, and releases the claim.
/// While a request is pending or claimed, further requests are dropped rather
/// than queued, so at most one update is ever in flight.
#[derive(Debug, Default)]
pub struct UpdateTrigger {
    state: Mutex<TriggerState>,
    requested: Condvar,
}

#[derive(Debug, Default)]
struct TriggerState {
    pending: bool,
    busy: bool,
    closed: bool,
}

impl UpdateTrigger {
    /// Returns a new, idle trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an update.
    ///
    /// Returns false if an update is already pending or in progress, or if
    /// the trigger has been closed. In that case the request is dropped.
    pub fn request_update(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending || state.busy || state.closed {
            tracing::trace!(
                pending = state.pending,
                busy = state.busy,
                closed = state.closed,
                "update request coalesced"
            );
            return false;
        }

        state.pending = true;
        drop(state);
        self.requested.notify_one();
        true
    }

    /// Blocks until an update has been requested, then claims it.
    ///
    /// Claiming clears the pending request and marks the trigger busy under
    /// the same lock, so requests made while the update runs are rejected.
    /// The trigger stays busy until the returned claim is released or
    /// dropped.
    ///
    /// Returns `None` once the trigger is closed, even if a request is still
    /// pending.
    pub fn await_and_claim(&self) -> Option<UpdateClaim<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if state.pending {
                state.pending = false;
                state.busy = true;
                return Some(UpdateClaim { trigger: self });
            }
            self.requested.wait(&mut state);
        }
    }

    /// Marks the in-flight update as finished, allowing the next request to
    /// succeed.
    pub fn release(&self) {
        self.state.lock().busy = false;
    }

    /// Returns true if an update is pending or in progress.
    ///
    /// The answer may be outdated as soon as it is returned. Use it for
    /// status reporting, not to decide whether to call
    /// [`Self::request_update()`].
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.pending || state.busy
    }

    /// Closes the trigger, waking the worker if it is waiting for a request.
    /// All later requests are rejected.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.requested.notify_all();
    }

    /// Returns true if the trigger has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// An update claimed from an [`UpdateTrigger`]. The trigger stays busy until
/// this is released or dropped.
#[derive(Debug)]
#[must_use = "dropping the claim releases the trigger immediately"]
pub struct UpdateClaim<'a> {
    trigger: &'a UpdateTrigger,
}

impl UpdateClaim<'_> {
    /// Releases the trigger.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for UpdateClaim<'_> {
    fn drop(&mut self) {
        self.trigger.release();
    }
}

#[test]
fn requests_coalesce() {
    let trigger = UpdateTrigger::new();
    assert!(!trigger.is_busy());
    assert!(trigger.request_update());
    assert!(trigger.is_busy());
    // Still pending, so this is dropped.
    assert!(!trigger.request_update());

    let claim = trigger.await_and_claim().unwrap();
    assert!(trigger.is_busy());
    // Busy, so this is dropped too.
    assert!(!trigger.request_update());
    claim.release();

    assert!(!trigger.is_busy());
    assert!(trigger.request_update());
}

#[test]
fn explicit_release() {
    let trigger = UpdateTrigger::new();
    assert!(trigger.request_update());
    std::mem::forget(trigger.await_and_claim().unwrap());
    assert!(trigger.is_busy());
    trigger.release();
    assert!(!trigger.is_busy());
}

#[test]
fn wakes_waiting_worker() {
    use std::sync::Arc;
    use std::time::Duration;

    let trigger = Arc::new(UpdateTrigger::new());
    let worker = std::thread::spawn({
        let trigger = trigger.clone();
        move || {
            let mut claims = 0;
            while let Some(claim) = trigger.await_and_claim() {
                claims += 1;
                drop(claim);
            }
            claims
        }
    });

    for _ in 0..3 {
        while !trigger.request_update() {
            std::thread::sleep(Duration::from_millis(1));
        }
        while trigger.is_busy() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    trigger.close();
    assert!(!trigger.request_update());
    assert_eq!(worker.join().unwrap(), 3);
}

#[test]
fn close_wins_over_pending() {
    let trigger = UpdateTrigger::new();
    assert!(trigger.request_update());
    trigger.close();
    assert!(trigger.is_closed());
    assert!(trigger.await_and_claim().is_none());
}
