//! Acquisition-thread lifecycle shared by the hardware backends.
//!
//! A backend hands [`AcquisitionWorker::start`] the body of its loop. The body
//! runs on a named thread and receives a [`CancelToken`] it must check once per
//! iteration; `close()` only flips that token, so a loop ends within its own
//! I/O timeout and nothing is ever killed.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

/// Sentinel-free cancellation flag checked by acquisition loops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the loop to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle of a reading source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Never opened
    Idle,
    /// Acquisition loop is live
    Running,
    /// A loop ran and has ended (closed, timed out or failed)
    Stopped,
}

/// Clears the liveness flag when the loop thread unwinds.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type LoopBody = Box<dyn FnOnce(CancelToken) + Send>;

struct Slot {
    cancel: CancelToken,
    alive: Arc<AtomicBool>,
    started: bool,
    /// Loop to run once the cancelled one returns
    pending: Option<LoopBody>,
    handle: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .field("started", &self.started)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// Owns at most one live acquisition thread.
///
/// Starting while a cancelled loop is still finishing its last read does not
/// wait for it: the new body is queued and runs on the same thread as soon as
/// the old body returns, so the worker stays `Running` throughout.
#[derive(Debug)]
pub struct AcquisitionWorker {
    slot: Arc<Mutex<Slot>>,
}

impl Default for AcquisitionWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionWorker {
    /// A worker with no thread yet.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                cancel: CancelToken::new(),
                alive: Arc::new(AtomicBool::new(false)),
                started: false,
                pending: None,
                handle: None,
            })),
        }
    }

    /// Run `body` on a thread called `thread_name` unless a loop is live.
    ///
    /// Returns `true` when `body` was accepted. A loop that has already ended
    /// is replaced by a fresh thread; a loop that was cancelled but has not yet
    /// returned gets `body` queued behind it with a fresh token.
    pub fn start<F>(&self, thread_name: String, body: F) -> bool
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if slot.alive.load(Ordering::Acquire) {
            if !slot.cancel.is_cancelled() {
                return false;
            }
            debug!(thread = %thread_name, "Reopened while the previous loop winds down");
            slot.pending = Some(Box::new(body));
            return true;
        }
        slot.pending = None;
        // The old thread has passed its AliveGuard; let it detach
        slot.handle.take();

        let cancel = CancelToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let guard = AliveGuard(alive.clone());
        let shared = Arc::clone(&self.slot);
        let first: LoopBody = Box::new(body);
        let token = cancel.clone();

        slot.started = true;
        match thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = guard;
                run_queued(&shared, first, token);
            }) {
            Ok(handle) => {
                slot.cancel = cancel;
                slot.alive = alive;
                slot.handle = Some(handle);
                true
            }
            Err(e) => {
                // The closure (and its guard) was dropped with the error
                error!(thread = %thread_name, error = %e, "Failed to spawn acquisition thread");
                slot.alive = Arc::new(AtomicBool::new(false));
                false
            }
        }
    }

    /// Signal the live loop (if any) to stop and drop a queued restart.
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.cancel.cancel();
    }

    /// Whether a loop is live right now.
    pub fn is_alive(&self) -> bool {
        self.slot.lock().alive.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        let slot = self.slot.lock();
        if slot.alive.load(Ordering::Acquire) {
            SourceState::Running
        } else if slot.started {
            SourceState::Stopped
        } else {
            SourceState::Idle
        }
    }
}

/// Run `body`, then every body queued while it was winding down.
fn run_queued(shared: &Mutex<Slot>, body: LoopBody, token: CancelToken) {
    let mut next = Some((body, token));
    while let Some((body, token)) = next.take() {
        body(token);
        let mut slot = shared.lock();
        match slot.pending.take() {
            Some(queued) => {
                let token = CancelToken::new();
                slot.cancel = token.clone();
                next = Some((queued, token));
            }
            // Cleared under the lock so a concurrent start sees a dead loop
            None => slot.alive.store(false, Ordering::Release),
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
