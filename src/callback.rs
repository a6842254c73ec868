//! Callbacks, futures, and cooperative cancellation.
//!
//! Every asynchronous operation completes through a [`Callback`], which is
//! guaranteed to be invoked exactly once: with the operation's natural
//! result, with an error, or with a cancellation. The at-most-once guarantee
//! is enforced by [`CallbackState`], a small atomic state machine shared
//! between the completion path and the cancellation path.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::strand::Strand;
use crate::{Error, Result};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const FINISHING: u8 = 2;
const ABORTED: u8 = 3;

/// The two-phase dispatch guard.
///
/// Transitions: `idle → scheduled → finishing`, with `idle → aborted` as the
/// cancellation branch. `schedule` succeeds only from `idle`, `finish` only
/// from `scheduled`; the second call to either is a no-op returning false.
/// This guarantees at-most-once dispatch even under concurrent completion
/// signals.
#[derive(Debug)]
pub struct CallbackState {
    state: AtomicU8,
}

impl CallbackState {
    pub fn new() -> CallbackState {
        CallbackState {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Claims the callback for dispatch. Only succeeds from `idle`.
    pub fn schedule(&self) -> bool {
        self.state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the dispatch as running. Only succeeds from `scheduled`.
    pub fn finish(&self) -> bool {
        self.state
            .compare_exchange(SCHEDULED, FINISHING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records a cancellation request. Only succeeds from `idle`; once it
    /// succeeds, `schedule` can never succeed.
    pub fn abort(&self) -> bool {
        self.state
            .compare_exchange(IDLE, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims an aborted callback so the cancellation result can be
    /// dispatched through the ordinary path.
    fn schedule_after_abort(&self) -> bool {
        self.state
            .compare_exchange(ABORTED, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_aborted(&self) -> bool {
        self.state.load(Ordering::Acquire) == ABORTED
    }
}

impl Default for CallbackState {
    fn default() -> CallbackState {
        CallbackState::new()
    }
}

/// The state shared between a callback, its cancellation tokens, and the
/// operation that enqueued it.
struct CancelCell {
    state: CallbackState,
    // Runs when an abort is accepted; installed by the operation so the
    // cancellation surfaces as a terminal event instead of waiting for the
    // next readiness.
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for CancelCell {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("CancelCell").field("state", &self.state).finish()
    }
}

impl CancelCell {
    fn new() -> Arc<CancelCell> {
        Arc::new(CancelCell {
            state: CallbackState::new(),
            hook: Mutex::new(None),
        })
    }
}

/// A handle that may abort a pending operation before its callback runs.
///
/// `abort` either returns true, in which case the callback will never run
/// with a non-cancelled result, or false, in which case the callback runs to
/// completion with its natural result. Never both.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cell: Arc<CancelCell>,
}

impl CancellationToken {
    /// The sentinel token of operations that cannot be canceled by the
    /// initiator; `abort` always returns false.
    pub fn uncancelable() -> CancellationToken {
        let cell = CancelCell::new();
        cell.state.schedule();
        CancellationToken { cell }
    }

    /// Requests cancellation. Returns true iff the request was accepted
    /// before the callback was scheduled; the operation then completes with
    /// a `Cancelled` result through its cancellation path.
    pub fn abort(&self) -> bool {
        if !self.cell.state.abort() {
            return false;
        }
        let hook = self.cell.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.cell.state.is_aborted()
    }
}

/// An invocable with an optional strand and a dispatch guard.
///
/// The effective strand of a dispatch is the callback's own strand or, if it
/// has none, the invoker's. When the effective strand is already running on
/// the calling thread and the dispatch is not deferred, the callback is
/// invoked synchronously; otherwise it is posted.
pub struct Callback<T> {
    f: Box<dyn FnOnce(T) + Send + 'static>,
    strand: Option<Arc<Strand>>,
    cell: Arc<CancelCell>,
}

impl<T: Send + 'static> Callback<T> {
    pub fn new<F>(f: F) -> Callback<T>
    where
        F: FnOnce(T) + Send + 'static,
    {
        Callback {
            f: Box::new(f),
            strand: None,
            cell: CancelCell::new(),
        }
    }

    /// Pins dispatch onto `strand` regardless of the invoker's context.
    #[must_use]
    pub fn with_strand(mut self, strand: Arc<Strand>) -> Callback<T> {
        self.strand = Some(strand);
        self
    }

    /// Returns a token that can abort this callback.
    pub fn cancellation(&self) -> CancellationToken {
        CancellationToken {
            cell: Arc::clone(&self.cell),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.cell.state.is_aborted()
    }

    /// Installs the action an accepted abort runs, typically "remove the
    /// pending operation and dispatch its cancelled event". Replaces any
    /// previous hook. A no-op if the callback was already aborted or
    /// scheduled.
    pub fn set_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.cell.hook.lock() = Some(Box::new(hook));
    }

    /// Clears the abort action, e.g. right before the operation leaves its
    /// queue.
    pub fn clear_cancel_hook(&self) {
        self.cell.hook.lock().take();
    }

    /// Dispatches the natural result. A no-op if the callback was aborted
    /// or already dispatched.
    pub fn complete(self, value: T, invoker: Option<&Arc<Strand>>, defer: bool) {
        if !self.cell.state.schedule() {
            return;
        }
        self.run(value, invoker, defer);
    }

    /// Dispatches `value` if the callback was not aborted, or `cancelled`
    /// if an abort won the race. Exactly one of the two is delivered, once.
    pub fn complete_or(self, value: T, cancelled: T, invoker: Option<&Arc<Strand>>, defer: bool) {
        if self.cell.state.schedule() {
            self.run(value, invoker, defer);
        } else if self.cell.state.schedule_after_abort() {
            self.run(cancelled, invoker, defer);
        }
    }

    /// Dispatches a terminal result regardless of abort state. Used by
    /// cancellation and close paths. Still at-most-once.
    pub fn fire(self, value: T, invoker: Option<&Arc<Strand>>, defer: bool) {
        if !self.cell.state.schedule() && !self.cell.state.schedule_after_abort() {
            return;
        }
        self.run(value, invoker, defer);
    }

    fn run(self, value: T, invoker: Option<&Arc<Strand>>, defer: bool) {
        let Callback { f, strand, cell } = self;
        let invoke = move |value: T| {
            if cell.state.finish() {
                f(value);
            }
        };
        let strand = strand.as_ref().or(invoker);
        match strand {
            Some(strand) if !defer && strand.is_running_in_this_thread() => invoke(value),
            Some(strand) => {
                let strand = Arc::clone(strand);
                strand.execute(Box::new(move || invoke(value)));
            }
            None => invoke(value),
        }
    }
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Callback")
            .field("strand", &self.strand.as_ref().map(|s| s.id()))
            .finish()
    }
}

struct FutureShared<T> {
    slot: Mutex<Option<T>>,
    available: Condvar,
}

/// A waitable wrapper around a callback result.
///
/// Constructing the future installs it as the operation's callback; `wait`
/// blocks until the result is delivered. The result is taken by the first
/// successful wait.
pub struct FutureResult<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> std::fmt::Debug for FutureResult<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("FutureResult")
            .field("resolved", &self.shared.slot.lock().is_some())
            .finish()
    }
}

impl<T: Send + 'static> FutureResult<T> {
    /// Creates the future and the callback that resolves it.
    pub fn new() -> (FutureResult<T>, Callback<T>) {
        let shared = Arc::new(FutureShared {
            slot: Mutex::new(None),
            available: Condvar::new(),
        });
        let cb_shared = Arc::clone(&shared);
        let callback = Callback::new(move |value| {
            *cb_shared.slot.lock() = Some(value);
            cb_shared.available.notify_all();
        });
        (FutureResult { shared }, callback)
    }

    /// Blocks until the result is available.
    pub fn wait(&self) -> T {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.shared.available.wait(&mut slot);
        }
    }

    /// Blocks until the result is available or `timeout` elapses, in which
    /// case `Error::WouldBlock` is returned and the result, if it arrives
    /// later, is left for a subsequent wait.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return Ok(value);
            }
            if self
                .shared
                .available
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return slot.take().ok_or(Error::WouldBlock);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn state_two_phase() {
        let state = CallbackState::new();
        assert!(state.schedule());
        assert!(!state.schedule());
        assert!(state.finish());
        assert!(!state.finish());
    }

    #[test]
    fn abort_beats_schedule_or_loses() {
        let state = CallbackState::new();
        assert!(state.abort());
        assert!(!state.schedule());
        assert!(state.schedule_after_abort());

        let state = CallbackState::new();
        assert!(state.schedule());
        assert!(!state.abort());
    }

    #[test]
    fn callback_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let callback = Callback::new(move |_: u32| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        callback.complete(7, None, false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn complete_or_resolves_the_cancellation_race() {
        // Abort first: the cancelled value is delivered.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let callback = Callback::new(move |value: &'static str| seen2.lock().push(value));
        let token = callback.cancellation();
        assert!(token.abort());
        callback.complete_or("natural", "cancelled", None, false);
        assert_eq!(*seen.lock(), vec!["cancelled"]);

        // Completion first: the abort is refused.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let callback = Callback::new(move |value: &'static str| seen2.lock().push(value));
        let token = callback.cancellation();
        callback.complete_or("natural", "cancelled", None, false);
        assert!(!token.abort());
        assert_eq!(*seen.lock(), vec!["natural"]);
    }

    #[test]
    fn abort_runs_the_installed_hook_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let callback = Callback::new(|_: u32| {});
        callback.set_cancel_hook(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        let token = callback.cancellation();
        let token2 = token.clone();
        assert!(token.abort());
        assert!(!token2.abort());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uncancelable_token_refuses() {
        let token = CancellationToken::uncancelable();
        assert!(!token.abort());
    }

    #[test]
    fn future_wait_timeout() {
        let (future, callback) = FutureResult::<u32>::new();
        assert_eq!(
            future.wait_timeout(Duration::from_millis(20)),
            Err(Error::WouldBlock)
        );
        let handle = thread::spawn(move || callback.complete(11, None, true));
        assert_eq!(future.wait(), 11);
        handle.join().unwrap();
    }
}
