//! Serialized execution contexts.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run deferred functors, typically an engine's run loop.
pub trait Executor: Send + Sync {
    /// Defers a functor onto the executor's own execution context.
    fn execute(&self, task: Task);
}

// Object ids are allocated process-wide so log lines can correlate strands,
// sockets, and timers across engines.
static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // The stack of strands currently draining on this thread. A stack rather
    // than a single slot: a callback may synchronously run a nested drain
    // after releasing its own locks.
    static CURRENT: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// An execution queue guaranteeing that functions scheduled onto it run
/// serially, in FIFO order, never concurrently with one another.
///
/// A strand does not own a thread; it borrows one from its [`Executor`] by
/// scheduling a drain whenever work arrives.
pub struct Strand {
    id: u64,
    queue: Mutex<VecDeque<Task>>,
    // True while a drain is scheduled or running; guarantees one drainer.
    scheduled: AtomicBool,
    executor: Weak<dyn Executor>,
}

impl Strand {
    pub fn new(executor: Weak<dyn Executor>) -> Arc<Strand> {
        Arc::new(Strand {
            id: NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            executor,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueues a functor for serialized execution.
    pub fn execute(self: &Arc<Self>, task: Task) {
        self.queue.lock().push_back(task);
        self.schedule();
    }

    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            // A drain is already pending; it will observe the new task.
            return;
        }
        match self.executor.upgrade() {
            Some(executor) => {
                let strand = Arc::clone(self);
                executor.execute(Box::new(move || strand.drain()));
            }
            None => {
                warn!("strand {} has no executor; dropping queued work", self.id);
                self.queue.lock().clear();
                self.scheduled.store(false, Ordering::Release);
            }
        }
    }

    /// Runs queued functors until the queue is empty.
    ///
    /// Called on the executor's thread. Functors submitted while draining
    /// run in the same pass, preserving submission order.
    pub fn drain(self: &Arc<Self>) {
        CURRENT.with(|current| current.borrow_mut().push(self.id));
        loop {
            let task = self.queue.lock().pop_front();
            match task {
                Some(task) => task(),
                None => {
                    self.scheduled.store(false, Ordering::Release);
                    // A task may have slipped in between the pop and the
                    // store; reclaim the drain if so.
                    if self.queue.lock().is_empty()
                        || self.scheduled.swap(true, Ordering::AcqRel)
                    {
                        break;
                    }
                }
            }
        }
        CURRENT.with(|current| {
            current.borrow_mut().pop();
        });
    }

    /// True iff called from a thread currently executing this strand.
    pub fn is_running_in_this_thread(&self) -> bool {
        CURRENT.with(|current| current.borrow().contains(&self.id))
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Strand")
            .field("id", &self.id)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

/// An executor that runs tasks inline on the calling thread.
///
/// Used by futures and tests that have no engine thread to borrow.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}
