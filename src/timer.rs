//! Deadlines, recurrence, and drift accounting.
//!
//! Engines own a wheel of pending deadlines and use the earliest one as
//! their poll timeout. The wheel offers O(log n) insertion and O(1)
//! next-expiry lookup via a binary heap over a slab of entries; equal
//! deadlines break ties by insertion order.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::trace;
use slab::Slab;

use crate::driver::Driver;
use crate::strand::Strand;

/// How a timer event was produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerEventType {
    /// The deadline arrived.
    Deadline,
    /// The timer was canceled while pending.
    Canceled,
    /// The engine shut down with the timer still pending.
    Closed,
}

/// The measurement delivered with every timer event.
#[derive(Copy, Clone, Debug)]
pub struct TimerContext {
    /// The instant the engine observed the firing.
    pub now: Instant,
    /// The deadline the firing was scheduled for.
    pub deadline: Instant,
    /// `now - deadline`; zero for cancellation and closure events.
    pub drift: Duration,
}

#[derive(Clone, Debug)]
pub struct TimerEvent {
    pub kind: TimerEventType,
    pub context: TimerContext,
}

/// A timer's session callback. Unlike operation callbacks, a session may
/// observe many events over the timer's life (periodic deadlines, then a
/// cancellation or closure).
pub type TimerCallback = Arc<dyn Fn(TimerEvent) + Send + Sync>;

/// Scheduling parameters for a timer.
#[derive(Clone, Debug)]
pub struct TimerOptions {
    pub deadline: Instant,
    /// Rescheduling period. A periodic timer reschedules to
    /// `previous deadline + period` so drift does not accumulate, unless
    /// `drift_carrying` asks for `now + period`.
    pub period: Option<Duration>,
    /// Destroy the timer after its first deadline even if periodic.
    pub one_shot: bool,
    pub drift_carrying: bool,
    /// Dispatch the session on this strand; `None` runs on the engine
    /// thread that observed the deadline.
    pub strand: Option<Arc<Strand>>,
}

impl TimerOptions {
    pub fn once(deadline: Instant) -> TimerOptions {
        TimerOptions {
            deadline,
            period: None,
            one_shot: true,
            drift_carrying: false,
            strand: None,
        }
    }

    pub fn periodic(deadline: Instant, period: Duration) -> TimerOptions {
        TimerOptions {
            deadline,
            period: Some(period),
            one_shot: false,
            drift_carrying: false,
            strand: None,
        }
    }
}

/// A handle identifying a scheduled timer.
///
/// Identity is the integer id; the handle also keeps a reference to its
/// engine so `cancel` can reach the wheel.
#[derive(Clone, Debug)]
pub struct Timer {
    id: usize,
    driver: Weak<dyn Driver>,
}

impl Timer {
    pub(crate) fn new(id: usize, driver: Weak<dyn Driver>) -> Timer {
        Timer { id, driver }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Cancels the timer if still pending. The session observes a
    /// `Canceled` event; returns false when the timer already fired its
    /// final deadline or was canceled before.
    pub fn cancel(&self) -> bool {
        match self.driver.upgrade() {
            Some(driver) => driver.remove_timer(self.id),
            None => false,
        }
    }
}

struct Entry {
    deadline: Instant,
    period: Option<Duration>,
    one_shot: bool,
    drift_carrying: bool,
    session: TimerCallback,
    strand: Option<Arc<Strand>>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
struct HeapItem {
    deadline: Instant,
    seq: u64,
    key: usize,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A timer event ready to be dispatched by the engine, outside the wheel's
/// lock.
pub(crate) struct Firing {
    pub(crate) session: TimerCallback,
    pub(crate) strand: Option<Arc<Strand>>,
    pub(crate) event: TimerEvent,
}

impl Firing {
    /// Runs the session inline or posts it to the timer's strand.
    pub(crate) fn dispatch(self) {
        match self.strand {
            Some(strand) => {
                let session = self.session;
                let event = self.event;
                strand.execute(Box::new(move || session(event)));
            }
            None => (self.session)(self.event),
        }
    }
}

pub(crate) struct TimerWheel {
    entries: Slab<Entry>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> TimerWheel {
        TimerWheel {
            entries: Slab::new(),
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub(crate) fn add(&mut self, options: TimerOptions, session: TimerCallback) -> usize {
        let key = self.entries.insert(Entry {
            deadline: options.deadline,
            period: options.period,
            one_shot: options.one_shot,
            drift_carrying: options.drift_carrying,
            session,
            strand: options.strand,
        });
        self.push(key, options.deadline);
        trace!("scheduled timer {} for {:?}", key, options.deadline);
        key
    }

    fn push(&mut self, key: usize, deadline: Instant) {
        self.seq += 1;
        self.heap.push(Reverse(HeapItem {
            deadline,
            seq: self.seq,
            key,
        }));
    }

    /// Cancels a pending timer, returning the `Canceled` firing to
    /// dispatch. The heap item is left behind and skipped lazily.
    pub(crate) fn cancel(&mut self, key: usize) -> Option<Firing> {
        if !self.entries.contains(key) {
            return None;
        }
        let entry = self.entries.remove(key);
        trace!("canceled timer {}", key);
        let now = Instant::now();
        Some(Firing {
            session: entry.session,
            strand: entry.strand,
            event: TimerEvent {
                kind: TimerEventType::Canceled,
                context: TimerContext {
                    now,
                    deadline: entry.deadline,
                    drift: Duration::ZERO,
                },
            },
        })
    }

    /// The earliest pending deadline, discarding stale heap items.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(item)) = self.heap.peek().copied() {
            match self.entries.get(item.key) {
                Some(entry) if entry.deadline == item.deadline => return Some(item.deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pops every deadline at or before `now`, in non-decreasing deadline
    /// order. Periodic timers are rescheduled; one-shot timers are
    /// destroyed.
    pub(crate) fn fire_due(&mut self, now: Instant) -> Vec<Firing> {
        let mut firings = Vec::new();
        while let Some(Reverse(item)) = self.heap.peek().copied() {
            if item.deadline > now {
                break;
            }
            self.heap.pop();
            let entry = match self.entries.get(item.key) {
                Some(entry) if entry.deadline == item.deadline => entry,
                // Canceled or rescheduled; the heap item is stale.
                _ => continue,
            };

            let event = TimerEvent {
                kind: TimerEventType::Deadline,
                context: TimerContext {
                    now,
                    deadline: item.deadline,
                    drift: now.saturating_duration_since(item.deadline),
                },
            };

            let recur = match entry.period {
                Some(period) if !entry.one_shot => Some(period),
                _ => None,
            };
            match recur {
                Some(period) => {
                    let entry = self.entries.get_mut(item.key).unwrap();
                    entry.deadline = if entry.drift_carrying {
                        now + period
                    } else {
                        item.deadline + period
                    };
                    let next = entry.deadline;
                    let firing = Firing {
                        session: Arc::clone(&entry.session),
                        strand: entry.strand.clone(),
                        event,
                    };
                    self.push(item.key, next);
                    firings.push(firing);
                }
                None => {
                    let entry = self.entries.remove(item.key);
                    firings.push(Firing {
                        session: entry.session,
                        strand: entry.strand,
                        event,
                    });
                }
            }
        }
        firings
    }

    /// Destroys every pending timer, producing `Closed` firings. Called on
    /// engine shutdown.
    pub(crate) fn close_all(&mut self) -> Vec<Firing> {
        let now = Instant::now();
        let mut firings = Vec::new();
        for entry in self.entries.drain() {
            firings.push(Firing {
                session: entry.session,
                strand: entry.strand,
                event: TimerEvent {
                    kind: TimerEventType::Closed,
                    context: TimerContext {
                        now,
                        deadline: entry.deadline,
                        drift: Duration::ZERO,
                    },
                },
            });
        }
        self.heap.clear();
        firings
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (TimerCallback, Arc<Mutex<Vec<TimerEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let session: TimerCallback = Arc::new(move |event| seen2.lock().push(event));
        (session, seen)
    }

    #[test]
    fn fires_in_deadline_order_with_insertion_tie_break() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        let (session, seen) = recorder();

        // Inserted out of order, two sharing a deadline.
        wheel.add(
            TimerOptions::once(base + Duration::from_millis(20)),
            Arc::clone(&session),
        );
        let first_at_ten = wheel.add(
            TimerOptions::once(base + Duration::from_millis(10)),
            Arc::clone(&session),
        );
        wheel.add(
            TimerOptions::once(base + Duration::from_millis(10)),
            Arc::clone(&session),
        );

        assert_eq!(
            wheel.next_deadline(),
            Some(base + Duration::from_millis(10))
        );

        let firings = wheel.fire_due(base + Duration::from_millis(25));
        for firing in firings {
            firing.dispatch();
        }
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].context.deadline, base + Duration::from_millis(10));
        assert_eq!(seen[1].context.deadline, base + Duration::from_millis(10));
        assert_eq!(seen[2].context.deadline, base + Duration::from_millis(20));
        let _ = first_at_ten;
    }

    #[test]
    fn periodic_reschedules_without_drift() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        let (session, seen) = recorder();
        wheel.add(
            TimerOptions::periodic(base + Duration::from_millis(10), Duration::from_millis(10)),
            session,
        );

        // The engine is late: both the 10ms and 20ms deadlines are due.
        let firings = wheel.fire_due(base + Duration::from_millis(25));
        for firing in firings {
            firing.dispatch();
        }
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].context.deadline, base + Duration::from_millis(10));
        assert_eq!(seen[1].context.deadline, base + Duration::from_millis(20));
        // Rescheduling is deadline-based, so the next expiry is exactly 30ms.
        drop(seen);
        assert_eq!(
            wheel.next_deadline(),
            Some(base + Duration::from_millis(30))
        );
    }

    #[test]
    fn cancel_fires_canceled_and_suppresses_deadline() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        let (session, seen) = recorder();
        let key = wheel.add(TimerOptions::once(base + Duration::from_millis(5)), session);

        wheel.cancel(key).unwrap().dispatch();
        assert!(wheel.cancel(key).is_none());
        assert!(wheel.fire_due(base + Duration::from_millis(50)).is_empty());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, TimerEventType::Canceled);
    }

    #[test]
    fn close_all_reports_closed() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        let (session, seen) = recorder();
        wheel.add(
            TimerOptions::once(base + Duration::from_secs(60)),
            Arc::clone(&session),
        );
        wheel.add(TimerOptions::once(base + Duration::from_secs(120)), session);

        for firing in wheel.close_all() {
            firing.dispatch();
        }
        assert!(wheel.is_empty());
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.kind == TimerEventType::Closed));
    }

    #[test]
    fn one_shot_flag_overrides_period() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        let (session, seen) = recorder();
        let mut options =
            TimerOptions::periodic(base + Duration::from_millis(1), Duration::from_millis(1));
        options.one_shot = true;
        wheel.add(options, session);

        for firing in wheel.fire_due(base + Duration::from_millis(10)) {
            firing.dispatch();
        }
        assert!(wheel.is_empty());
        assert_eq!(seen.lock().len(), 1);
    }
}
