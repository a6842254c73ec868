//! Queue accounting: watermarks and flow control.

/// A snapshot of a queue's size and watermarks, carried by operation
/// events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueContext {
    pub size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

/// Which queue a watermark event refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueDirection {
    Send,
    Receive,
    Accept,
}

/// Which threshold was crossed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatermarkKind {
    /// The queue dropped under its low watermark after having been at or
    /// above it.
    Low,
    /// The queue rose over its high watermark after having been at or
    /// under it.
    High,
}

/// Tracks one queue's size against its watermarks.
///
/// Crossings are edges: between two observations moving from one side of a
/// threshold to the other, exactly one event is produced.
#[derive(Debug)]
pub(crate) struct QueueState {
    size: usize,
    low_watermark: usize,
    high_watermark: usize,
}

impl QueueState {
    pub(crate) fn new(low_watermark: usize, high_watermark: usize) -> QueueState {
        QueueState {
            size: 0,
            low_watermark,
            high_watermark,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn is_over_high(&self) -> bool {
        self.size > self.high_watermark
    }

    /// Grows the queue, reporting a `High` crossing at most once per
    /// transition over the high watermark.
    pub(crate) fn add(&mut self, amount: usize) -> Option<WatermarkKind> {
        let before = self.size;
        self.size += amount;
        if before <= self.high_watermark && self.size > self.high_watermark {
            Some(WatermarkKind::High)
        } else {
            None
        }
    }

    /// Shrinks the queue, reporting a `Low` crossing at most once per
    /// transition under the low watermark.
    pub(crate) fn remove(&mut self, amount: usize) -> Option<WatermarkKind> {
        let before = self.size;
        self.size = self.size.saturating_sub(amount);
        if before >= self.low_watermark && self.size < self.low_watermark {
            Some(WatermarkKind::Low)
        } else {
            None
        }
    }

    pub(crate) fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }
}

/// The direction(s) a flow-control request applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowControlType {
    Send,
    Receive,
    Both,
}

impl FlowControlType {
    pub fn applies_to_send(self) -> bool {
        matches!(self, FlowControlType::Send | FlowControlType::Both)
    }

    pub fn applies_to_receive(self) -> bool {
        matches!(self, FlowControlType::Receive | FlowControlType::Both)
    }
}

/// How a flow-control pause takes effect: `Immediate` clears readiness
/// interest at once, `Graceful` lets the operation at the head of the queue
/// finish first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowControlMode {
    Immediate,
    Graceful,
}

/// The per-socket pause state, orthogonal to shutdown.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FlowControlState {
    pub(crate) enable_send: bool,
    pub(crate) enable_receive: bool,
}

impl FlowControlState {
    pub(crate) fn new() -> FlowControlState {
        FlowControlState {
            enable_send: true,
            enable_receive: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_crossing_reported_once() {
        let mut queue = QueueState::new(1, 1024);
        assert_eq!(queue.add(512), None);
        assert_eq!(queue.add(600), Some(WatermarkKind::High));
        // Still over: growing further is not a new crossing.
        assert_eq!(queue.add(100), None);
    }

    #[test]
    fn low_crossing_reported_once() {
        let mut queue = QueueState::new(1, 1024);
        queue.add(2048);
        assert_eq!(queue.remove(1024), None);
        assert_eq!(queue.remove(1024), Some(WatermarkKind::Low));
        assert_eq!(queue.remove(10), None);
    }

    #[test]
    fn crossing_cycle() {
        let mut queue = QueueState::new(8, 16);
        assert_eq!(queue.add(20), Some(WatermarkKind::High));
        assert_eq!(queue.remove(20), Some(WatermarkKind::Low));
        assert_eq!(queue.add(20), Some(WatermarkKind::High));
        assert_eq!(queue.remove(20), Some(WatermarkKind::Low));
    }
}
