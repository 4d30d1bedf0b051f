//! Unbounded change queue between table watchers and the dispatcher.

use crate::types::ChangeEvent;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Thread-safe FIFO of change events.
///
/// Each producer's submission order is preserved. Cloning shares the same
/// queue; the queue keeps both channel halves, so pushes never fail.
#[derive(Clone)]
pub struct ChangeQueue {
    sender: Sender<ChangeEvent>,
    receiver: Receiver<ChangeEvent>,
}

/// Producer handle given to a table watcher.
#[derive(Clone)]
pub struct QueueProducer {
    sender: Sender<ChangeEvent>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn producer(&self) -> QueueProducer {
        QueueProducer {
            sender: self.sender.clone(),
        }
    }

    pub fn push(&self, event: ChangeEvent) {
        // Cannot disconnect while `self` holds the receiver.
        let _ = self.sender.send(event);
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// Pop, waiting up to `timeout` for an event to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueProducer {
    /// Enqueue an event. Returns false once the queue has been dropped.
    pub fn push(&self, event: ChangeEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeVersion, ModelType, Operation, RowId};

    fn event(table: &str, version: i64) -> ChangeEvent {
        ChangeEvent {
            change_version: ChangeVersion(version),
            operation: Operation::Insert,
            row_id: RowId(version),
            table: table.to_string(),
            model: ModelType::of::<()>(),
        }
    }

    #[test]
    fn test_fifo_per_producer() {
        let queue = ChangeQueue::new();
        let a = queue.producer();
        let b = queue.producer();

        let ta = std::thread::spawn(move || {
            for v in 1..=100 {
                a.push(event("a", v));
            }
        });
        let tb = std::thread::spawn(move || {
            for v in 1..=100 {
                b.push(event("b", v));
            }
        });
        ta.join().unwrap();
        tb.join().unwrap();

        assert_eq!(queue.len(), 200);

        let mut last_a = 0;
        let mut last_b = 0;
        while let Some(e) = queue.try_pop() {
            let last = if e.table == "a" { &mut last_a } else { &mut last_b };
            assert!(e.change_version.0 > *last);
            *last = e.change_version.0;
        }
        assert_eq!((last_a, last_b), (100, 100));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_timeout_on_empty() {
        let queue = ChangeQueue::new();
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());

        queue.push(event("a", 1));
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(5)).map(|e| e.change_version),
            Some(ChangeVersion(1))
        );
    }

    #[test]
    fn test_producer_after_queue_dropped() {
        let queue = ChangeQueue::new();
        let producer = queue.producer();
        drop(queue);
        assert!(!producer.push(event("a", 1)));
    }
}
