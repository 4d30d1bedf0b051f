//! Cancellation signal shared by watchers and dispatcher workers.
//!
//! Cancellation is a channel that never carries a message: dropping the only
//! sender disconnects every receiver at once, which wakes any thread blocked
//! in `recv`/`select!` on it.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::time::Duration;

/// Owner side of a cancellation signal.
pub struct CancelHandle {
    sender: Mutex<Option<Sender<()>>>,
}

/// Observer side of a cancellation signal. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    receiver: Receiver<()>,
}

impl CancelHandle {
    /// Create a linked handle/signal pair.
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (sender, receiver) = bounded(0);
        (
            CancelHandle {
                sender: Mutex::new(Some(sender)),
            },
            CancelSignal { receiver },
        )
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl CancelSignal {
    /// A signal with no handle, which is never cancelled.
    pub fn never() -> Self {
        Self {
            receiver: crossbeam_channel::never(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`. Returns true if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Receiver for use in `crossbeam_channel::select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}
