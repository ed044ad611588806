use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Read side of a cancellation flag. Cloned into every layer that must stop
/// when the driving context goes away.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    /// A signal nobody can trip.
    pub fn never() -> Self {
        CancelController::new().signal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct CancelController {
    signal: CancelSignal,
}

impl CancelController {
    pub fn new() -> Self {
        Self {
            signal: CancelSignal {
                inner: Arc::new(CancelInner {
                    cancelled: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    pub fn cancel(&self) {
        self.signal.inner.cancelled.store(true, Ordering::SeqCst);
        self.signal.inner.notify.notify_waiters();
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}
