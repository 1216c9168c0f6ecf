//! Single-slot cooperative signal channel
//!
//! STOP always wins: it replaces a pending UNEXPECTED_DISCONNECT and is never
//! itself overwritten. A duplicate of the pending signal is a no-op.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Signals understood by the tunnel state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Stop,
    UnexpectedDisconnect,
}

struct SignalSlot {
    pending: Option<Signal>,
    stop_token: CancellationToken,
}

/// Capacity-1 signal queue
pub struct SignalQueue {
    slot: Mutex<SignalSlot>,
    notify: Notify,
}

impl SignalQueue {
    pub fn new() -> Self {
        SignalQueue {
            slot: Mutex::new(SignalSlot {
                pending: None,
                stop_token: CancellationToken::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Post a signal without blocking.
    ///
    /// Returns whether the pending slot changed.
    pub fn offer(&self, signal: Signal) -> bool {
        let changed = {
            let mut slot = self.slot.lock();
            match (slot.pending, signal) {
                (Some(Signal::Stop), _) => false,
                (Some(pending), incoming) if pending == incoming => false,
                (_, Signal::Stop) => {
                    slot.pending = Some(Signal::Stop);
                    slot.stop_token.cancel();
                    true
                }
                (_, incoming) => {
                    slot.pending = Some(incoming);
                    true
                }
            }
        };
        if changed {
            debug!("Signal queued: {:?}", signal);
            self.notify.notify_one();
        }
        changed
    }

    /// Take the pending signal, if any
    pub fn try_take(&self) -> Option<Signal> {
        self.slot.lock().pending.take()
    }

    /// Peek without consuming
    pub fn pending(&self) -> Option<Signal> {
        self.slot.lock().pending
    }

    /// Wait up to `timeout` for a signal. A timeout is not an error.
    pub async fn poll(&self, timeout: Duration) -> Option<Signal> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(signal) = self.try_take() {
                return Some(signal);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_take();
            }
        }
    }

    /// Token cancelled as soon as STOP is offered.
    ///
    /// Long waits that cannot poll the queue (probing, fetch connectivity
    /// waits, backoff sleeps) select on this instead.
    pub fn stop_token(&self) -> CancellationToken {
        self.slot.lock().stop_token.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.slot.lock().stop_token.is_cancelled()
    }

    /// Clear pending state for a new run
    pub fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        if slot.stop_token.is_cancelled() {
            slot.stop_token = CancellationToken::new();
        }
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_stop_replaces_disconnect() {
        let queue = SignalQueue::new();
        assert!(queue.offer(Signal::UnexpectedDisconnect));
        assert!(queue.offer(Signal::Stop));
        assert_eq!(queue.try_take(), Some(Signal::Stop));
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn test_stop_not_overwritten() {
        let queue = SignalQueue::new();
        queue.offer(Signal::Stop);
        assert!(!queue.offer(Signal::UnexpectedDisconnect));
        assert_eq!(queue.pending(), Some(Signal::Stop));
    }

    #[test]
    fn test_duplicate_is_coalesced() {
        let queue = SignalQueue::new();
        assert!(queue.offer(Signal::UnexpectedDisconnect));
        assert!(!queue.offer(Signal::UnexpectedDisconnect));
        assert_eq!(queue.try_take(), Some(Signal::UnexpectedDisconnect));
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn test_stop_token_and_reset() {
        let queue = SignalQueue::new();
        let token = queue.stop_token();
        assert!(!token.is_cancelled());

        queue.offer(Signal::Stop);
        assert!(token.is_cancelled());
        assert!(queue.stop_requested());

        queue.reset();
        assert!(!queue.stop_requested());
        assert!(!queue.stop_token().is_cancelled());
        assert_eq!(queue.pending(), None);
    }

    #[tokio::test]
    async fn test_poll_timeout_is_none() {
        let queue = SignalQueue::new();
        let start = Instant::now();
        assert_eq!(queue.poll(Duration::from_millis(50)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_offer() {
        let queue = Arc::new(SignalQueue::new());
        let sender = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.offer(Signal::UnexpectedDisconnect);
        });

        let start = Instant::now();
        let signal = queue.poll(Duration::from_secs(5)).await;
        assert_eq!(signal, Some(Signal::UnexpectedDisconnect));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
