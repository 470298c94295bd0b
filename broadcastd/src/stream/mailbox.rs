//! Security-code rendezvous between the control plane and a pending challenge.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

/// Result of waiting for a security code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    Code(String),
    TimedOut,
    Cancelled,
}

/// Single-slot mailbox. The slot is armed only while a challenge waits;
/// codes put while nobody waits are dropped.
#[derive(Debug, Default)]
pub(crate) struct SecurityCodeMailbox {
    slot: Mutex<Option<oneshot::Sender<String>>>,
}

/// Disarms the slot when the waiter goes away, whatever the reason.
struct Disarm<'a>(&'a SecurityCodeMailbox);

impl Drop for Disarm<'_> {
    fn drop(&mut self) {
        self.0.slot.lock().take();
    }
}

impl SecurityCodeMailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hand `code` to the waiting challenge. Never blocks.
    ///
    /// Returns `false` when no challenge was waiting.
    pub(crate) fn put(&self, code: String) -> bool {
        match self.slot.lock().take() {
            Some(sender) => sender.send(code).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait for a code until `deadline`.
    pub(crate) async fn recv(&self, deadline: Instant, cancel: &CancellationToken) -> Delivery {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock() = Some(tx);
        let _disarm = Disarm(self);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Delivery::Cancelled,
            received = timeout_at(deadline, rx) => match received {
                Ok(Ok(code)) => Delivery::Code(code),
                // The sender vanished without a code; treat like an expired wait.
                Ok(Err(_)) | Err(_) => Delivery::TimedOut,
            },
        }
    }
}
