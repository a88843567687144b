// ABOUTME: Listens for the supervisor's shutdown broadcast
// ABOUTME: Every long-lived task holds one of these and polls it in its select loop

use tokio::sync::broadcast;

/// Listens for the shutdown signal.
///
/// Only a single `()` value is ever sent on the broadcast channel. Once it
/// has been received the task should stop accepting new work, finish what
/// is in flight within the supervisor's grace period and return.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` once the signal has been received.
    is_shutdown: bool,

    /// Receiver half of the supervisor's broadcast channel.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown { is_shutdown: false, notify }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for the shutdown notice, if it has not arrived already.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // An error means the sender dropped, which counts as shutdown too.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
