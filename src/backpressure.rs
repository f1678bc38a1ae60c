//! Read-side flow control.
//!
//! A participant with no outstanding work has nothing to read, so it closes
//! the [`ReadGate`] and the connection's read loop stops pulling bytes from
//! the transport until the gate opens again.
//!
//! The gate only blocks *new* transport reads. Commands already decoded from
//! the current chunk are still dispatched.

use std::sync::Arc;

use tokio::sync::watch;

/// Pause/resume switch shared between a participant and its read loop.
#[derive(Debug, Clone)]
pub struct ReadGate {
    open: Arc<watch::Sender<bool>>,
}

impl ReadGate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            open: Arc::new(open),
        }
    }

    /// Stop reading from the transport.
    pub fn pause(&self) {
        self.open.send_if_modified(|open| std::mem::replace(open, false));
    }

    /// Resume reading from the transport.
    pub fn resume(&self) {
        self.open.send_if_modified(|open| !std::mem::replace(open, true));
    }

    /// Check whether reads are paused.
    #[inline]
    pub fn is_paused(&self) -> bool {
        !*self.open.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait until the gate is closed.
    pub async fn wait_paused(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }
}

impl Default for ReadGate {
    fn default() -> Self {
        Self::new()
    }
}
