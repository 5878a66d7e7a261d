//! Popup-window closure detection
//!
//! Cross-window close notifications are unreliable, so closure is detected by
//! probing the window on a fixed interval. The probe runs as a cancellable
//! future instead of a free-running timer.

use crate::payments::traits::WindowProbe;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupOutcome {
    /// The window was found closed
    Closed,
    /// Monitoring was cancelled before the window closed
    Cancelled,
}

/// Handle used to cancel a running monitor
#[derive(Debug, Clone)]
pub struct PopupCancel {
    sender: watch::Sender<bool>,
}

impl PopupCancel {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

pub struct PopupMonitor {
    check_interval: Duration,
}

impl Default for PopupMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl PopupMonitor {
    pub fn new(check_interval: Duration) -> Self {
        Self { check_interval }
    }

    /// Creates a cancel handle and the receiver to pass to [`PopupMonitor::watch`]
    pub fn cancel_pair() -> (PopupCancel, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (PopupCancel { sender }, receiver)
    }

    /// Resolves once the probe reports the window closed, or on cancellation
    pub async fn watch<P: WindowProbe + ?Sized>(
        &self,
        probe: &P,
        mut cancel: watch::Receiver<bool>,
    ) -> PopupOutcome {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *cancel.borrow() {
                return PopupOutcome::Cancelled;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if probe.is_closed() {
                        debug!("Payment popup closed");
                        return PopupOutcome::Closed;
                    }
                }
                changed = cancel.changed() => {
                    // A dropped sender counts as cancellation too
                    if changed.is_err() || *cancel.borrow() {
                        return PopupOutcome::Cancelled;
                    }
                }
            }
        }
    }
}
