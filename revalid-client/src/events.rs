//! Lifecycle and connectivity event sources.
//!
//! The platform layer produces these; observers only consume them. Focus is
//! a unit event fanned out over a broadcast channel. Connectivity is a
//! current value, so it travels over a watch channel.

use tokio::sync::{broadcast, watch};

const FOCUS_CHANNEL_CAPACITY: usize = 16;

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Satisfied,
    Unsatisfied,
}

impl ConnectivityStatus {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// The receiving side handed to clients and observers.
#[derive(Debug, Clone, Default)]
pub struct EventSources {
    focus: Option<broadcast::Sender<()>>,
    connectivity: Option<watch::Receiver<ConnectivityStatus>>,
}

impl EventSources {
    /// No event sources; observers never refetch on focus or reconnect.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_focus(mut self, focus: broadcast::Sender<()>) -> Self {
        self.focus = Some(focus);
        self
    }

    pub fn with_connectivity(mut self, connectivity: watch::Receiver<ConnectivityStatus>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn subscribe_focus(&self) -> Option<broadcast::Receiver<()>> {
        self.focus.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn connectivity(&self) -> Option<watch::Receiver<ConnectivityStatus>> {
        self.connectivity.clone()
    }

    /// True unless a connectivity source reports `Unsatisfied`.
    pub fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map_or(true, |rx| rx.borrow().is_satisfied())
    }
}

/// Producer side, for platform glue and tests.
#[derive(Debug)]
pub struct LifecycleEvents {
    focus: broadcast::Sender<()>,
    connectivity: watch::Sender<ConnectivityStatus>,
}

impl LifecycleEvents {
    pub fn new(initial: ConnectivityStatus) -> Self {
        let (focus, _) = broadcast::channel(FOCUS_CHANNEL_CAPACITY);
        let (connectivity, _) = watch::channel(initial);
        Self {
            focus,
            connectivity,
        }
    }

    /// The application became active.
    pub fn notify_focus(&self) {
        // Nobody listening is fine.
        let _ = self.focus.send(());
    }

    /// Publish a connectivity change. Repeating the current value is a no-op.
    pub fn set_connectivity(&self, status: ConnectivityStatus) {
        self.connectivity.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn sources(&self) -> EventSources {
        EventSources::none()
            .with_focus(self.focus.clone())
            .with_connectivity(self.connectivity.subscribe())
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        Self::new(ConnectivityStatus::Satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_focus_reaches_subscribers() {
        let events = LifecycleEvents::default();
        let sources = events.sources();
        let mut rx = sources.subscribe_focus().expect("focus source");
        events.notify_focus();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_connectivity_changes_only_on_transition() {
        let events = LifecycleEvents::new(ConnectivityStatus::Unsatisfied);
        let sources = events.sources();
        assert!(!sources.is_online());

        let mut rx = sources.connectivity().expect("connectivity source");
        events.set_connectivity(ConnectivityStatus::Unsatisfied);
        assert!(!rx.has_changed().expect("sender alive"));

        events.set_connectivity(ConnectivityStatus::Satisfied);
        assert!(rx.has_changed().expect("sender alive"));
        assert!(sources.is_online());
    }

    #[test]
    fn test_no_sources_is_online() {
        assert!(EventSources::none().is_online());
        assert!(EventSources::none().subscribe_focus().is_none());
    }
}
