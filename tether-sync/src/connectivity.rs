//! Connectivity signal.
//!
//! A `watch` channel holding the latest online/offline state. The platform
//! layer reports changes with [`ConnectivityMonitor::set_online`]; the
//! mutation queue follows the receiver and flushes on every offline → online
//! transition.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Report the current state. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.sender.send_replace(online);
        if previous != online {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        previous != online
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receivers_observe_changes() {
        let monitor = ConnectivityMonitor::new(false);
        let mut receiver = monitor.subscribe();
        assert!(!*receiver.borrow_and_update());

        assert!(monitor.set_online(true));
        receiver.changed().await.unwrap();
        assert!(*receiver.borrow_and_update());

        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
    }

    #[test]
    fn test_works_without_receivers() {
        let monitor = ConnectivityMonitor::default();
        assert!(monitor.set_online(true));
        assert!(monitor.clone().is_online());
    }
}
