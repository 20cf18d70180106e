use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Connectivity as seen by the engine
pub trait NetworkState: Send + Sync {
    fn is_online(&self) -> bool;

    fn is_wifi(&self) -> bool;

    /// Receiver that observes every online/offline transition
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag fed by the host (or by tests)
pub struct NetworkMonitor {
    online: watch::Sender<bool>,
    wifi: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        Self {
            online,
            wifi: AtomicBool::new(false),
        }
    }

    /// Update connectivity; subscribers only wake on actual changes
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed: online={}", online);
        }
    }

    /// Update the wifi flag. Gaining wifi while online wakes subscribers
    /// so a wifi-only queue picks up again.
    pub fn set_wifi(&self, wifi: bool) {
        let was = self.wifi.swap(wifi, Ordering::SeqCst);
        if wifi && !was && self.is_online() {
            tracing::info!("Connected to wifi");
            self.online.send_modify(|_| {});
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkState for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn is_wifi(&self) -> bool {
        self.is_online() && self.wifi.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}
