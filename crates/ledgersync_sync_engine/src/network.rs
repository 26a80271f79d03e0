//! Connectivity and app-lifecycle signals.

use crate::listeners::{Listeners, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A platform signal fed into the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    /// Connectivity was gained.
    Online,
    /// Connectivity was lost.
    Offline,
    /// The app or window regained focus.
    Focus,
}

/// Tracks connectivity and notifies subscribers of transitions.
///
/// Notifications are edge-triggered: reporting `Online` while already online
/// notifies nobody. Focus signals are always forwarded.
pub struct NetworkMonitor {
    online: AtomicBool,
    listeners: Listeners<LifecycleSignal>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial connectivity.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            listeners: Listeners::new(),
        }
    }

    /// Returns the current connectivity.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records connectivity. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return false;
        }
        debug!(online, "connectivity changed");
        self.listeners.notify(&if online {
            LifecycleSignal::Online
        } else {
            LifecycleSignal::Offline
        });
        true
    }

    /// Records a focus regain.
    pub fn focus(&self) {
        self.listeners.notify(&LifecycleSignal::Focus);
    }

    /// Feeds one platform signal.
    pub fn signal(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::Online => {
                self.set_online(true);
            }
            LifecycleSignal::Offline => {
                self.set_online(false);
            }
            LifecycleSignal::Focus => self.focus(),
        }
    }

    /// Registers a listener for transitions and focus signals.
    pub fn subscribe(
        &self,
        listener: impl Fn(&LifecycleSignal) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .finish()
    }
}
