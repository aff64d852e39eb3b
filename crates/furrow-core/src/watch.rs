// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Device-announcement watchers.
//!
//! A client watching a gateway (typically the mobile app during
//! provisioning) receives every `deviceAnnounced` frame that gateway sends,
//! forwarded verbatim. One watcher per gateway; a new registration replaces
//! the previous one.

use std::collections::HashMap;
use std::sync::Mutex;

use furrow_protocol::AnnouncedDevice;
use tokio::sync::mpsc;
use tracing::debug;

/// Map from gateway identifier to its announcement watcher.
#[derive(Default)]
pub struct WatcherRegistry {
    inner: Mutex<HashMap<String, mpsc::UnboundedSender<AnnouncedDevice>>>,
}

impl WatcherRegistry {
    /// Create an empty watcher registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher for `gateway_id`, replacing any previous watcher.
    /// The returned receiver yields announcements until unwatched or
    /// replaced.
    pub fn watch(&self, gateway_id: &str) -> mpsc::UnboundedReceiver<AnnouncedDevice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("watcher lock poisoned")
            .insert(gateway_id.to_string(), tx);
        rx
    }

    /// Drop the watcher for `gateway_id`, if any.
    pub fn unwatch(&self, gateway_id: &str) {
        self.inner
            .lock()
            .expect("watcher lock poisoned")
            .remove(gateway_id);
    }

    /// Forward an announcement to the gateway's watcher. Returns whether a
    /// live watcher received it; a missing or hung-up watcher is not an
    /// error.
    pub fn notify(&self, gateway_id: &str, device: AnnouncedDevice) -> bool {
        let mut inner = self.inner.lock().expect("watcher lock poisoned");
        match inner.get(gateway_id) {
            Some(tx) => {
                if tx.send(device).is_ok() {
                    true
                } else {
                    // receiver dropped without unwatching
                    inner.remove(gateway_id);
                    debug!(gateway_id, "dropped hung-up announcement watcher");
                    false
                }
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> AnnouncedDevice {
        AnnouncedDevice {
            name: "Front lawn".to_string(),
            id: id.to_string(),
            kind: "sprinkler".to_string(),
        }
    }

    #[test]
    fn test_notify_without_watcher() {
        let watchers = WatcherRegistry::new();
        assert!(!watchers.notify("hb-1", device("d-1")));
    }

    #[test]
    fn test_watch_and_notify() {
        let watchers = WatcherRegistry::new();
        let mut rx = watchers.watch("hb-1");

        assert!(watchers.notify("hb-1", device("d-1")));
        assert_eq!(rx.try_recv().unwrap().id, "d-1");
    }

    #[test]
    fn test_new_watcher_replaces_previous() {
        let watchers = WatcherRegistry::new();
        let mut first = watchers.watch("hb-1");
        let mut second = watchers.watch("hb-1");

        assert!(watchers.notify("hb-1", device("d-2")));
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap().id, "d-2");
    }

    #[test]
    fn test_hung_up_watcher_is_dropped() {
        let watchers = WatcherRegistry::new();
        let rx = watchers.watch("hb-1");
        drop(rx);

        assert!(!watchers.notify("hb-1", device("d-1")));
        // entry was cleaned up; still no watcher
        assert!(!watchers.notify("hb-1", device("d-1")));
    }

    #[test]
    fn test_unwatch() {
        let watchers = WatcherRegistry::new();
        let _rx = watchers.watch("hb-1");
        watchers.unwatch("hb-1");
        assert!(!watchers.notify("hb-1", device("d-1")));
    }
}
