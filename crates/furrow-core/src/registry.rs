// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide registry of live gateway connections.
//!
//! The registry is the single source of truth for "can I reach this gateway
//! right now". It maps a stable gateway identifier to the handle of its
//! current connection. Registration always succeeds (last writer wins, so a
//! reconnect simply replaces the previous mapping), and removal is
//! conditioned on handle identity: a slow-closing stale connection must
//! never evict the live one a gateway registered after reconnecting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use furrow_protocol::WireMessage;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// The control stream is established and frames flow both ways.
    Open = 0,
    /// The session decided to close (e.g. malformed frame); no new sends.
    Closing = 1,
    /// The connection is gone.
    Closed = 2,
}

/// Handle to one live gateway connection.
///
/// The handle is cheap to clone; all clones share the outbound queue and
/// connection state. Identity (for conditional removal) is the `handle_id`,
/// minted once per connection, never the gateway identifier.
#[derive(Clone)]
pub struct GatewayHandle {
    gateway_id: String,
    handle_id: Uuid,
    outbound: mpsc::UnboundedSender<WireMessage>,
    state: Arc<AtomicU8>,
}

impl GatewayHandle {
    /// Create a handle for a freshly registered connection. `outbound` is
    /// drained by the connection's writer task.
    pub fn new(gateway_id: &str, outbound: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            handle_id: Uuid::new_v4(),
            outbound,
            state: Arc::new(AtomicU8::new(ConnectionState::Open as u8)),
        }
    }

    /// The stable gateway identifier this connection registered as.
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Identity of this specific connection, stable across clones.
    pub fn handle_id(&self) -> Uuid {
        self.handle_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Transition the connection state (shared across all clones).
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the connection can still carry outbound messages.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.outbound.is_closed()
    }

    /// Queue a message for the connection's writer task. Returns false when
    /// the connection is no longer open.
    pub fn send(&self, msg: WireMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.send(msg).is_ok()
    }
}

impl std::fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("gateway_id", &self.gateway_id)
            .field("handle_id", &self.handle_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Map from gateway identifier to its canonical live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, GatewayHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for the handle's gateway. Always
    /// succeeds; the previous handle (if any) simply becomes unreachable
    /// through lookup.
    pub fn register(&self, handle: GatewayHandle) {
        let gateway_id = handle.gateway_id().to_string();
        let replaced = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .insert(gateway_id.clone(), handle);
        if let Some(old) = replaced {
            debug!(
                %gateway_id,
                old_handle = %old.handle_id(),
                "replaced existing gateway connection"
            );
        }
    }

    /// Look up the canonical connection for a gateway. Absence means "not
    /// reachable", not an error.
    pub fn lookup(&self, gateway_id: &str) -> Option<GatewayHandle> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(gateway_id)
            .cloned()
    }

    /// Remove the mapping for `gateway_id`, but only if it still points at
    /// the connection identified by `handle_id`. Returns whether an entry
    /// was removed. Idempotent; called from close/error paths.
    pub fn remove_if(&self, gateway_id: &str, handle_id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner.get(gateway_id) {
            Some(current) if current.handle_id() == handle_id => {
                inner.remove(gateway_id);
                true
            }
            _ => false,
        }
    }

    /// Number of registered gateways.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// Whether no gateways are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(gateway_id: &str) -> (GatewayHandle, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (GatewayHandle::new(gateway_id, tx), rx)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup("hb-1").is_none());

        let (h, _rx) = handle("hb-1");
        registry.register(h.clone());

        let found = registry.lookup("hb-1").unwrap();
        assert_eq!(found.handle_id(), h.handle_id());
        assert_eq!(found.gateway_id(), "hb-1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replacement_last_writer_wins() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle("hb-1");
        let (b, _rx_b) = handle("hb-1");

        registry.register(a);
        registry.register(b.clone());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("hb-1").unwrap().handle_id(), b.handle_id());
    }

    #[test]
    fn test_remove_conditioned_on_handle() {
        // Reconnect race: register A, register B over it, then A's close
        // event fires. Lookup must still return B.
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle("hb-1");
        let (b, _rx_b) = handle("hb-1");

        registry.register(a.clone());
        registry.register(b.clone());

        assert!(!registry.remove_if("hb-1", a.handle_id()));
        assert_eq!(registry.lookup("hb-1").unwrap().handle_id(), b.handle_id());

        assert!(registry.remove_if("hb-1", b.handle_id()));
        assert!(registry.lookup("hb-1").is_none());
        // second removal is a no-op
        assert!(!registry.remove_if("hb-1", b.handle_id()));
    }

    #[test]
    fn test_send_routes_to_writer_queue() {
        let (h, mut rx) = handle("hb-1");
        assert!(h.send(WireMessage::PingGateway {
            request_id: "r1".to_string()
        }));

        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg, WireMessage::PingGateway { request_id } if request_id == "r1"));
    }

    #[test]
    fn test_send_fails_after_close() {
        let (h, rx) = handle("hb-1");
        drop(rx); // writer task gone
        assert!(!h.is_open());
        assert!(!h.send(WireMessage::PingGateway {
            request_id: "r1".to_string()
        }));
    }

    #[test]
    fn test_send_fails_when_closing() {
        let (h, _rx) = handle("hb-1");
        h.set_state(ConnectionState::Closing);
        assert!(!h.is_open());
        assert!(!h.send(WireMessage::PingGateway {
            request_id: "r1".to_string()
        }));
        assert_eq!(h.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_state_shared_across_clones() {
        let (h, _rx) = handle("hb-1");
        let clone = h.clone();
        clone.set_state(ConnectionState::Closed);
        assert_eq!(h.state(), ConnectionState::Closed);
    }
}
