// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command/acknowledgment protocol engine.
//!
//! The engine sends a typed message to a target gateway, registers a
//! correlation entry, and suspends the caller until the matching reply
//! arrives or the deadline elapses. Concurrent calls for different
//! identifiers never block one another; the only suspension point is the
//! caller's own oneshot wait.

use std::sync::Arc;
use std::time::Duration;

use furrow_protocol::WireMessage;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::correlation::{CorrelationTable, RequestKind, RequestSubject, Resolution};
use crate::error::CommandError;
use crate::registry::ConnectionRegistry;

/// Sends correlated requests to gateways and resolves their replies.
pub struct CommandEngine {
    registry: Arc<ConnectionRegistry>,
    table: Arc<CorrelationTable>,
    auth_key: String,
}

impl CommandEngine {
    /// Create an engine over the shared registry and correlation table.
    /// `auth_key` is embedded in every zone command frame.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        table: Arc<CorrelationTable>,
        auth_key: String,
    ) -> Self {
        Self {
            registry,
            table,
            auth_key,
        }
    }

    /// The shared connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The shared correlation table.
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// Register a correlation entry and send the request frame, without
    /// waiting. If no live connection exists no entry is created and
    /// UNREACHABLE is returned immediately.
    fn begin(
        &self,
        gateway_id: &str,
        kind: RequestKind,
        subject: RequestSubject,
        build: impl FnOnce(String) -> WireMessage,
        ttl: Duration,
    ) -> Result<(String, oneshot::Receiver<Resolution>), CommandError> {
        let handle = self
            .registry
            .lookup(gateway_id)
            .filter(|h| h.is_open())
            .ok_or_else(|| CommandError::Unreachable {
                gateway_id: gateway_id.to_string(),
            })?;

        let (request_id, rx) = self.table.insert(kind, subject, ttl);
        let msg = build(request_id.clone());

        if !handle.send(msg) {
            // the writer task went away between lookup and send
            self.table.take(&request_id);
            return Err(CommandError::Unreachable {
                gateway_id: gateway_id.to_string(),
            });
        }

        debug!(gateway_id, %request_id, ?kind, "request dispatched");
        Ok((request_id, rx))
    }

    /// Register and send a gateway ping without waiting for the reply.
    /// The prober uses this to fire one ping per gateway in parallel and
    /// then poll the outstanding count.
    pub fn begin_gateway_ping(
        &self,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<(String, oneshot::Receiver<Resolution>), CommandError> {
        self.begin(
            gateway_id,
            RequestKind::GatewayPing,
            RequestSubject::gateway(gateway_id),
            |request_id| WireMessage::PingGateway { request_id },
            ttl,
        )
    }

    /// Ping a gateway and wait for its reply.
    pub async fn ping_gateway(
        &self,
        gateway_id: &str,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let (request_id, rx) = self.begin_gateway_ping(gateway_id, timeout)?;
        self.await_resolution(gateway_id, request_id, rx, timeout)
            .await
    }

    /// Ping one peripheral through its gateway and wait for the relayed
    /// reply. An `online: false` reply surfaces as REJECTED.
    pub async fn ping_peripheral(
        &self,
        gateway_id: &str,
        device_id: &str,
        local_name: &str,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let local = local_name.to_string();
        let (request_id, rx) = self.begin(
            gateway_id,
            RequestKind::PeripheralPing,
            RequestSubject::peripheral(gateway_id, device_id, local_name),
            |request_id| WireMessage::PingPeripheral {
                request_id,
                local_name: local,
            },
            timeout,
        )?;
        self.await_resolution(gateway_id, request_id, rx, timeout)
            .await
    }

    /// Send a zone actuation command and wait for its acknowledgment.
    pub async fn zone_command(
        &self,
        gateway_id: &str,
        device_id: &str,
        local_name: &str,
        zone: u8,
        on: bool,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let local = local_name.to_string();
        let auth_key = self.auth_key.clone();
        let (request_id, rx) = self.begin(
            gateway_id,
            RequestKind::ZoneCommand,
            RequestSubject::peripheral(gateway_id, device_id, local_name),
            |request_id| WireMessage::Command {
                request_id,
                local_name: local,
                zone,
                on,
                auth_key,
            },
            timeout,
        )?;
        self.await_resolution(gateway_id, request_id, rx, timeout)
            .await
    }

    /// Fire-and-forget send for messages that expect no reply (e.g. the
    /// provisioning-mode toggles). No correlation entry is created; returns
    /// whether a live connection existed.
    pub fn send_no_ack(&self, gateway_id: &str, msg: WireMessage) -> bool {
        match self.registry.lookup(gateway_id) {
            Some(handle) => handle.send(msg),
            None => false,
        }
    }

    /// Resolve an inbound reply frame against the correlation table.
    /// Returns whether a pending entry was resolved; a reply whose
    /// identifier is no longer in the table is stale and is dropped here.
    pub fn resolve_reply(&self, msg: &WireMessage) -> bool {
        let success = match msg {
            WireMessage::PongGateway { online, .. }
            | WireMessage::PongPeripheral { online, .. } => *online,
            WireMessage::CommandAck { success, .. } => *success,
            _ => return false,
        };
        // is_reply() guarantees request_id is present for the arms above
        let Some(request_id) = msg.request_id() else {
            return false;
        };

        match self.table.take(request_id) {
            Some(pending) => {
                pending.resolve(Resolution::Reply { success });
                true
            }
            None => {
                debug!(request_id, "stale reply for unknown identifier, dropped");
                false
            }
        }
    }

    /// Suspend until the request resolves or the deadline elapses.
    async fn await_resolution(
        &self,
        gateway_id: &str,
        request_id: String,
        mut rx: oneshot::Receiver<Resolution>,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        enum Waited {
            Resolved(Resolution),
            // responder dropped: the connection closed or the entry was
            // purged by an offline cascade
            ChannelClosed,
            Elapsed,
        }

        let waited = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => Waited::Resolved(resolution),
            Ok(Err(_)) => Waited::ChannelClosed,
            Err(_elapsed) => {
                // The deadline elapsed. Whoever removes the entry owns the
                // resolution; if the reply dispatcher already took it, its
                // outcome is sitting in the channel.
                match self.table.take(&request_id) {
                    Some(_) => Waited::Elapsed,
                    None => match rx.try_recv() {
                        Ok(resolution) => Waited::Resolved(resolution),
                        Err(_) => Waited::Elapsed,
                    },
                }
            }
        };

        match waited {
            Waited::Resolved(Resolution::Reply { success: true }) => Ok(()),
            Waited::Resolved(Resolution::Reply { success: false }) => {
                warn!(gateway_id, %request_id, "request rejected by gateway");
                Err(CommandError::Rejected {
                    gateway_id: gateway_id.to_string(),
                    request_id,
                })
            }
            Waited::Resolved(Resolution::Expired) | Waited::Elapsed => Err(CommandError::Timeout {
                request_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Waited::ChannelClosed => Err(CommandError::Unreachable {
                gateway_id: gateway_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GatewayHandle;
    use tokio::sync::mpsc;

    fn engine() -> (Arc<CommandEngine>, Arc<ConnectionRegistry>, Arc<CorrelationTable>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let table = Arc::new(CorrelationTable::new());
        let engine = Arc::new(CommandEngine::new(
            registry.clone(),
            table.clone(),
            "123456".to_string(),
        ));
        (engine, registry, table)
    }

    fn connect(
        registry: &ConnectionRegistry,
        gateway_id: &str,
    ) -> mpsc::UnboundedReceiver<WireMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(GatewayHandle::new(gateway_id, tx));
        rx
    }

    #[tokio::test]
    async fn test_unreachable_creates_no_entry() {
        let (engine, _registry, table) = engine();

        let err = engine
            .ping_gateway("hb-1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Unreachable { gateway_id } if gateway_id == "hb-1"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_ping_gateway_success() {
        let (engine, registry, table) = engine();
        let mut gw = connect(&registry, "hb-1");

        let ping_engine = engine.clone();
        let caller = tokio::spawn(async move {
            ping_engine
                .ping_gateway("hb-1", Duration::from_secs(2))
                .await
        });

        // the simulated gateway echoes the identifier back
        let sent = gw.recv().await.unwrap();
        let WireMessage::PingGateway { request_id } = sent else {
            panic!("expected pingGateway, got {:?}", sent);
        };
        assert!(engine.resolve_reply(&WireMessage::PongGateway {
            request_id,
            online: true,
        }));

        caller.await.unwrap().unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_zone_command_rejected() {
        let (engine, registry, _table) = engine();
        let mut gw = connect(&registry, "hb-1");

        let cmd_engine = engine.clone();
        let caller = tokio::spawn(async move {
            cmd_engine
                .zone_command("hb-1", "d-1", "esp-front", 2, true, Duration::from_secs(2))
                .await
        });

        let sent = gw.recv().await.unwrap();
        let WireMessage::Command {
            request_id,
            local_name,
            zone,
            on,
            auth_key,
        } = sent
        else {
            panic!("expected command");
        };
        assert_eq!(local_name, "esp-front");
        assert_eq!(zone, 2);
        assert!(on);
        assert_eq!(auth_key, "123456");

        engine.resolve_reply(&WireMessage::CommandAck {
            request_id,
            success: false,
        });

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let (engine, registry, table) = engine();
        let _gw = connect(&registry, "hb-1");

        let err = engine
            .ping_gateway("hb-1", Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(table.is_empty(), "timed-out entry must not leak");
    }

    #[tokio::test]
    async fn test_late_reply_is_stale_and_dropped() {
        let (engine, registry, _table) = engine();
        let mut gw = connect(&registry, "hb-1");

        let err = engine
            .ping_peripheral("hb-1", "d-1", "esp-front", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));

        let sent = gw.recv().await.unwrap();
        let request_id = sent.request_id().unwrap().to_string();

        // reply arrives after the timeout already resolved the caller
        let resolved = engine.resolve_reply(&WireMessage::PongPeripheral {
            request_id,
            online: true,
        });
        assert!(!resolved);
    }

    #[tokio::test]
    async fn test_dropped_connection_resolves_unreachable() {
        let (engine, registry, table) = engine();
        let gw = connect(&registry, "hb-1");

        let ping_engine = engine.clone();
        let caller = tokio::spawn(async move {
            ping_engine
                .ping_gateway("hb-1", Duration::from_secs(5))
                .await
        });

        // wait for the entry to appear, then purge as the session teardown does
        while table.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(gw);
        for (_, pending) in table.take_for_gateway("hb-1") {
            drop(pending);
        }

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_calls_do_not_block_each_other() {
        let (engine, registry, _table) = engine();
        let mut gw = connect(&registry, "hb-1");

        // first caller will never get a reply; second resolves immediately.
        let slow_engine = engine.clone();
        let slow = tokio::spawn(async move {
            slow_engine
                .ping_peripheral("hb-1", "d-slow", "esp-slow", Duration::from_secs(2))
                .await
        });
        let _slow_ping = gw.recv().await.unwrap();

        let fast_engine = engine.clone();
        let fast = tokio::spawn(async move {
            fast_engine
                .ping_peripheral("hb-1", "d-fast", "esp-fast", Duration::from_secs(2))
                .await
        });
        let fast_ping = gw.recv().await.unwrap();
        engine.resolve_reply(&WireMessage::PongPeripheral {
            request_id: fast_ping.request_id().unwrap().to_string(),
            online: true,
        });

        // the fast caller resolves while the slow one is still suspended
        fast.await.unwrap().unwrap();
        assert!(!slow.is_finished());
        slow.abort();
    }

    #[tokio::test]
    async fn test_send_no_ack() {
        let (engine, registry, table) = engine();

        assert!(!engine.send_no_ack(
            "hb-1",
            WireMessage::PingGateway {
                request_id: "r".to_string()
            }
        ));

        let mut gw = connect(&registry, "hb-1");
        assert!(engine.send_no_ack(
            "hb-1",
            WireMessage::PingGateway {
                request_id: "r".to_string()
            }
        ));
        assert!(gw.try_recv().is_ok());
        assert!(table.is_empty(), "send_no_ack must not register entries");
    }
}
